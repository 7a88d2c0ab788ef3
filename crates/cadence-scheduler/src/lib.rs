//! Scheduling core for Cadence.
//!
//! Resolves consistent material revisions across fan-in dependency graphs,
//! queues build causes, creates pipeline instances under per-pipeline locks
//! and drives the stage/job state machine.

pub mod config;
pub mod graph;
pub mod health;
pub mod lock;
pub mod pause;
pub mod producer;
pub mod queue;
pub mod resolver;
pub mod scheduler;
pub mod stages;
pub mod transaction;
pub mod vsm;

pub use config::SchedulerConfig;
pub use scheduler::{DrainReport, ScheduleService, SchedulerPorts};
