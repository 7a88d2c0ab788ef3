//! In-memory adapters for Cadence.
//!
//! Every port the scheduler consumes has an implementation here that keeps
//! its state in process memory. The CLI loads workspace files into these and
//! the test suites build fixtures on top of them.

pub mod config;
pub mod permissions;
pub mod poller;
pub mod repositories;

pub use config::MemoryConfigSource;
pub use permissions::{StaticDiskSpace, StaticPermissions};
pub use poller::MemoryMaterialPoller;
pub use repositories::*;
