//! Command handlers.

use crate::commands::{OutputFormat, parse_pair};
use crate::output::{print_instance, print_operation, print_structured, revisions_table, vsm_table};
use crate::workspace::{Session, Workspace};
use anyhow::{Context, bail};
use cadence_core::material::Fingerprint;
use cadence_core::ports::PipelineRepository;
use cadence_notify::{NotificationChannel, NotificationListener, NotificationTrigger, RecordingSender, WebhookConfig};
use console::style;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

pub async fn resolve(session: &Session, pipeline: &str, format: OutputFormat) -> anyhow::Result<()> {
    let config = session
        .config
        .pipeline(pipeline)
        .with_context(|| format!("Pipeline '{}' not found", pipeline))?;

    let previous = session
        .repo
        .most_recent(pipeline)
        .await?
        .map(|instance| instance.build_cause.material_revisions);
    let producer = session.service.producer();
    let Some(observed) = producer.observe(config, previous.as_ref()).await? else {
        bail!("Pipeline '{}' has a material without any known revision", pipeline);
    };
    let resolved = producer
        .resolver()
        .resolve(&session.config, config, observed, &HashSet::new())
        .await?;

    if !print_structured(format, &resolved)? {
        println!("Resolved revisions for {}:", style(pipeline).bold());
        print!("{}", revisions_table(&resolved));
    }
    Ok(())
}

#[derive(Serialize)]
struct ScheduleOutput {
    message: String,
    created: Option<cadence_core::instance::PipelineInstance>,
    drain: cadence_scheduler::DrainReport,
    notifications: Vec<cadence_notify::NotificationPayload>,
}

pub async fn schedule(
    workspace: &Workspace,
    session: &Session,
    pipeline: &str,
    user: &str,
    revisions: &[String],
    env: &[String],
    format: OutputFormat,
) -> anyhow::Result<()> {
    let mut overrides: BTreeMap<Fingerprint, String> = BTreeMap::new();
    for arg in revisions {
        let (material, revision) = parse_pair(arg)?;
        let fingerprint = workspace
            .fingerprint_of(pipeline, &material)
            .with_context(|| format!("Pipeline '{}' has no material '{}'", pipeline, material))?;
        overrides.insert(fingerprint, revision);
    }
    let variables = env.iter().map(|arg| parse_pair(arg)).collect::<anyhow::Result<BTreeMap<_, _>>>()?;

    let recorder = RecordingSender::new();
    let channel = NotificationChannel::new("cli", WebhookConfig::default()).with_triggers(&[
        NotificationTrigger::PipelineScheduled,
        NotificationTrigger::StageScheduled,
        NotificationTrigger::PipelineLocked,
    ]);
    session
        .service
        .register_listener(Arc::new(NotificationListener::new(channel, Arc::new(recorder.clone()))))
        .await;

    let result = session.service.schedule_manual(pipeline, user, &overrides, variables).await;
    if !result.is_success() {
        print_operation(&result);
        bail!("{}", result.message);
    }

    let drain = session.service.schedule_auto().await;
    let created = match drain.scheduled.iter().find(|id| id.name == pipeline) {
        Some(id) => session.repo.find_instance(&id.name, id.counter).await?,
        None => None,
    };

    let output = ScheduleOutput {
        message: result.message.clone(),
        created,
        drain,
        notifications: recorder.sent().await,
    };
    if print_structured(format, &output)? {
        return Ok(());
    }

    print_operation(&result);
    match &output.created {
        Some(instance) => print_instance(instance),
        None => {
            for (name, reason) in &output.drain.failed {
                println!("{} {}: {}", style("✗").red(), name, reason);
            }
        }
    }
    for payload in &output.notifications {
        println!("{} {}", style("→").blue(), payload.title);
    }
    Ok(())
}

pub async fn vsm(session: &Session, pipeline: &str, counter: u32, user: &str, format: OutputFormat) -> anyhow::Result<()> {
    let result = session.service.get_value_stream_graph(pipeline, counter, user).await;
    let Some(map) = result.value.as_ref() else {
        print_operation(&result);
        bail!("{}", result.message);
    };

    if !print_structured(format, map)? {
        println!("Value stream map of {}/{}", style(pipeline).bold(), counter);
        print!("{}", vsm_table(map));
    }
    Ok(())
}

pub fn schema() -> anyhow::Result<()> {
    let schema = schemars::schema_for!(Workspace);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}
