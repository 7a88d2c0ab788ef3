//! Rendering of command results.

use crate::commands::OutputFormat;
use cadence_core::instance::PipelineInstance;
use cadence_core::material::MaterialRevisions;
use cadence_core::operation::OperationResult;
use cadence_scheduler::vsm::{ValueStreamMap, ViewType};
use console::style;
use serde::Serialize;

/// Print `value` as JSON or YAML. Returns false for table output.
pub fn print_structured<T: Serialize>(format: OutputFormat, value: &T) -> anyhow::Result<bool> {
    match format {
        OutputFormat::Table => Ok(false),
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(value)?);
            Ok(true)
        }
        OutputFormat::Yaml => {
            print!("{}", serde_yaml::to_string(value)?);
            Ok(true)
        }
    }
}

pub fn revisions_table(revisions: &MaterialRevisions) -> String {
    let mut out = String::new();
    for revision in revisions.iter() {
        let marker = if revision.changed { "*" } else { " " };
        let label = revision
            .latest_modification()
            .and_then(|m| m.pipeline_label.as_deref())
            .map(|l| format!(" (label {})", l))
            .unwrap_or_default();
        out.push_str(&format!(
            "{} {:<48} {}{}\n",
            marker,
            revision.material.name(),
            revision.latest_revision().unwrap_or("-"),
            label
        ));
    }
    out
}

pub fn print_operation<T>(result: &OperationResult<T>) {
    let mark = if result.is_success() {
        style("✓").green()
    } else {
        style("✗").red()
    };
    println!("{} {} ({:?})", mark, result.message, result.status);
}

pub fn print_instance(instance: &PipelineInstance) {
    println!(
        "{} {}/{} label {}",
        style("Created").bold(),
        instance.name,
        instance.counter,
        instance.label
    );
    println!("  {}", instance.build_cause.message());
    for stage in &instance.stages {
        println!("  stage {} #{}: {:?}", stage.name, stage.counter, stage.state());
    }
    print!("{}", revisions_table(&instance.build_cause.material_revisions));
}

pub fn vsm_table(map: &ValueStreamMap) -> String {
    let mut out = String::new();
    for nodes in map.levels() {
        let level = nodes.first().map(|n| n.level).unwrap_or_default();
        out.push_str(&format!("level {}\n", level));
        for node in nodes {
            let revisions: Vec<String> = node
                .revisions
                .iter()
                .map(|r| match &r.label {
                    Some(label) => format!("{} ({})", r.revision, label),
                    None => r.revision.clone(),
                })
                .collect();
            out.push_str(&format!("  {:?} {} [{}]", node.kind, node.name, revisions.join(", ")));
            match (node.view_type, &node.message) {
                (Some(ViewType::Warning), Some(message)) => out.push_str(&format!(" warning: {}", message)),
                (Some(_), Some(message)) => out.push_str(&format!(" ({})", message)),
                _ => {}
            }
            out.push('\n');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::material::{Material, MaterialRevision, Modification};
    use chrono::Utc;

    #[test]
    fn test_revisions_table_marks_changes() {
        let mut revisions = MaterialRevisions::new();
        revisions.push(
            MaterialRevision::new(
                Material::git("https://example.com/cruise"),
                vec![Modification::new("abc123", Utc::now())],
            )
            .mark_changed(),
        );
        revisions.push(MaterialRevision::new(
            Material::svn("https://example.com/tools"),
            vec![Modification::new("42", Utc::now())],
        ));

        let table = revisions_table(&revisions);
        let lines: Vec<&str> = table.lines().collect();
        assert!(lines[0].starts_with("* https://example.com/cruise"));
        assert!(lines[0].ends_with("abc123"));
        assert!(lines[1].starts_with("  https://example.com/tools"));
    }

    #[test]
    fn test_table_format_is_not_structured() {
        assert!(!print_structured(OutputFormat::Table, &vec![1, 2]).unwrap());
    }
}
