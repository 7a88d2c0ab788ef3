//! Pipeline label rendering.
//!
//! Templates reference `${COUNT}` and `${<material name>}`. Material names
//! are matched case-insensitively; an SCM revision is shortened to its first
//! eight characters and a dependency revision renders as the upstream label.

use crate::material::MaterialRevisions;
use crate::{Error, Result};
use regex::Regex;
use std::sync::LazyLock;

const COUNT: &str = "COUNT";
const REVISION_DISPLAY_LEN: usize = 8;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("placeholder pattern is valid"));

/// Renders `template` for the run numbered `counter` built from `revisions`.
pub fn render_label(template: &str, counter: u32, revisions: &MaterialRevisions) -> Result<String> {
    let mut unresolved = None;
    let label = PLACEHOLDER.replace_all(template, |caps: &regex::Captures| {
        let key = caps.get(1).map_or("", |m| m.as_str()).trim();
        match resolve(key, counter, revisions) {
            Some(value) => value,
            None => {
                unresolved.get_or_insert_with(|| key.to_string());
                String::new()
            }
        }
    });

    match unresolved {
        Some(key) => Err(Error::InvalidRequest(format!(
            "Unable to resolve '${{{}}}' in label template '{}'",
            key, template
        ))),
        None => Ok(label.into_owned()),
    }
}

fn resolve(key: &str, counter: u32, revisions: &MaterialRevisions) -> Option<String> {
    if key.eq_ignore_ascii_case(COUNT) {
        return Some(counter.to_string());
    }

    let revision = revisions
        .iter()
        .find(|r| r.material.name().eq_ignore_ascii_case(key))?;
    let modification = revision.latest_modification()?;

    if revision.material.is_dependency() {
        return modification
            .pipeline_label
            .clone()
            .or_else(|| Some(modification.revision.clone()));
    }
    Some(modification.revision.chars().take(REVISION_DISPLAY_LEN).collect())
}
