//! Serialization tests for cadence-core types.

use cadence_core::build_cause::BuildCause;
use cadence_core::instance::*;
use cadence_core::material::*;
use cadence_core::pipeline::*;
use chrono::Utc;
use pretty_assertions::assert_eq;

#[test]
fn test_config_snapshot_from_yaml() {
    let yaml = r#"
pipelines:
  - name: up
    materials:
      - type: scm
        kind: hg
        url: http://hg.example.com/repo
        folder: dirOne
    stages:
      - name: dev
        jobs:
          - name: unit
  - name: down
    label_template: "${COUNT}-${up}"
    lock_behavior: unlock_when_finished
    materials:
      - type: dependency
        pipeline: up
        stage: dev
    stages:
      - name: deploy
        approval: manual
        jobs:
          - name: ship
"#;
    let snapshot: ConfigSnapshot = serde_yaml::from_str(yaml).expect("deserialize");
    assert_eq!(snapshot.pipeline_names(), vec!["up".to_string(), "down".to_string()]);

    let down = snapshot.pipeline("down").expect("down");
    assert_eq!(down.lock_behavior, LockBehavior::UnlockWhenFinished);
    assert!(down.stages[0].requires_approval());
    assert!(down.declares(&Material::dependency("up", "dev").fingerprint()));

    let up = snapshot.pipeline("up").expect("up");
    let folder = Material::Scm(
        ScmMaterial::new(ScmKind::Hg, "http://hg.example.com/repo").with_folder("dirOne"),
    );
    assert!(up.declares(&folder.fingerprint()));
}

#[test]
fn test_pipeline_instance_roundtrip() {
    let revisions: MaterialRevisions = vec![
        MaterialRevision::new(
            Material::git("https://example.com/repo"),
            vec![Modification::new("abc123", Utc::now()).with_user("dev")],
        )
        .mark_changed(),
    ]
    .into();
    let mut instance = PipelineInstance::new(
        "cruise",
        3,
        "3",
        BuildCause::with_modifications(revisions, "changes"),
        vec!["dev".to_string()],
    );
    let identifier = instance.identifier();
    instance.stages.push(StageInstance::schedule(
        &identifier,
        &StageConfig::new("dev", &["unit"]),
        1,
        1,
        "changes",
    ));

    let json = serde_json::to_string(&instance).expect("serialize");
    let parsed: PipelineInstance = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(parsed, instance);
    assert_eq!(parsed.build_cause.message(), "modified by dev");
}

#[test]
fn test_mark_changes_since_previous_build() {
    let now = Utc::now();
    let git = Material::git("https://example.com/repo");
    let svn = Material::svn("https://example.com/svn");
    let previous: MaterialRevisions = vec![
        MaterialRevision::new(git.clone(), vec![Modification::new("1", now)]),
        MaterialRevision::new(svn.clone(), vec![Modification::new("10", now)]),
    ]
    .into();

    let mut current: MaterialRevisions = vec![
        MaterialRevision::new(git.clone(), vec![Modification::new("2", now)]),
        MaterialRevision::new(svn.clone(), vec![Modification::new("10", now)]),
    ]
    .into();
    current.mark_changes_since(Some(&previous));
    let flags: Vec<bool> = current.iter().map(|r| r.changed).collect();
    assert_eq!(flags, vec![true, false]);
    assert!(current.has_changed_since(&previous));

    current.mark_changes_since(None);
    assert!(current.iter().all(|r| r.changed));
}
