//! End-to-end diff, pull and push through `EsvService` against a temp
//! configuration repository.

mod common;

use std::collections::BTreeMap;

use common::{EnvironmentBuilder, Outcome, TestHarness, VariableFileBuilder};
use esvsync::esv::{VariableCreate, VariableDelete};
use esvsync::{Direction, EsvSyncError, FieldDiff};

fn values(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn create(name: &str, description: &str, pairs: &[(&str, &str)]) -> VariableCreate {
    VariableCreate {
        name: name.to_string(),
        description: Some(description.to_string()),
        expression_type: "string".to_string(),
        values: values(pairs),
    }
}

#[test]
fn test_new_environment_value_shows_up_as_partial_create() {
    let h = TestHarness::new();
    h.add_environment("DEV");
    h.add_environment("SBX");
    h.service
        .create_variables(h.owner, &[create("esv-v1", "d", &[("DEV", "1")])])
        .unwrap();
    h.write_variable("DEV", &VariableFileBuilder::new("esv-v1", "1").description("d"));
    h.write_variable("SBX", &VariableFileBuilder::new("esv-v1", "2").description("d"));

    let plan = h.service.diff(h.owner, Direction::Pull).unwrap();

    assert!(plan.update.is_empty());
    assert!(plan.delete.is_empty());
    assert_eq!(plan.create.len(), 1);
    let entry = &plan.create[0];
    assert_eq!(entry.name, "esv-v1");
    assert_eq!(entry.description, FieldDiff::Value(Some("d".to_string())));
    assert_eq!(entry.values.len(), 1);
    assert_eq!(entry.value_for("SBX"), Some("2"));
}

#[test]
fn test_variable_absent_from_repository_is_full_delete() {
    let h = TestHarness::new();
    h.add_environment("DEV");
    h.service
        .create_variables(h.owner, &[create("esv-v2", "", &[("DEV", "x")])])
        .unwrap();

    let plan = h.service.diff(h.owner, Direction::Pull).unwrap();

    assert!(plan.create.is_empty());
    assert!(plan.update.is_empty());
    assert_eq!(plan.delete.len(), 1);
    assert_eq!(plan.delete[0].name, "esv-v2");
    assert_eq!(plan.delete[0].value_for("DEV"), Some("x"));
}

#[test]
fn test_diff_without_environments_fails() {
    let h = TestHarness::new();
    let err = h.service.diff(h.owner, Direction::Pull).unwrap_err();
    assert!(matches!(err, EsvSyncError::NoEnvironments));
    assert_eq!(err.status_code(), 400);
}

#[test]
fn test_missing_variable_folder_is_source_not_found() {
    let h = TestHarness::new();
    h.add_environment("DEV");
    std::fs::remove_dir_all(h.variable_dir("DEV")).unwrap();

    let err = h.service.diff(h.owner, Direction::Pull).unwrap_err();
    assert!(matches!(err, EsvSyncError::SourceNotFound { ref environment, .. } if environment == "DEV"));
}

#[test]
fn test_apply_pull_then_second_diff_is_empty() {
    let h = TestHarness::new();
    h.add_environment("DEV");
    h.add_environment("PROD");
    h.write_variable("DEV", &VariableFileBuilder::new("esv-a", "dev-a").description("A"));
    h.write_variable("PROD", &VariableFileBuilder::new("esv-a", "prod-a").description("A"));
    h.write_variable(
        "DEV",
        &VariableFileBuilder::new("esv-list", "[1,2]").expression_type("array"),
    );
    h.write_raw("DEV", "broken.variable.json", "{ not json");

    let summary = h.service.apply_pull(h.owner).unwrap();
    assert_eq!(summary.variables_created, 2);
    assert_eq!(summary.values_created, 3);

    let second = h.service.apply_pull(h.owner).unwrap();
    assert!(second.is_noop());
    assert!(h.service.diff(h.owner, Direction::Pull).unwrap().is_empty());

    let a = h.service.get_variable(h.owner, "esv-a").unwrap();
    assert_eq!(a.values, values(&[("DEV", "dev-a"), ("PROD", "prod-a")]));
    assert_eq!(a.description.as_deref(), Some("A"));
    let list = h.service.get_variable(h.owner, "esv-list").unwrap();
    assert_eq!(list.expression_type, "array");
}

#[test]
fn test_apply_pull_follows_repository_changes() {
    let h = TestHarness::new();
    h.add_environment("DEV");
    h.write_variable("DEV", &VariableFileBuilder::new("esv-keep", "1"));
    h.write_variable("DEV", &VariableFileBuilder::new("esv-gone", "2"));
    h.service.apply_pull(h.owner).unwrap();

    h.write_variable("DEV", &VariableFileBuilder::new("esv-keep", "1b").description("new"));
    h.remove_variable("DEV", "esv-gone");
    let plan = h.service.diff(h.owner, Direction::Pull).unwrap();
    assert_eq!(plan.update.len(), 1);
    assert_eq!(
        plan.update[0].values["DEV"],
        FieldDiff::Changed {
            old: "1".to_string(),
            new: "1b".to_string()
        }
    );

    let summary = h.service.apply_pull(h.owner).unwrap();
    assert_eq!(summary.values_updated, 1);
    assert_eq!(summary.variables_deleted, 1);

    let names: Vec<String> = h
        .service
        .list_variables(h.owner)
        .unwrap()
        .into_iter()
        .map(|v| v.name)
        .collect();
    assert_eq!(names, vec!["esv-keep"]);
}

#[test]
fn test_empty_string_value_round_trips_without_changes() {
    let h = TestHarness::new();
    h.add_environment("DEV");
    h.write_variable("DEV", &VariableFileBuilder::new("esv-empty", ""));
    h.service.apply_pull(h.owner).unwrap();

    assert_eq!(
        h.service.get_variable(h.owner, "esv-empty").unwrap().values["DEV"],
        ""
    );
    assert!(h.service.diff(h.owner, Direction::Pull).unwrap().is_empty());

    h.write_variable("DEV", &VariableFileBuilder::new("esv-empty", " "));
    let plan = h.service.diff(h.owner, Direction::Pull).unwrap();
    assert_eq!(plan.update.len(), 1);
}

#[test]
fn test_push_diff_mirrors_pull_diff() {
    // Store holds S, repository holds T.
    let a = TestHarness::new();
    a.add_environment("DEV");
    a.service
        .create_variables(a.owner, &[create("esv-x", "s", &[("DEV", "s-value")])])
        .unwrap();
    a.write_variable("DEV", &VariableFileBuilder::new("esv-y", "t-only"));

    // Repository holds S, store holds T.
    let b = TestHarness::new();
    b.add_environment("DEV");
    b.write_variable("DEV", &VariableFileBuilder::new("esv-x", "s-value").description("s"));
    b.service
        .create_variables(b.owner, &[create("esv-y", "", &[("DEV", "t-only")])])
        .unwrap();

    let push = a.service.diff(a.owner, Direction::Push).unwrap();
    let pull = b.service.diff(b.owner, Direction::Pull).unwrap();
    assert_eq!(push, pull);
    assert_eq!(push.create[0].name, "esv-x");
    assert_eq!(push.delete[0].name, "esv-y");
}

#[test]
fn test_diff_is_isolated_per_owner() {
    let h = TestHarness::new();
    h.add_environment("DEV");
    h.write_variable("DEV", &VariableFileBuilder::new("esv-shared", "repo"));

    let bob = h.user("bob");
    h.add_environment_for(bob, EnvironmentBuilder::new("DEV").build());
    h.service
        .create_variables(bob, &[create("esv-shared", "", &[("DEV", "bob")])])
        .unwrap();

    let plan = h.service.diff(h.owner, Direction::Pull).unwrap();
    assert_eq!(plan.create.len(), 1);
    assert!(plan.update.is_empty());

    h.service.apply_pull(h.owner).unwrap();
    assert_eq!(
        h.service.get_variable(bob, "esv-shared").unwrap().values["DEV"],
        "bob"
    );
}

#[test]
fn test_apply_push_runs_frodo_commands_for_one_environment() {
    let h = TestHarness::new();
    h.add_environment_for(
        h.owner,
        EnvironmentBuilder::new("DEV")
            .proxy("http://proxy.internal:3128")
            .build(),
    );
    h.add_environment("SBX");
    h.service
        .create_variables(
            h.owner,
            &[
                create("esv-new", "n", &[("DEV", "1"), ("SBX", "2")]),
                create("esv-changed", "", &[("DEV", "fresh")]),
            ],
        )
        .unwrap();
    h.write_variable("DEV", &VariableFileBuilder::new("esv-changed", "stale"));
    h.write_variable("DEV", &VariableFileBuilder::new("esv-removed", "x"));

    let summary = h.service.apply_push(h.owner, "DEV").unwrap();

    assert!(summary.success);
    assert_eq!(summary.imported, vec!["esv-new", "esv-changed"]);
    assert_eq!(summary.deleted, vec!["esv-removed"]);

    let lines = h.executor.lines_of("frodo");
    assert_eq!(lines.len(), 4);
    assert!(lines[0].starts_with("frodo esv variable import -i esv-new -f "));
    assert!(lines[1].starts_with("frodo esv variable import -i esv-changed -f "));
    assert_eq!(
        lines[2],
        "frodo esv variable delete -i esv-removed https://dev.example.com"
    );
    assert_eq!(lines[3], "frodo esv apply -y https://dev.example.com");

    for call in h.executor.calls() {
        assert_eq!(call.cwd.as_deref(), Some(h.repo_root.as_path()));
        assert_eq!(call.env_value("HTTPS_PROXY"), Some("http://proxy.internal:3128"));
    }
}

#[test]
fn test_apply_push_collects_failures_and_still_applies() {
    let h = TestHarness::new();
    h.add_environment("DEV");
    h.service
        .create_variables(
            h.owner,
            &[
                create("esv-a", "", &[("DEV", "1")]),
                create("esv-b", "", &[("DEV", "2")]),
            ],
        )
        .unwrap();
    h.executor
        .on("import -i esv-a", Outcome::Fail("invalid value".to_string()));

    let summary = h.service.apply_push(h.owner, "DEV").unwrap();

    assert!(!summary.success);
    assert_eq!(summary.imported, vec!["esv-b"]);
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].name, "esv-a");
    assert!(summary.failures[0].error.contains("invalid value"));
    assert!(h
        .executor
        .lines_of("frodo")
        .last()
        .unwrap()
        .starts_with("frodo esv apply -y"));
}

#[test]
fn test_pull_environment_overwrites_fields() {
    let h = TestHarness::new();
    h.add_environment("DEV");
    h.service
        .create_variables(h.owner, &[create("esv-a", "old", &[("DEV", "1")])])
        .unwrap();
    h.write_variable(
        "DEV",
        &VariableFileBuilder::new("esv-a", "2")
            .description("new")
            .expression_type("int"),
    );
    h.write_variable("DEV", &VariableFileBuilder::new("esv-b", "3"));

    let summary = h.service.pull_environment(h.owner, "DEV").unwrap();
    assert_eq!(summary.variables_count, 2);

    let a = h.service.get_variable(h.owner, "esv-a").unwrap();
    assert_eq!(a.description.as_deref(), Some("new"));
    assert_eq!(a.expression_type, "int");
    assert_eq!(a.values["DEV"], "2");
}

#[test]
fn test_deleting_environment_drops_its_values() {
    let h = TestHarness::new();
    h.add_environment("DEV");
    h.add_environment("SBX");
    h.service
        .create_variables(
            h.owner,
            &[
                create("esv-a", "", &[("DEV", "1"), ("SBX", "2")]),
                create("esv-sbx-only", "", &[("SBX", "3")]),
            ],
        )
        .unwrap();

    h.service.delete_environment(h.owner, "SBX").unwrap();
    assert_eq!(
        h.service.get_variable(h.owner, "esv-a").unwrap().values,
        values(&[("DEV", "1")])
    );
    // Its only value lived in SBX.
    assert!(h.service.get_variable(h.owner, "esv-sbx-only").is_err());
    let names: Vec<String> = h
        .service
        .list_variables(h.owner)
        .unwrap()
        .into_iter()
        .map(|v| v.name)
        .collect();
    assert_eq!(names, vec!["esv-a".to_string()]);

    let remaining = h
        .service
        .delete_variables(
            h.owner,
            &[VariableDelete {
                name: "esv-a".to_string(),
                environments: vec!["DEV".to_string()],
            }],
        )
        .unwrap();
    assert!(remaining.is_empty());
    assert!(h.service.get_variable(h.owner, "esv-a").is_err());
}
