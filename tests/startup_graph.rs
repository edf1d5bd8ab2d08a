//! Startup coordination driven by configuration and real endpoints.

use bulwark::config::{parse_config, BulwarkConfig, ConfigError, ValidationError};
use bulwark::lifecycle::{ComponentOutcome, GraphError, StartupError, StartupState};
use bulwark::Services;

mod common;

fn graph_config(toml: &str) -> BulwarkConfig {
    parse_config(toml).unwrap()
}

#[tokio::test]
async fn independent_branches_start_after_their_root() {
    let dependency = common::start_mock_dependency().await;
    let config = graph_config(&format!(
        r#"
        [[startup.components]]
        name = "a"
        endpoint = "{dependency}"

        [[startup.components]]
        name = "b"
        dependencies = ["a"]

        [[startup.components]]
        name = "c"
        dependencies = ["a"]
        "#
    ));

    let services = Services::from_config(&config);
    let report = services.coordinator(&config.startup).run().await.unwrap();

    assert_eq!(report.overall_state, StartupState::Ready);
    assert_eq!(report.order[0], "a");
    assert!(report.component_statuses.values().all(|s| s.ok));
}

#[tokio::test]
async fn optional_dependency_outage_skips_its_dependents() {
    let down = common::unreachable_addr().await;
    let config = graph_config(&format!(
        r#"
        [[startup.components]]
        name = "core"

        [[startup.components]]
        name = "search"
        critical = false
        endpoint = "{down}"

        [[startup.components]]
        name = "search-indexer"
        critical = false
        dependencies = ["search"]
        "#
    ));

    let services = Services::from_config(&config);
    let report = services.coordinator(&config.startup).run().await.unwrap();

    assert_eq!(report.overall_state, StartupState::Degraded);
    assert_eq!(report.component_statuses["core"].outcome, ComponentOutcome::Ready);
    assert_eq!(report.component_statuses["search"].outcome, ComponentOutcome::Failed);
    assert_eq!(
        report.component_statuses["search-indexer"].outcome,
        ComponentOutcome::Skipped
    );
}

#[test]
fn cyclic_config_is_rejected_before_anything_runs() {
    let err = parse_config(
        r#"
        [[startup.components]]
        name = "a"
        dependencies = ["b"]

        [[startup.components]]
        name = "b"
        dependencies = ["a"]
        "#,
    )
    .unwrap_err();

    match err {
        ConfigError::Validation(errors) => assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::Graph(GraphError::Cycle { .. })))),
        other => panic!("expected validation error, got {other}"),
    }
}

#[tokio::test]
async fn coordinator_rejects_cycles_from_unvalidated_config() {
    let config: BulwarkConfig = toml::from_str(
        r#"
        [[startup.components]]
        name = "a"
        dependencies = ["a"]
        "#,
    )
    .unwrap();

    let services = Services::from_config(&config);
    let err = services.coordinator(&config.startup).run().await.unwrap_err();
    assert!(matches!(err, StartupError::Graph(GraphError::Cycle { .. })));
}
