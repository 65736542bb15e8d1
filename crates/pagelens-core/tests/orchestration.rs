//! End-to-end request scenarios through the orchestrator.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use pagelens_core::auth::TokenAuth;
use pagelens_core::{
    Credential, Diagnostic, ErrorKind, Invocation, Orchestrator, OrchestratorError, ResultCache,
    ResultItem, SnapshotRegistry, fn_logic,
};
use pagelens_test_utils::fixtures::{
    CountingLogic, FailingLogic, IntegrationBuilder, MapSecrets, github_context,
};
use pagelens_test_utils::tracing_setup::init_test_tracing;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};

fn orchestrator(registry: &Arc<SnapshotRegistry>, secrets: &Arc<MapSecrets>) -> Orchestrator {
    Orchestrator::builder(registry.clone(), secrets.clone()).build()
}

#[test_log::test(tokio::test)]
async fn test_starts_with_scenario() {
    let registry = Arc::new(SnapshotRegistry::new());
    registry
        .publish(vec![
            IntegrationBuilder::new("owners")
                .starts_with("page.repository", "my-org/")
                .build(),
        ])
        .unwrap();
    let orchestrator = orchestrator(&registry, &Arc::new(MapSecrets::new()));

    let hit = orchestrator
        .handle(&Credential::anonymous(), &github_context("my-org/webshop"))
        .await
        .unwrap();
    assert_eq!(hit, vec![ResultItem::text("owners")]);

    let miss = orchestrator
        .handle(&Credential::anonymous(), &github_context("other/x"))
        .await
        .unwrap();
    assert!(miss.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_single_flight_across_concurrent_requests() {
    init_test_tracing();
    let logic = Arc::new(CountingLogic::text("slow").with_delay(Duration::from_millis(500)));
    let registry = Arc::new(SnapshotRegistry::new());
    registry
        .publish(vec![
            IntegrationBuilder::new("slow")
                .ttl_secs(60)
                .logic(logic.clone())
                .build(),
        ])
        .unwrap();
    let orchestrator = orchestrator(&registry, &Arc::new(MapSecrets::new()));
    let context = github_context("my-org/webshop");

    let credential = Credential::anonymous();
    let results = join_all((0..10).map(|_| orchestrator.handle(&credential, &context))).await;

    assert_eq!(logic.calls(), 1);
    for result in results {
        assert_eq!(result.unwrap(), vec![ResultItem::text("slow")]);
    }
    let stats = orchestrator.cache().stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.joins, 9);
}

#[tokio::test(start_paused = true)]
async fn test_ttl_300_hit_at_10s_recompute_at_301s() {
    let logic = Arc::new(CountingLogic::text("cached"));
    let registry = Arc::new(SnapshotRegistry::new());
    registry
        .publish(vec![
            IntegrationBuilder::new("cached")
                .ttl_secs(300)
                .logic(logic.clone())
                .build(),
        ])
        .unwrap();
    let orchestrator = orchestrator(&registry, &Arc::new(MapSecrets::new()));
    let context = github_context("my-org/webshop");

    orchestrator.handle(&Credential::anonymous(), &context).await.unwrap();
    assert_eq!(logic.calls(), 1);

    tokio::time::advance(Duration::from_secs(10)).await;
    orchestrator.handle(&Credential::anonymous(), &context).await.unwrap();
    assert_eq!(logic.calls(), 1);

    tokio::time::advance(Duration::from_secs(291)).await;
    let items = orchestrator.handle(&Credential::anonymous(), &context).await.unwrap();
    assert_eq!(logic.calls(), 2);
    assert_eq!(items, vec![ResultItem::text("cached")]);
}

#[tokio::test]
async fn test_sibling_failures_are_isolated() {
    let registry = Arc::new(SnapshotRegistry::new());
    registry
        .publish(vec![
            IntegrationBuilder::new("broken")
                .logic(Arc::new(FailingLogic("upstream 503".to_string())))
                .build(),
            IntegrationBuilder::new("healthy").build(),
            IntegrationBuilder::new("bad-shape")
                .logic(Arc::new(CountingLogic::returning(json!({ "not": "an array" }))))
                .build(),
        ])
        .unwrap();
    let orchestrator = orchestrator(&registry, &Arc::new(MapSecrets::new()));

    let report = orchestrator
        .handle_detailed(&Credential::anonymous(), &github_context("my-org/a"))
        .await
        .unwrap();
    assert_eq!(report.items, vec![ResultItem::text("healthy")]);
    assert!(matches!(
        report.diagnostic("broken"),
        Some(Diagnostic::Failed { kind: ErrorKind::RuntimeError, message, .. }) if message == "upstream 503"
    ));
    assert!(matches!(
        report.diagnostic("bad-shape"),
        Some(Diagnostic::Failed { kind: ErrorKind::InvalidResultShape, .. })
    ));
}

#[tokio::test]
async fn test_least_privilege_scoping() {
    let secrets = Arc::new(MapSecrets::with(&[("A", "alpha"), ("B", "bravo")]));
    let logic = Arc::new(CountingLogic::returning(json!([])));
    let registry = Arc::new(SnapshotRegistry::new());
    registry
        .publish(vec![
            IntegrationBuilder::new("needs-a")
                .secrets(&["A"])
                .logic(logic.clone())
                .build(),
        ])
        .unwrap();
    let orchestrator = orchestrator(&registry, &secrets);

    orchestrator
        .handle(&Credential::anonymous(), &github_context("my-org/a"))
        .await
        .unwrap();

    let invocations = logic.invocations();
    assert_eq!(invocations.len(), 1);
    assert_eq!(invocations[0].secrets.to_json(), json!({ "A": "alpha" }));
    assert!(!invocations[0].secrets.in_scope("B"));
    assert_eq!(secrets.lookups(), vec!["A".to_string()]);
}

#[tokio::test]
async fn test_missing_secret_skips_and_rotation_applies() {
    let secrets = Arc::new(MapSecrets::new());
    let logic = Arc::new(CountingLogic::text("jira"));
    let registry = Arc::new(SnapshotRegistry::new());
    registry
        .publish(vec![
            IntegrationBuilder::new("jira")
                .secrets(&["JIRA_KEY"])
                .ttl_secs(300)
                .logic(logic.clone())
                .build(),
        ])
        .unwrap();
    let orchestrator = orchestrator(&registry, &secrets);
    let context = github_context("my-org/a");

    let report = orchestrator
        .handle_detailed(&Credential::anonymous(), &context)
        .await
        .unwrap();
    assert!(report.items.is_empty());
    assert_eq!(
        report.diagnostic("jira"),
        Some(&Diagnostic::Skipped {
            reason: "missing-secret:JIRA_KEY".to_string()
        })
    );
    assert_eq!(logic.calls(), 0);

    // A newly configured secret changes the fingerprint, so the cached skip is bypassed.
    secrets.set("JIRA_KEY", "k");
    let items = orchestrator.handle(&Credential::anonymous(), &context).await.unwrap();
    assert_eq!(items, vec![ResultItem::text("jira")]);
    assert_eq!(logic.calls(), 1);
}

#[tokio::test]
async fn test_malformed_item_dropped_end_to_end() {
    let registry = Arc::new(SnapshotRegistry::new());
    registry
        .publish(vec![
            IntegrationBuilder::new("mixed")
                .logic(Arc::new(CountingLogic::returning(json!([
                    { "type": "link", "content": "Ticket", "href": "https://jira/1" },
                    { "type": "link", "content": "No href" }
                ]))))
                .build(),
        ])
        .unwrap();
    let orchestrator = orchestrator(&registry, &Arc::new(MapSecrets::new()));

    let items = orchestrator
        .handle(&Credential::anonymous(), &github_context("my-org/a"))
        .await
        .unwrap();
    assert_eq!(items, vec![ResultItem::link("Ticket", "https://jira/1")]);
}

#[tokio::test]
async fn test_auth_denial_executes_nothing() {
    let secrets = Arc::new(MapSecrets::with(&[("CLIENT_TOKEN", "good")]));
    let logic = Arc::new(CountingLogic::text("x"));
    let registry = Arc::new(SnapshotRegistry::new());
    registry
        .publish(vec![IntegrationBuilder::new("x").logic(logic.clone()).build()])
        .unwrap();
    let orchestrator = Orchestrator::builder(registry, secrets.clone())
        .with_auth(Arc::new(TokenAuth::new(secrets, vec!["CLIENT_TOKEN".to_string()])))
        .build();
    let context = github_context("my-org/a");

    let denied = orchestrator.handle(&Credential::bearer("bad"), &context).await;
    assert!(matches!(denied, Err(OrchestratorError::AuthDenied(_))));
    assert_eq!(logic.calls(), 0);

    let allowed = orchestrator.handle(&Credential::bearer("good"), &context).await.unwrap();
    assert_eq!(allowed, vec![ResultItem::text("x")]);
    assert_eq!(logic.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_aggregate_deadline_excludes_late_outcomes() {
    let slow = Arc::new(CountingLogic::text("slow").with_delay(Duration::from_secs(5)));
    let registry = Arc::new(SnapshotRegistry::new());
    registry
        .publish(vec![
            IntegrationBuilder::new("fast").build(),
            IntegrationBuilder::new("slow")
                .ttl_secs(60)
                .timeout(Duration::from_secs(30))
                .logic(slow.clone())
                .build(),
        ])
        .unwrap();
    let secrets = Arc::new(MapSecrets::new());
    let cache = ResultCache::in_memory();

    // A patient client starts the slow computation...
    let patient = Arc::new(
        Orchestrator::builder(registry.clone(), secrets.clone())
            .with_cache(cache.clone())
            .with_request_timeout(Duration::from_secs(10))
            .with_integration_timeout(Duration::from_secs(30))
            .build(),
    );
    let context = github_context("my-org/a");
    let background = tokio::spawn({
        let patient = Arc::clone(&patient);
        let context = context.clone();
        async move { patient.handle(&Credential::anonymous(), &context).await }
    });
    tokio::task::yield_now().await;

    // ...and an impatient one gives up on it after one second.
    let impatient = Orchestrator::builder(registry.clone(), secrets.clone())
        .with_cache(cache.clone())
        .with_request_timeout(Duration::from_secs(1))
        .build();
    let report = impatient
        .handle_detailed(&Credential::anonymous(), &context)
        .await
        .unwrap();
    assert_eq!(report.items, vec![ResultItem::text("fast")]);
    assert_eq!(report.diagnostic("slow"), Some(&Diagnostic::DeadlineExceeded));

    // The abandoned computation still completes and populates the cache.
    let patient_items = background.await.unwrap().unwrap();
    assert_eq!(
        patient_items,
        vec![ResultItem::text("fast"), ResultItem::text("slow")]
    );
    let later = impatient
        .handle(&Credential::anonymous(), &context)
        .await
        .unwrap();
    assert_eq!(later, vec![ResultItem::text("fast"), ResultItem::text("slow")]);
    assert_eq!(slow.calls(), 1);
}

#[tokio::test]
async fn test_snapshot_swap_between_requests() {
    let registry = Arc::new(SnapshotRegistry::new());
    registry
        .publish(vec![IntegrationBuilder::new("v1").build()])
        .unwrap();
    let orchestrator = orchestrator(&registry, &Arc::new(MapSecrets::new()));
    let context = github_context("my-org/a");

    let first = orchestrator
        .handle_detailed(&Credential::anonymous(), &context)
        .await
        .unwrap();
    registry
        .publish(vec![
            IntegrationBuilder::new("v2").build(),
            IntegrationBuilder::new("aws").context_type("aws").build(),
        ])
        .unwrap();
    let second = orchestrator
        .handle_detailed(&Credential::anonymous(), &context)
        .await
        .unwrap();

    assert_eq!(first.items, vec![ResultItem::text("v1")]);
    assert_eq!(second.items, vec![ResultItem::text("v2")]);
    assert!(second.snapshot_version > first.snapshot_version);
}

#[tokio::test(start_paused = true)]
async fn test_computation_outlives_request_deadline_and_fills_cache() {
    let logic = Arc::new(CountingLogic::text("slow").with_delay(Duration::from_millis(500)));
    let registry = Arc::new(SnapshotRegistry::new());
    registry
        .publish(vec![
            IntegrationBuilder::new("slow")
                .ttl_secs(300)
                .timeout(Duration::from_secs(10))
                .logic(logic.clone())
                .build(),
        ])
        .unwrap();
    let orchestrator = Orchestrator::builder(registry, Arc::new(MapSecrets::new()))
        .with_request_timeout(Duration::from_millis(100))
        .build();
    let context = github_context("my-org/a");

    let first = orchestrator
        .handle_detailed(&Credential::anonymous(), &context)
        .await
        .unwrap();
    assert!(first.items.is_empty());
    assert_eq!(first.diagnostic("slow"), Some(&Diagnostic::DeadlineExceeded));

    tokio::time::sleep(Duration::from_secs(2)).await;
    let second = orchestrator
        .handle_detailed(&Credential::anonymous(), &context)
        .await
        .unwrap();
    assert_eq!(second.items, vec![ResultItem::text("slow")]);
    assert_eq!(logic.calls(), 1);
}

#[tokio::test]
async fn test_empty_match_spec_caches_per_context() {
    let echo = fn_logic(|inv: Invocation| async move {
        let repository = inv
            .context
            .resolve("page.repository")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(json!([{ "type": "text", "content": repository }]))
    });
    let registry = Arc::new(SnapshotRegistry::new());
    registry
        .publish(vec![IntegrationBuilder::new("echo").ttl_secs(300).logic(echo).build()])
        .unwrap();
    let orchestrator = orchestrator(&registry, &Arc::new(MapSecrets::new()));

    let a = orchestrator
        .handle(&Credential::anonymous(), &github_context("my-org/a"))
        .await
        .unwrap();
    let b = orchestrator
        .handle(&Credential::anonymous(), &github_context("other/b"))
        .await
        .unwrap();
    assert_eq!(a, vec![ResultItem::text("my-org/a")]);
    assert_eq!(b, vec![ResultItem::text("other/b")]);

    let again = orchestrator
        .handle(&Credential::anonymous(), &github_context("my-org/a"))
        .await
        .unwrap();
    assert_eq!(again, a);
    assert_eq!(orchestrator.cache().stats().hits, 1);
}
