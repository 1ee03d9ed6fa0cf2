//! End-to-end flows: nested steps, restarts and recovery.

#[cfg(test)]
mod tests {
    use crate::config::RuntimeConfig;
    use crate::errors::{InterruptCause, RunResult};
    use crate::execution::{FlowExecution, LifecycleState, PersistedStep, Rehydrator};
    use crate::gates::{gate, GateController};
    use crate::host::RunListener;
    use crate::registry::{resume_all, ExecutionRegistry};
    use crate::steps::{input, retry, timeout, PendingInputs};
    use crate::store::MemoryStore;
    use crate::testing::{
        assert_interrupted_by, assert_succeeded_with, flow_fixture, CountingBody, FlowFixture, ScriptedBody,
    };
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test(start_paused = true)]
    async fn test_timeout_cuts_off_longer_body() {
        let fixture = flow_fixture();
        let body = ScriptedBody::sleeping(Duration::from_secs(10), serde_json::json!("done"));
        let started = Instant::now();

        let result = fixture
            .flow
            .launch(Some(body), timeout(Duration::from_secs(5)))
            .outcome()
            .await;

        assert_interrupted_by(
            &result,
            RunResult::Aborted,
            &InterruptCause::timed_out(Duration::from_secs(5)),
        );
        let elapsed = started.elapsed();
        assert!(elapsed > Duration::from_secs(4) && elapsed < Duration::from_secs(10));
        assert!(fixture.console.contains("Timeout has been exceeded"));
    }

    #[tokio::test]
    async fn test_retry_succeeds_on_third_attempt() {
        let fixture = flow_fixture();
        let config = RuntimeConfig::default();
        let body = CountingBody::new(ScriptedBody::failing_then(2, serde_json::json!("deployed")));

        let result = fixture
            .flow
            .launch(Some(body.clone()), retry(config.retry_attempts))
            .outcome()
            .await;

        assert_succeeded_with(&result, &serde_json::json!("deployed"));
        assert_eq!(body.calls(), 3);
        let retries = fixture
            .console
            .lines()
            .into_iter()
            .filter(|line| line == "Retrying")
            .count();
        assert_eq!(retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_survives_restart() {
        let fixture = flow_fixture();
        let store = Arc::new(MemoryStore::new());
        let registry = ExecutionRegistry::open(store, "reg.json", fixture.loader.clone()).unwrap();
        registry.register(fixture.flow.owner().clone()).await.unwrap();

        let body = ScriptedBody::pending();
        let launched = fixture
            .flow
            .launch(Some(body.clone()), timeout(Duration::from_secs(5)));
        body.wait_for_calls(1).await;

        let json = serde_json::to_string(&launched.unit().suspend().unwrap()).unwrap();
        let restored: PersistedStep = serde_json::from_str(&json).unwrap();
        let rehydrator = Rehydrator::new(fixture.loader.clone(), RuntimeConfig::default());
        let unit = restored.rehydrate(&rehydrator).unwrap();
        assert_eq!(unit.state(), LifecycleState::Suspended);

        assert_eq!(resume_all(&registry), 1);
        assert_eq!(unit.state(), LifecycleState::Resumed);

        let result = launched.outcome().await;
        assert_interrupted_by(
            &result,
            RunResult::Aborted,
            &InterruptCause::timed_out(Duration::from_secs(5)),
        );
        assert_eq!(body.calls(), 1);
    }

    #[tokio::test]
    async fn test_gate_verdict_survives_controller_restart() {
        let store = Arc::new(MemoryStore::new());
        let key = "segment-gates.json";
        let before = Arc::new(GateController::open(store.clone(), key).unwrap());
        let listener: Arc<dyn RunListener> = before.clone();
        let one = FlowFixture::with_listeners("app", 1, vec![listener]);
        let two = FlowFixture::new("app", 2);

        let _held = one.flow.launch(None, gate(before.clone(), "deploy", Some(1)));
        let mut waiting = two.flow.launch(None, gate(before.clone(), "deploy", Some(1)));
        assert!(waiting.try_outcome().is_none());
        let persisted = waiting.unit().suspend().unwrap();

        one.flow.finish();
        assert!(waiting.try_outcome().is_none());

        let after = Arc::new(GateController::open(store, key).unwrap());
        let rehydrator =
            Rehydrator::new(two.loader.clone(), RuntimeConfig::default()).with_gates(after.clone());
        let unit = persisted.rehydrate(&rehydrator).unwrap();
        assert!(unit.resume());

        assert_succeeded_with(&waiting.try_outcome().unwrap(), &serde_json::Value::Null);
        assert_eq!(after.gate("app", "deploy").unwrap().holders, BTreeSet::from([2]));
    }

    #[tokio::test]
    async fn test_input_answered_after_restart() {
        let fixture = flow_fixture();
        let before = Arc::new(PendingInputs::new());
        let launched = fixture
            .flow
            .launch(None, input(before.clone(), "approve", "Deploy to production?"));
        assert_eq!(before.ids(), vec!["approve".to_string()]);

        let persisted = launched.unit().suspend().unwrap();
        assert!(before.ids().is_empty());

        let after = Arc::new(PendingInputs::new());
        let rehydrator =
            Rehydrator::new(fixture.loader.clone(), RuntimeConfig::default()).with_inputs(after.clone());
        let unit = assert_ok!(persisted.rehydrate(&rehydrator));
        assert!(unit.resume());
        assert!(after.proceed("approve", serde_json::json!("yes")));

        assert_succeeded_with(&launched.outcome().await, &serde_json::json!("yes"));
    }

    #[tokio::test]
    async fn test_missing_service_fails_rehydration() {
        let fixture = flow_fixture();
        let inputs = Arc::new(PendingInputs::new());
        let launched = fixture.flow.launch(None, input(inputs, "approve", "Go?"));
        let persisted = launched.unit().suspend().unwrap();

        let rehydrator = Rehydrator::new(fixture.loader.clone(), RuntimeConfig::default());
        let err = assert_err!(persisted.rehydrate(&rehydrator));
        assert!(err.to_string().contains("pending input table"));
    }

    #[tokio::test]
    async fn test_finished_flow_is_pruned_from_recovery() {
        let fixture = flow_fixture();
        let registry =
            ExecutionRegistry::open(Arc::new(MemoryStore::new()), "reg.json", fixture.loader.clone()).unwrap();
        assert_ok!(registry.register(fixture.flow.owner().clone()).await);

        fixture.flow.finish();
        assert_eq!(resume_all(&registry), 0);
        assert!(registry.owners().is_empty());
    }
}
