use super::*;
use crate::config::RuntimeConfig;
use crate::errors::{InterruptCause, RunResult};
use crate::host::{LaunchedStep, RunListener};
use crate::store::{DurableStore, MemoryStore};
use crate::testing::{assert_interrupted_by, assert_succeeded_with, FlowFixture};
use pretty_assertions::assert_eq;
use std::collections::BTreeSet;
use std::sync::Arc;

const KEY: &str = "segment-gates.json";

fn controller() -> (Arc<MemoryStore>, Arc<GateController>) {
    let store = Arc::new(MemoryStore::new());
    let controller = Arc::new(GateController::open(store.clone(), KEY).unwrap());
    (store, controller)
}

fn enter(
    controller: &Arc<GateController>,
    fixture: &FlowFixture,
    name: &str,
    capacity: Option<u32>,
) -> LaunchedStep {
    fixture.flow.launch(None, gate(controller.clone(), name, capacity))
}

fn holders(controller: &GateController, name: &str) -> BTreeSet<u64> {
    controller
        .gate("app", name)
        .map(|state| state.holders)
        .unwrap_or_default()
}

#[tokio::test]
async fn test_scenario_two_gates_release_and_unblock() {
    let (_, controller) = controller();
    let builds: Vec<_> = (1..=3).map(|n| FlowFixture::new("app", n)).collect();

    let mut a1 = enter(&controller, &builds[0], "A", Some(2));
    let mut a2 = enter(&controller, &builds[1], "A", Some(2));
    assert_eq!(holders(&controller, "A"), BTreeSet::from([1, 2]));

    let mut a3 = enter(&controller, &builds[2], "A", Some(2));
    assert!(a3.try_outcome().is_none());
    assert_eq!(controller.gate("app", "A").unwrap().waiter, Some(3));
    assert!(builds[2].console.contains("Waiting for builds [1, 2]"));

    let mut b1 = enter(&controller, &builds[0], "B", Some(1));
    assert_eq!(holders(&controller, "B"), BTreeSet::from([1]));
    assert_eq!(holders(&controller, "A"), BTreeSet::from([2, 3]));
    assert_eq!(controller.gate("app", "A").unwrap().waiter, None);

    for launched in [&mut a1, &mut a2, &mut a3, &mut b1] {
        assert_succeeded_with(&launched.try_outcome().unwrap(), &serde_json::Value::Null);
    }
    assert!(builds[2]
        .console
        .contains("Unblocked since #1 is moving into stage A"));
    assert_eq!(
        builds[0].console.lines(),
        vec!["Entering stage A", "Proceeding", "Entering stage B", "Proceeding"]
    );
}

#[tokio::test]
async fn test_newer_entrant_supersedes_waiter() {
    let (_, controller) = controller();
    let builds: Vec<_> = (1..=3).map(|n| FlowFixture::new("app", n)).collect();

    let _held = enter(&controller, &builds[0], "deploy", Some(1));
    let mut second = enter(&controller, &builds[1], "deploy", Some(1));
    let mut third = enter(&controller, &builds[2], "deploy", Some(1));

    assert_interrupted_by(
        &second.try_outcome().unwrap(),
        RunResult::NotBuilt,
        &InterruptCause::Superseded { by: 3 },
    );
    assert!(third.try_outcome().is_none());
    assert_eq!(controller.gate("app", "deploy").unwrap().waiter, Some(3));
    assert!(builds[1].console.contains("Canceled since #3 got here"));
    assert!(builds[2].console.contains("Canceling older #2"));
}

#[tokio::test]
async fn test_older_entrant_gives_way_to_newer_waiter() {
    let (_, controller) = controller();
    let one = FlowFixture::new("app", 1);
    let two = FlowFixture::new("app", 2);
    let three = FlowFixture::new("app", 3);

    let _held = enter(&controller, &one, "deploy", Some(1));
    let mut newer = enter(&controller, &three, "deploy", Some(1));
    let mut older = enter(&controller, &two, "deploy", Some(1));

    let outcome = older.try_outcome().unwrap();
    assert_interrupted_by(&outcome, RunResult::NotBuilt, &InterruptCause::Superseded { by: 3 });
    assert!(outcome.unwrap_err().to_string().contains("Superseded by #3"));
    assert!(newer.try_outcome().is_none());
    assert_eq!(controller.gate("app", "deploy").unwrap().waiter, Some(3));
    assert!(three.console.contains("Canceling older #2"));
}

#[tokio::test]
async fn test_reentering_while_waiting_is_rejected() {
    let (_, controller) = controller();
    let one = FlowFixture::new("app", 1);
    let two = FlowFixture::new("app", 2);

    let _held = enter(&controller, &one, "deploy", Some(1));
    let _waiting = enter(&controller, &two, "deploy", Some(1));
    let mut again = enter(&controller, &two, "deploy", Some(1));

    let err = again.try_outcome().unwrap().unwrap_err();
    assert!(err.to_string().contains("already waiting"), "{err}");
    assert_eq!(controller.gate("app", "deploy").unwrap().waiter, Some(2));
}

#[tokio::test]
async fn test_build_completion_unblocks_waiter() {
    let (_, controller) = controller();
    let listener: Arc<dyn RunListener> = controller.clone();
    let one = FlowFixture::with_listeners("app", 1, vec![listener]);
    let two = FlowFixture::new("app", 2);

    let _held = enter(&controller, &one, "deploy", Some(1));
    let mut waiting = enter(&controller, &two, "deploy", Some(1));
    assert!(waiting.try_outcome().is_none());

    one.flow.finish();
    assert_succeeded_with(&waiting.try_outcome().unwrap(), &serde_json::Value::Null);
    assert!(two.console.contains("Unblocked since #1 finished"));
    assert_eq!(holders(&controller, "deploy"), BTreeSet::from([2]));

    controller.build_completed("app", 2);
    assert!(controller.gates().is_empty());
}

#[tokio::test]
async fn test_lowered_capacity_keeps_waiter_waiting() {
    let (_, controller) = controller();
    let builds: Vec<_> = (1..=3).map(|n| FlowFixture::new("app", n)).collect();

    let _one = enter(&controller, &builds[0], "test", Some(2));
    let _two = enter(&controller, &builds[1], "test", Some(2));
    let mut three = enter(&controller, &builds[2], "test", Some(1));
    assert!(three.try_outcome().is_none());

    controller.build_completed("app", 1);
    assert!(three.try_outcome().is_none());
    assert_eq!(holders(&controller, "test"), BTreeSet::from([2]));

    controller.build_completed("app", 2);
    assert_succeeded_with(&three.try_outcome().unwrap(), &serde_json::Value::Null);
}

#[tokio::test]
async fn test_unbounded_gate_admits_everyone() {
    let (_, controller) = controller();
    let builds: Vec<_> = (1..=5).map(|n| FlowFixture::new("app", n)).collect();
    for fixture in &builds {
        let mut launched = enter(&controller, fixture, "lint", None);
        assert!(launched.try_outcome().is_some());
    }
    assert_eq!(holders(&controller, "lint").len(), 5);
}

#[tokio::test]
async fn test_table_is_persisted_on_every_mutation() {
    let (store, controller) = controller();
    let one = FlowFixture::new("app", 1);
    let two = FlowFixture::new("app", 2);
    let _held = enter(&controller, &one, "deploy", Some(1));
    let _waiting = enter(&controller, &two, "deploy", Some(1));
    assert_eq!(store.write_count(), 2);

    let reopened = GateController::open(store.clone(), KEY).unwrap();
    assert_eq!(reopened.gates(), controller.gates());
    assert_eq!(reopened.gate("app", "deploy").unwrap().waiter, Some(2));
}

#[tokio::test]
async fn test_from_config_persists_under_gates_key() {
    let store = Arc::new(MemoryStore::new());
    let config = RuntimeConfig {
        gates_key: "lanes.json".into(),
        ..RuntimeConfig::default()
    };
    let controller = Arc::new(GateController::from_config(store.clone(), &config).unwrap());
    let one = FlowFixture::new("app", 1);
    let _held = enter(&controller, &one, "deploy", Some(1));

    assert!(store.read("lanes.json").unwrap().is_some());
    assert!(store.read(KEY).unwrap().is_none());
    let reopened = GateController::open(store, "lanes.json").unwrap();
    assert_eq!(holders(&reopened, "deploy"), BTreeSet::from([1]));
}

#[test]
fn test_corrupt_table_starts_empty() {
    let store = Arc::new(MemoryStore::new());
    store.seed(KEY, "<<<");
    let controller = GateController::open(store, KEY).unwrap();
    assert!(controller.gates().is_empty());
}

#[tokio::test]
async fn test_detached_waiter_gets_verdict_on_resume() {
    let (store, controller) = controller();
    let one = FlowFixture::new("app", 1);
    let two = FlowFixture::new("app", 2);

    let _held = enter(&controller, &one, "deploy", Some(1));
    let mut waiting = enter(&controller, &two, "deploy", Some(1));
    let persisted = waiting.unit().suspend().unwrap();
    assert!(matches!(
        persisted.state,
        crate::execution::StepSnapshot::Gate { build: 2, .. }
    ));

    controller.build_completed("app", 1);
    assert!(waiting.try_outcome().is_none());
    let bytes = store.read(KEY).unwrap().unwrap();
    assert!(String::from_utf8(bytes).unwrap().contains("admitted"));

    assert!(waiting.unit().resume());
    assert_succeeded_with(&waiting.try_outcome().unwrap(), &serde_json::Value::Null);
    assert!(two.console.contains("Unblocked since #1 finished"));
}

#[tokio::test]
async fn test_detached_waiter_learns_it_was_superseded() {
    let (_, controller) = controller();
    let builds: Vec<_> = (1..=3).map(|n| FlowFixture::new("app", n)).collect();

    let _held = enter(&controller, &builds[0], "deploy", Some(1));
    let mut second = enter(&controller, &builds[1], "deploy", Some(1));
    second.unit().suspend().unwrap();
    let _third = enter(&controller, &builds[2], "deploy", Some(1));
    assert!(second.try_outcome().is_none());

    assert!(second.unit().resume());
    assert_interrupted_by(
        &second.try_outcome().unwrap(),
        RunResult::NotBuilt,
        &InterruptCause::Superseded { by: 3 },
    );
}

#[tokio::test]
async fn test_stop_withdraws_waiter() {
    let (_, controller) = controller();
    let one = FlowFixture::new("app", 1);
    let two = FlowFixture::new("app", 2);

    let _held = enter(&controller, &one, "deploy", Some(1));
    let mut waiting = enter(&controller, &two, "deploy", Some(1));
    waiting
        .unit()
        .stop(crate::errors::StepError::aborted(InterruptCause::UserStop { user: None }));

    assert!(waiting.try_outcome().unwrap().is_err());
    assert_eq!(controller.gate("app", "deploy").unwrap().waiter, None);
}

#[tokio::test]
async fn test_oracle_prunes_deleted_holders() {
    let mut oracle = MockBuildOracle::new();
    oracle.expect_exists().returning(|_, build| build != 1);
    let controller = Arc::new(
        GateController::open(Arc::new(MemoryStore::new()), KEY)
            .unwrap()
            .with_oracle(Arc::new(oracle)),
    );
    let one = FlowFixture::new("app", 1);
    let two = FlowFixture::new("app", 2);

    let _held = enter(&controller, &one, "deploy", Some(1));
    assert!(controller.gates().is_empty());

    let mut next = enter(&controller, &two, "deploy", Some(1));
    assert!(next.try_outcome().is_some());
    assert_eq!(holders(&controller, "deploy"), BTreeSet::from([2]));
}
