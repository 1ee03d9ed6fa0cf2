//! The worker-slot step: run a body on an allocated worker.

use super::launcher::{ProcessLauncher, WorkerLease};
use super::pool::{PlaceholderTask, TaskId, WorkerInfo, WorkerPool, NORMAL_PRIORITY, RECLAIM_PRIORITY};
use super::running::{RunningTask, RunningTasks};
use crate::body::{deliver, BodyExecution, TailCall};
use crate::config::RuntimeConfig;
use crate::context::{BodyId, EnvironmentOverlay, StepContext, WorkingDirectory};
use crate::errors::{ContextError, StepError};
use crate::execution::{StepExecution, StepSnapshot};
use crate::steps::{find_body, live_step, lost_body};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, warn};

/// The services a worker-slot step needs.
pub struct WorkerSlots {
    pool: Arc<dyn WorkerPool>,
    running: Arc<RunningTasks>,
    cookie_variable: String,
}

impl WorkerSlots {
    /// Bundles `pool` with a fresh cookie table.
    #[must_use]
    pub fn new(pool: Arc<dyn WorkerPool>, config: &RuntimeConfig) -> Self {
        Self::with_running(pool, Arc::new(RunningTasks::new()), config)
    }

    /// Bundles `pool` with an existing cookie table.
    #[must_use]
    pub fn with_running(pool: Arc<dyn WorkerPool>, running: Arc<RunningTasks>, config: &RuntimeConfig) -> Self {
        Self {
            pool,
            running,
            cookie_variable: config.cookie_variable.clone(),
        }
    }

    /// The cookie table.
    #[must_use]
    pub fn running(&self) -> &Arc<RunningTasks> {
        &self.running
    }

    /// The pool.
    #[must_use]
    pub fn pool(&self) -> &Arc<dyn WorkerPool> {
        &self.pool
    }
}

impl fmt::Debug for WorkerSlots {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerSlots")
            .field("running", &self.running)
            .field("cookie_variable", &self.cookie_variable)
            .finish_non_exhaustive()
    }
}

/// Creates a worker-slot step asking for a worker carrying `label`.
pub fn worker_slot(
    slots: Arc<WorkerSlots>,
    label: Option<String>,
) -> impl FnOnce(StepContext) -> Arc<dyn StepExecution> + Send {
    move |ctx| {
        let step: Arc<dyn StepExecution> = WorkerSlotStep::new(ctx, slots, label);
        step
    }
}

/// 128 random bits, hex encoded.
fn mint_cookie() -> String {
    let bytes: [u8; 16] = rand::random();
    hex::encode(bytes)
}

#[derive(Default)]
struct SlotState {
    queued: Option<TaskId>,
    worker: Option<String>,
    body: Option<BodyExecution>,
    stopped: Option<StepError>,
}

/// Queues for a worker, then runs the body there with the worker's
/// environment, lease, working directory and process launcher.
///
/// The worker stays allocated until the body ends. Processes tagged with
/// the slot's cookie are killed when it does.
pub struct WorkerSlotStep {
    ctx: StepContext,
    slots: Arc<WorkerSlots>,
    label: Option<String>,
    cookie: String,
    lost: Option<BodyId>,
    state: Mutex<SlotState>,
}

impl WorkerSlotStep {
    /// Creates the step with a fresh cookie.
    #[must_use]
    pub fn new(ctx: StepContext, slots: Arc<WorkerSlots>, label: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            slots,
            label,
            cookie: mint_cookie(),
            lost: None,
            state: Mutex::new(SlotState::default()),
        })
    }

    pub(crate) fn rehydrate(
        ctx: StepContext,
        slots: Arc<WorkerSlots>,
        label: Option<String>,
        cookie: String,
        worker: Option<String>,
        body: Option<BodyId>,
    ) -> Arc<Self> {
        let restored = find_body(&ctx, body);
        Arc::new(Self {
            ctx,
            slots,
            label,
            cookie,
            lost: restored.lost(),
            state: Mutex::new(SlotState {
                worker,
                body: restored.live(),
                ..SlotState::default()
            }),
        })
    }

    /// The cookie identifying this slot.
    #[must_use]
    pub fn cookie(&self) -> &str {
        &self.cookie
    }

    /// The worker the body was launched on, once it was.
    #[must_use]
    pub fn worker(&self) -> Option<String> {
        self.state.lock().worker.clone()
    }

    fn enqueue(&self, state: &mut SlotState, mode: SlotMode, runtime: Handle) {
        let (label, priority) = match mode {
            SlotMode::Launch => (self.label.clone(), NORMAL_PRIORITY),
            SlotMode::Reclaim => (state.worker.clone(), RECLAIM_PRIORITY),
        };
        let task = Arc::new(SlotTask {
            ctx: self.ctx.clone(),
            running: self.slots.running.clone(),
            cookie: self.cookie.clone(),
            label,
            mode,
            runtime,
        });
        let id = self.slots.pool.submit(task, priority);
        if mode == SlotMode::Launch {
            state.queued = Some(id);
        }
        debug!(step = %self.ctx.step_id(), task = %id, ?mode, "Queued for a worker");
    }

    fn launch_on(&self, worker: &WorkerInfo, runtime: &Handle) -> Result<(), StepError> {
        let mut state = self.state.lock();
        state.queued = None;
        if let Some(cause) = state.stopped.clone() {
            return Err(cause);
        }

        let _entered = runtime.enter();
        let workspace = worker.workspace().display().to_string();
        self.ctx.println(format!("Running on {} in {workspace}", worker.name()));

        let running = self.slots.running.clone();
        let pool = self.slots.pool.clone();
        let cookie = self.cookie.clone();
        let finisher = TailCall::new(move |_ctx: &StepContext| {
            running.remove(&cookie);
            pool.kill_by_tag(&cookie);
            Ok(())
        });

        let body = self
            .ctx
            .new_body_invoker()
            .with_context(
                EnvironmentOverlay::new()
                    .set(&self.slots.cookie_variable, &self.cookie)
                    .set("NODE_NAME", worker.name())
                    .set("WORKSPACE", workspace),
            )
            .with_context(WorkerLease::new(worker.name(), &self.cookie, worker.workspace()))
            .with_context(WorkingDirectory::new(worker.workspace()))
            .with_context(ProcessLauncher::new(
                worker.processes().clone(),
                &self.cookie,
                &self.slots.cookie_variable,
            ))
            .with_callback(Arc::new(finisher))
            .start()?;
        state.worker = Some(worker.name().to_string());
        state.body = Some(body);
        Ok(())
    }

    fn body_finished(&self) -> bool {
        self.state.lock().body.as_ref().map_or(true, BodyExecution::is_done)
    }

    /// Gives up on a slot whose body did not survive the restart.
    fn abandon(&self, id: BodyId) {
        let killed = self.slots.pool.kill_by_tag(&self.cookie);
        self.slots.running.remove(&self.cookie);
        warn!(step = %self.ctx.step_id(), body = %id, killed, "Abandoning worker slot");
        deliver(&self.ctx, Err(lost_body(id)));
    }
}

impl StepExecution for WorkerSlotStep {
    fn context(&self) -> &StepContext {
        &self.ctx
    }

    fn name(&self) -> &'static str {
        "node"
    }

    fn start(self: Arc<Self>) -> Result<bool, StepError> {
        let runtime = Handle::try_current().map_err(|_| ContextError::NoRuntime)?;
        match &self.label {
            Some(label) => self.ctx.println(format!("Waiting for a worker labelled '{label}'")),
            None => self.ctx.println("Waiting for a worker"),
        }
        let mut state = self.state.lock();
        self.enqueue(&mut state, SlotMode::Launch, runtime);
        Ok(false)
    }

    fn stop(&self, cause: StepError) {
        let mut state = self.state.lock();
        if state.stopped.is_none() {
            state.stopped = Some(cause.clone());
        }
        if let Some(id) = state.queued.take() {
            if self.slots.pool.cancel(id) {
                drop(state);
                if let Err(err) = self.ctx.fail(cause) {
                    warn!(step = %self.ctx.step_id(), error = %err, "Could not fail queued slot");
                }
                return;
            }
        }
        if let Some(body) = state.body.clone() {
            drop(state);
            body.cancel(cause);
        } else if self.lost.is_some() {
            drop(state);
            self.slots.pool.kill_by_tag(&self.cookie);
            deliver(&self.ctx, Err(cause));
        }
    }

    fn on_suspend(&self) {
        let mut state = self.state.lock();
        if let Some(id) = state.queued.take() {
            self.slots.pool.cancel(id);
        }
        drop(state);
        // The worker thread goes away with the process.
        self.slots.running.remove(&self.cookie);
    }

    fn on_resume(self: Arc<Self>) {
        if let Some(id) = self.lost {
            self.abandon(id);
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            warn!(step = %self.ctx.step_id(), "No runtime available to reclaim a worker");
            return;
        };
        let mut state = self.state.lock();
        let mode = match &state.body {
            Some(body) if body.is_done() => return,
            Some(_) if state.worker.is_some() => SlotMode::Reclaim,
            Some(_) => return,
            None => SlotMode::Launch,
        };
        self.enqueue(&mut state, mode, runtime);
    }

    fn snapshot(&self) -> StepSnapshot {
        let state = self.state.lock();
        StepSnapshot::WorkerSlot {
            label: self.label.clone(),
            cookie: self.cookie.clone(),
            worker: state.worker.clone(),
            body: state.body.as_ref().map(BodyExecution::id).or(self.lost),
        }
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotMode {
    /// Start the body once a worker is free.
    Launch,
    /// Hold the worker a running body was using before a restart.
    Reclaim,
}

struct SlotTask {
    ctx: StepContext,
    running: Arc<RunningTasks>,
    cookie: String,
    label: Option<String>,
    mode: SlotMode,
    runtime: Handle,
}

impl PlaceholderTask for SlotTask {
    fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    fn cookie(&self) -> &str {
        &self.cookie
    }

    fn run(&self, worker: &WorkerInfo) {
        if self.ctx.is_done() {
            return;
        }
        let Some(step) = live_step::<WorkerSlotStep>(&self.ctx) else {
            warn!(step = %self.ctx.step_id(), "Worker slot vanished before it got a worker");
            return;
        };
        self.running.publish(
            &self.cookie,
            RunningTask {
                owner: self.ctx.owner().clone(),
                step: self.ctx.step_id(),
                worker: worker.name().to_string(),
            },
        );

        match self.mode {
            SlotMode::Launch => {
                if let Err(cause) = step.launch_on(worker, &self.runtime) {
                    self.running.remove(&self.cookie);
                    deliver(&self.ctx, Err(cause));
                    return;
                }
            }
            SlotMode::Reclaim => {
                if step.body_finished() {
                    self.running.remove(&self.cookie);
                    return;
                }
                debug!(step = %self.ctx.step_id(), worker = worker.name(), "Reclaimed worker");
            }
        }
        self.running.wait_until_removed(&self.cookie);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::body_fn;
    use crate::errors::InterruptCause;
    use crate::execution::Rehydrator;
    use crate::testing::{assert_failed_with, flow_fixture, ScriptedBody};
    use crate::workers::{Killable, LocalWorkerPool, WorkerSpec};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn setup(specs: Vec<WorkerSpec>) -> (Arc<LocalWorkerPool>, Arc<WorkerSlots>) {
        let pool = Arc::new(LocalWorkerPool::start(specs, "slot-test").unwrap());
        let slots = Arc::new(WorkerSlots::new(pool.clone(), &RuntimeConfig::default()));
        (pool, slots)
    }

    async fn eventually(what: &str, condition: impl Fn() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    struct Flag(Arc<AtomicBool>);

    impl Killable for Flag {
        fn kill(&mut self) -> std::io::Result<()> {
            self.0.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_body_sees_worker_context() {
        let fixture = flow_fixture();
        let (_pool, slots) = setup(vec![
            WorkerSpec::new("w1", "/ws/w1"),
            WorkerSpec::new("w2", "/ws/w2").with_label("linux"),
        ]);
        let body = body_fn(|ctx: StepContext| async move {
            let lease = ctx.get::<WorkerLease>()?.ok_or_else(|| StepError::failed("no lease"))?;
            let env = ctx
                .get::<EnvironmentOverlay>()?
                .ok_or_else(|| StepError::failed("no environment"))?
                .apply_to(&BTreeMap::new());
            let dir = ctx.get::<WorkingDirectory>()?.ok_or_else(|| StepError::failed("no dir"))?;
            Ok(serde_json::json!({
                "worker": lease.worker(),
                "node": env.get("NODE_NAME"),
                "cookie_matches": env.get("RESUMEFLOW_SERVER_COOKIE").map(String::as_str) == Some(lease.cookie()),
                "dir": dir.path().display().to_string(),
            }))
        });

        let launched = fixture.flow.launch(Some(body), worker_slot(slots.clone(), Some("linux".into())));
        let value = launched.outcome().await.unwrap();

        assert_eq!(
            value,
            serde_json::json!({"worker": "w2", "node": "w2", "cookie_matches": true, "dir": "/ws/w2"})
        );
        assert!(fixture.console.contains("Running on w2 in /ws/w2"));
        assert!(slots.running().is_empty());
    }

    #[tokio::test]
    async fn test_stop_while_queued_cancels_request() {
        let fixture = flow_fixture();
        let (pool, slots) = setup(vec![WorkerSpec::new("w1", "/ws/w1")]);
        let launched = fixture.flow.launch(
            Some(ScriptedBody::sequence(vec![Ok(serde_json::Value::Null)])),
            worker_slot(slots, Some("windows".into())),
        );
        assert_eq!(pool.queued(), 1);

        let cause = StepError::aborted(InterruptCause::UserStop { user: None });
        launched.unit().stop(cause.clone());

        assert_eq!(launched.outcome().await, Err(cause));
        assert_eq!(pool.queued(), 0);
    }

    #[tokio::test]
    async fn test_tagged_processes_are_killed_when_body_ends() {
        let fixture = flow_fixture();
        let (_pool, slots) = setup(vec![WorkerSpec::new("w1", "/ws/w1")]);
        let killed = Arc::new(AtomicBool::new(false));
        let flag = killed.clone();
        let body = body_fn(move |ctx: StepContext| {
            let flag = flag.clone();
            async move {
                let launcher = ctx
                    .get::<ProcessLauncher>()?
                    .ok_or_else(|| StepError::failed("no launcher"))?;
                launcher.adopt(Box::new(Flag(flag)));
                Err(StepError::failed("tests failed"))
            }
        });

        let launched = fixture.flow.launch(Some(body), worker_slot(slots.clone(), None));

        assert_eq!(launched.outcome().await, Err(StepError::failed("tests failed")));
        assert!(killed.load(Ordering::SeqCst));
        assert!(slots.running().is_empty());
    }

    #[tokio::test]
    async fn test_resume_reclaims_the_same_worker() {
        let fixture = flow_fixture();
        let (_pool, slots) = setup(vec![WorkerSpec::new("w1", "/ws/w1"), WorkerSpec::new("w2", "/ws/w2")]);
        let body = ScriptedBody::pending();
        let launched = fixture.flow.launch(Some(body.clone()), worker_slot(slots.clone(), None));
        body.wait_for_calls(1).await;

        let step = launched.unit().downcast::<WorkerSlotStep>().unwrap();
        let cookie = step.cookie().to_string();
        let worker = step.worker().unwrap();
        assert!(slots.running().contains(&cookie));

        let persisted = launched.unit().suspend().unwrap();
        assert!(matches!(persisted.state, StepSnapshot::WorkerSlot { .. }));
        assert!(!slots.running().contains(&cookie));

        assert!(launched.unit().resume());
        let running = slots.running().clone();
        eventually("reclaim", || running.contains(&cookie)).await;
        assert_eq!(slots.running().get(&cookie).map(|task| task.worker), Some(worker));

        let cause = StepError::aborted(InterruptCause::UserStop { user: Some("ops".into()) });
        launched.unit().stop(cause.clone());
        assert_eq!(launched.outcome().await, Err(cause));
        assert!(!slots.running().contains(&cookie));
    }

    #[tokio::test]
    async fn test_body_lost_in_restart_is_not_relaunched() {
        let fixture = flow_fixture();
        let (pool, slots) = setup(vec![WorkerSpec::new("w1", "/ws/w1")]);
        let body = ScriptedBody::pending();
        let launched = fixture.flow.launch(Some(body.clone()), worker_slot(slots.clone(), None));
        body.wait_for_calls(1).await;

        let cookie = launched.unit().downcast::<WorkerSlotStep>().unwrap().cookie().to_string();
        let killed = Arc::new(AtomicBool::new(false));
        pool.processes().tag(&cookie, Box::new(Flag(killed.clone())));
        let persisted = launched.unit().suspend().unwrap();

        let restarted = fixture.restarted();
        let rehydrator =
            Rehydrator::new(restarted.loader.clone(), RuntimeConfig::default()).with_workers(slots.clone());
        let unit = persisted.rehydrate(&rehydrator).unwrap();
        assert!(unit.resume());

        assert_failed_with(&launched.outcome().await, "did not survive the restart");
        assert_eq!(body.calls(), 1);
        assert!(killed.load(Ordering::SeqCst));
        assert_eq!(pool.queued(), 0);
        assert!(!slots.running().contains(&cookie));
    }
}
