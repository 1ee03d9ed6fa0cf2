//! Behavior of step contexts against a live flow.

#[cfg(test)]
mod tests {
    use crate::body::body_fn;
    use crate::console::{CollectingConsoleSink, ConsoleLog};
    use crate::context::{ExecutionOwner, LogFilter, StepContext};
    use crate::errors::{ContextError, InterruptCause, LoadError, RunResult, StepError};
    use crate::execution::FlowExecution;
    use crate::host::{LocalFlow, LocalFlowLoader};
    use crate::steps::{catch_error, sleep};
    use crate::testing::flow_fixture;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_second_completion_is_rejected() {
        let fixture = flow_fixture();
        let launched = fixture.flow.launch(None, sleep(Duration::ZERO));
        let ctx = launched.context().clone();

        assert!(ctx.is_done());
        let err = ctx.succeed(serde_json::json!("again")).unwrap_err();
        assert!(matches!(err, ContextError::AlreadyCompleted { .. }));
        assert_eq!(launched.outcome().await, Ok(serde_json::Value::Null));
    }

    #[tokio::test]
    async fn test_rehydrated_context_binds_on_first_use() {
        let fixture = flow_fixture();
        let launched = fixture.flow.launch(None, sleep(Duration::from_secs(60)));
        let snapshot = launched.context().snapshot();

        let rehydrated = StepContext::rehydrate(snapshot, fixture.loader.clone()).unwrap();
        assert!(!rehydrated.is_ready());
        assert_eq!(&rehydrated, launched.context());

        let execution = rehydrated.execution().unwrap();
        assert!(rehydrated.is_ready());
        assert_eq!(execution.owner(), &ExecutionOwner::new("test", 1));
        assert!(!rehydrated.is_done());
    }

    #[tokio::test]
    async fn test_rehydration_against_unknown_owner_fails() {
        let fixture = flow_fixture();
        let launched = fixture.flow.launch(None, sleep(Duration::from_secs(60)));
        let mut snapshot = launched.context().snapshot();
        snapshot.owner = ExecutionOwner::new("deleted", 9);

        let rehydrated = StepContext::rehydrate(snapshot, Arc::new(LocalFlowLoader::new())).unwrap();
        assert!(matches!(
            rehydrated.execution(),
            Err(ContextError::Load(LoadError::NotFound { .. }))
        ));
        assert!(!rehydrated.is_ready());
    }

    #[tokio::test]
    async fn test_console_lines_go_through_log_filter() {
        let console = Arc::new(CollectingConsoleSink::new());
        let flow = LocalFlow::builder(ExecutionOwner::new("app", 2))
            .with_context(ConsoleLog::new(console.clone()))
            .with_context(LogFilter::masking("hunter2"))
            .build();

        let launched = flow.launch(None, sleep(Duration::ZERO));
        launched.context().println("password is hunter2");

        assert!(console.contains("password is ****"));
        assert!(!console.contains("hunter2"));
    }

    #[tokio::test]
    async fn test_stopping_outer_step_stops_inner_step() {
        let fixture = flow_fixture();
        let body = body_fn(|ctx: StepContext| async move { ctx.run_step(sleep(Duration::from_secs(600))).await });
        let launched = fixture.flow.launch(Some(body), catch_error(RunResult::Failure));

        for _ in 0..1000 {
            if fixture.flow.state().current_executions().len() == 2 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(fixture.flow.state().current_executions().len(), 2);

        let cause = StepError::aborted(InterruptCause::UserStop { user: Some("alice".into()) });
        launched.unit().stop(cause.clone());

        assert_eq!(launched.outcome().await, Err(cause));
        assert!(fixture.flow.state().current_executions().is_empty());
    }
}
