//! Polling supervisor: fetch a task, run it to a terminal state, repeat.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::agent::{DecisionLoop, TaskOutcome};
use crate::api::Backend;
use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Sleep between polls of an empty queue.
    pub poll_interval: Duration,
    /// Fixed sleep after a transient transport error.
    pub backoff: Duration,
    /// Stop after the first task reaches a terminal state.
    pub once: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            backoff: Duration::from_secs(60),
            once: false,
        }
    }
}

/// Reason why `Supervisor::run` returned normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorStop {
    Shutdown,
    Once,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorOutcome {
    pub finished: usize,
    pub failed: usize,
    pub stop: SupervisorStop,
}

pub struct Supervisor {
    backend: Arc<dyn Backend>,
    agent: DecisionLoop,
    config: SupervisorConfig,
}

impl Supervisor {
    pub fn new(backend: Arc<dyn Backend>, agent: DecisionLoop, config: SupervisorConfig) -> Self {
        Self {
            backend,
            agent,
            config,
        }
    }

    /// Runs until `shutdown` resolves, `once` is satisfied, or the backend
    /// rejects our credentials. Only the last case is an error.
    ///
    /// Shutdown is honoured between tasks; a running task always completes
    /// and releases its browser first.
    pub async fn run(
        &self,
        shutdown: impl Future<Output = ()>,
    ) -> Result<SupervisorOutcome, TransportError> {
        tokio::pin!(shutdown);
        let mut outcome = SupervisorOutcome {
            finished: 0,
            failed: 0,
            stop: SupervisorStop::Shutdown,
        };

        loop {
            let polled = tokio::select! {
                _ = &mut shutdown => break,
                polled = self.backend.next_task() => polled,
            };

            let pause = match polled {
                Ok(Some(task)) => {
                    match self.agent.execute_task(&task).await {
                        TaskOutcome::Finished { .. } => outcome.finished += 1,
                        TaskOutcome::Failed(failure) => {
                            outcome.failed += 1;
                            if let Some(status) = failure.credentials_rejected {
                                error!(task_id = %failure.task_id, status, "backend rejected credentials during task, stopping");
                                return Err(TransportError::Unauthorized { status });
                            }
                        }
                    }
                    if self.config.once {
                        outcome.stop = SupervisorStop::Once;
                        return Ok(outcome);
                    }
                    Duration::ZERO
                }
                Ok(None) => {
                    debug!(poll_secs = self.config.poll_interval.as_secs(), "no task queued");
                    self.config.poll_interval
                }
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "backend rejected credentials, stopping");
                    return Err(e);
                }
                Err(e) => {
                    warn!(error = %e, backoff_secs = self.config.backoff.as_secs(), "task poll failed, backing off");
                    self.config.backoff
                }
            };

            if !pause.is_zero() {
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }

        info!(
            finished = outcome.finished,
            failed = outcome.failed,
            "supervisor shutting down"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::ActionName;
    use crate::test_support::{
        FakeBackend, FakePageProvider, Poll, ScriptedBrain, StaticProviderFactory, decision,
        registry_with, task,
    };
    use serde_json::json;

    fn quick() -> SupervisorConfig {
        SupervisorConfig {
            poll_interval: Duration::ZERO,
            backoff: Duration::ZERO,
            once: false,
        }
    }

    fn agent(backend: Arc<FakeBackend>, replies: Vec<String>) -> DecisionLoop {
        DecisionLoop::new(
            backend,
            Arc::new(FakePageProvider::default()),
            Arc::new(StaticProviderFactory::new(Arc::new(ScriptedBrain::new(replies)))),
        )
        .with_registry(Arc::new(registry_with([])))
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_a_task_runs() {
        let backend = Arc::new(FakeBackend::new([
            Poll::Transient,
            Poll::Empty,
            Poll::Task(task("T", json!({}))),
        ]));
        let finish = decision(ActionName::FinishTask.as_str(), json!({}));
        let supervisor = Supervisor::new(
            backend.clone(),
            agent(backend.clone(), vec![finish]),
            SupervisorConfig {
                once: true,
                ..quick()
            },
        );

        let outcome = supervisor.run(std::future::pending()).await.unwrap();
        assert_eq!(outcome.stop, SupervisorStop::Once);
        assert_eq!(outcome.finished, 1);
        assert_eq!(backend.poll_count(), 3);
    }

    #[tokio::test]
    async fn unauthorized_is_fatal() {
        let backend = Arc::new(FakeBackend::new([Poll::Empty, Poll::Unauthorized]));
        let supervisor = Supervisor::new(backend.clone(), agent(backend.clone(), vec![]), quick());

        let err = supervisor.run(std::future::pending()).await.unwrap_err();
        assert!(matches!(err, TransportError::Unauthorized { status: 401 }));
    }

    #[tokio::test]
    async fn credentials_rejected_mid_task_stop_the_supervisor() {
        let backend = Arc::new(
            FakeBackend::new([
                Poll::Task(task("T", json!({}))),
                Poll::Task(task("T", json!({}))),
            ])
            .rejecting_ai_config(),
        );
        let supervisor = Supervisor::new(backend.clone(), agent(backend.clone(), vec![]), quick());

        let err = supervisor.run(std::future::pending()).await.unwrap_err();
        assert!(matches!(err, TransportError::Unauthorized { status: 403 }));
        assert_eq!(backend.poll_count(), 1);
        assert_eq!(backend.reports().len(), 1);
    }

    #[tokio::test]
    async fn failed_tasks_do_not_stop_polling() {
        let backend = Arc::new(FakeBackend::new([
            Poll::Task(task("T", json!({}))),
            Poll::Unauthorized,
        ]));
        let supervisor = Supervisor::new(
            backend.clone(),
            agent(backend.clone(), vec!["no json here".to_string()]),
            quick(),
        );

        assert!(supervisor.run(std::future::pending()).await.is_err());
        assert_eq!(backend.reports().len(), 1);
        assert_eq!(backend.poll_count(), 2);
    }

    #[tokio::test]
    async fn shutdown_stops_an_idle_supervisor() {
        let backend = Arc::new(FakeBackend::new([]));
        let supervisor = Supervisor::new(
            backend.clone(),
            agent(backend.clone(), vec![]),
            SupervisorConfig {
                poll_interval: Duration::from_secs(3600),
                ..quick()
            },
        );

        let outcome = supervisor
            .run(tokio::time::sleep(Duration::from_millis(20)))
            .await
            .unwrap();
        assert_eq!(outcome.stop, SupervisorStop::Shutdown);
        assert_eq!(outcome.finished + outcome.failed, 0);
    }
}
