//! Task consumer
//!
//! Pulls messages from a [`TaskSource`], runs each through the pipeline in
//! its own task and settles the message with the resulting disposition.
//! Concurrency is bounded by a semaphore; a message is only pulled once a
//! permit is available, so the broker keeps the rest.

use futures::FutureExt;
use kiln_client::{QueueError, TaskMessage, TaskSource};
use kiln_core::domain::disposition::{Disposition, RetryPolicy};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use super::attempts::AttemptTracker;
use crate::service::TaskPipeline;

/// Turns pipeline outcomes into message dispositions
pub struct TaskHandler {
    pipeline: TaskPipeline,
    policy: RetryPolicy,
    attempts: AttemptTracker,
}

impl TaskHandler {
    /// Creates a new task handler
    pub fn new(pipeline: TaskPipeline, policy: RetryPolicy) -> Self {
        Self {
            pipeline,
            policy,
            attempts: AttemptTracker::new(),
        }
    }

    /// Processes one message and settles it exactly once
    ///
    /// Returns the disposition that was applied.
    pub async fn handle(&self, message: TaskMessage) -> Disposition {
        // A panicking run still owes the broker a disposition
        let outcome = AssertUnwindSafe(self.pipeline.process(message.payload()))
            .catch_unwind()
            .await;

        let disposition = match outcome {
            Ok(Ok(_)) => {
                self.attempts.clear(message.payload());
                Disposition::Acknowledge
            }
            Ok(Err(e)) => self.on_failure(&message, &e.stage().to_string()),
            Err(panic) => {
                error!("Task panicked: {}", panic_message(panic.as_ref()));
                self.on_failure(&message, "panic")
            }
        };

        settle(message, disposition).await;
        disposition
    }

    fn on_failure(&self, message: &TaskMessage, stage: &str) -> Disposition {
        let attempt = self.attempt_number(message);
        let disposition = self.policy.on_failure(attempt);

        if disposition == Disposition::DeadLetter {
            self.attempts.clear(message.payload());
            warn!(
                stage,
                attempt,
                max_attempts = self.policy.max_attempts(),
                "Giving up on task, dead-lettering"
            );
        } else {
            debug!(stage, attempt, "Requeueing failed task");
        }
        disposition
    }

    /// 1-based delivery number of a failed message
    fn attempt_number(&self, message: &TaskMessage) -> u32 {
        let tracked = self.attempts.record_failure(message.payload());
        let reported = message
            .delivery_count()
            .map(|count| count.saturating_add(1))
            .unwrap_or(0);
        tracked.max(reported)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

async fn settle(message: TaskMessage, disposition: Disposition) {
    let result = match disposition {
        Disposition::Acknowledge => message.acknowledge().await,
        Disposition::Requeue => message.reject(true).await,
        Disposition::DeadLetter => message.reject(false).await,
    };

    // The broker redelivers anything left unsettled when the channel closes
    if let Err(e) = result {
        error!(%disposition, "Failed to settle message: {}", e);
    }
}

/// Consumes task messages with bounded parallelism
pub struct TaskConsumer {
    handler: Arc<TaskHandler>,
    semaphore: Arc<Semaphore>,
    max_parallel: usize,
}

impl TaskConsumer {
    /// Creates a new consumer running at most `max_parallel` tasks at once
    pub fn new(handler: TaskHandler, max_parallel: usize) -> Self {
        let max_parallel = max_parallel.max(1);
        Self {
            handler: Arc::new(handler),
            semaphore: Arc::new(Semaphore::new(max_parallel)),
            max_parallel,
        }
    }

    /// Runs until the source closes, fails, or `shutdown` resolves
    ///
    /// In-flight tasks are always allowed to finish and settle their
    /// messages before this returns.
    pub async fn run<S, F>(&self, mut source: S, shutdown: F) -> Result<(), QueueError>
    where
        S: TaskSource,
        F: Future<Output = ()>,
    {
        info!("Starting task consumer (max parallel: {})", self.max_parallel);

        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);

        let outcome = loop {
            let permit = tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, no longer accepting tasks");
                    break Ok(());
                }
                permit = Arc::clone(&self.semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break Ok(()),
                },
            };

            let next = tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, no longer accepting tasks");
                    break Ok(());
                }
                next = source.next_message() => next,
            };

            match next {
                Some(Ok(message)) => {
                    debug!(delivery_count = ?message.delivery_count(), "Received task message");
                    let handler = Arc::clone(&self.handler);
                    tasks.spawn(async move {
                        let disposition = handler.handle(message).await;
                        // Permit is released when dropped
                        drop(permit);
                        disposition
                    });
                }
                Some(Err(e)) => {
                    error!("Task source failed: {}", e);
                    break Err(e);
                }
                None => {
                    info!("Task source closed");
                    break Ok(());
                }
            }

            while let Some(joined) = tasks.try_join_next() {
                log_joined(joined);
            }
        };

        if !tasks.is_empty() {
            info!("Waiting for {} in-flight task(s)", tasks.len());
        }
        while let Some(joined) = tasks.join_next().await {
            log_joined(joined);
        }

        info!("Task consumer stopped");
        outcome
    }
}

fn log_joined(joined: Result<Disposition, JoinError>) {
    match joined {
        Ok(disposition) => debug!(%disposition, "Task settled"),
        Err(e) => error!("Task aborted before settling its message: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, SettleLog, Settlement, VecSource, project_archive};
    use std::time::Duration;

    const TASK: &[u8] = br#"{"key":"proj123","buildType":"web"}"#;

    fn handler(harness: &Harness, max_attempts: u32) -> TaskHandler {
        TaskHandler::new(harness.pipeline(), RetryPolicy::new(max_attempts))
    }

    #[tokio::test]
    async fn test_success_acknowledges_once() {
        let harness = Harness::new();
        harness.seed("proj123", project_archive("proj123")).await;
        let log = SettleLog::default();

        let disposition = handler(&harness, 5)
            .handle(log.message("task", TASK, None))
            .await;

        assert_eq!(disposition, Disposition::Acknowledge);
        assert_eq!(log.settlements(), vec![Settlement::Ack]);
        assert_eq!(harness.store.puts(), vec!["proj123_web.tar.gz".to_string()]);
    }

    #[tokio::test]
    async fn test_fetch_failure_requeues_once() {
        let harness = Harness::new();
        let log = SettleLog::default();

        let disposition = handler(&harness, 5)
            .handle(log.message("task", TASK, None))
            .await;

        assert_eq!(disposition, Disposition::Requeue);
        assert_eq!(log.settlements(), vec![Settlement::Nack { requeue: true }]);
        assert_eq!(harness.archiver.extracts(), 0);
    }

    #[tokio::test]
    async fn test_build_failure_requeues_once() {
        let harness = Harness::failing_build();
        harness.seed("proj123", project_archive("proj123")).await;
        let log = SettleLog::default();

        handler(&harness, 5)
            .handle(log.message("task", TASK, None))
            .await;

        assert_eq!(log.settlements(), vec![Settlement::Nack { requeue: true }]);
        assert_eq!(harness.archiver.extracts(), 1);
        assert_eq!(harness.archiver.creates(), 0);
        assert!(harness.store.puts().is_empty());
    }

    #[tokio::test]
    async fn test_package_failure_requeues_without_upload() {
        let harness = Harness::failing_package();
        harness.seed("proj123", project_archive("proj123")).await;
        let log = SettleLog::default();

        let disposition = handler(&harness, 5)
            .handle(log.message("task", TASK, None))
            .await;

        assert_eq!(disposition, Disposition::Requeue);
        assert_eq!(log.settlements(), vec![Settlement::Nack { requeue: true }]);
        assert!(harness.store.puts().is_empty());
    }

    #[tokio::test]
    async fn test_upload_failure_requeues_once() {
        let harness = Harness::failing_upload();
        harness.seed("proj123", project_archive("proj123")).await;
        let log = SettleLog::default();

        let disposition = handler(&harness, 5)
            .handle(log.message("task", TASK, None))
            .await;

        assert_eq!(disposition, Disposition::Requeue);
        assert_eq!(log.settlements(), vec![Settlement::Nack { requeue: true }]);
        assert_eq!(harness.leftover_runs(), 0);
    }

    #[tokio::test]
    async fn test_panicking_build_is_settled_as_failure() {
        let harness = Harness::panicking_build();
        harness.seed("proj123", project_archive("proj123")).await;
        let log = SettleLog::default();

        let disposition = handler(&harness, 5)
            .handle(log.message("task", TASK, None))
            .await;

        assert_eq!(disposition, Disposition::Requeue);
        assert_eq!(log.settlements(), vec![Settlement::Nack { requeue: true }]);
        assert_eq!(harness.leftover_runs(), 0);
    }

    #[tokio::test]
    async fn test_repeated_panics_reach_ceiling() {
        let harness = Harness::panicking_build();
        harness.seed("proj123", project_archive("proj123")).await;
        let log = SettleLog::default();

        let disposition = handler(&harness, 3)
            .handle(log.message("task", TASK, Some(2)))
            .await;

        assert_eq!(disposition, Disposition::DeadLetter);
        assert_eq!(log.settlements(), vec![Settlement::Nack { requeue: false }]);
    }

    #[tokio::test]
    async fn test_run_settles_message_whose_task_panicked() {
        let harness = Harness::panicking_build();
        harness.seed("proj123", project_archive("proj123")).await;
        let log = SettleLog::default();

        let source = VecSource::new(vec![log.message("task", TASK, None)]);
        let consumer = TaskConsumer::new(handler(&harness, 5), 1);
        consumer
            .run(source, std::future::pending())
            .await
            .unwrap();

        assert_eq!(log.settlements(), vec![Settlement::Nack { requeue: true }]);
    }

    #[test]
    fn test_panic_message_reads_string_payloads() {
        let literal: Box<dyn Any + Send> = Box::new("boom");
        let formatted: Box<dyn Any + Send> = Box::new(format!("boom {}", 2));
        let other: Box<dyn Any + Send> = Box::new(7_u8);

        assert_eq!(panic_message(literal.as_ref()), "boom");
        assert_eq!(panic_message(formatted.as_ref()), "boom 2");
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }

    #[tokio::test]
    async fn test_malformed_payload_requeued_on_first_delivery() {
        let harness = Harness::new();
        let log = SettleLog::default();

        let disposition = handler(&harness, 5)
            .handle(log.message("task", br#"{"key":"proj123"}"#, None))
            .await;

        assert_eq!(disposition, Disposition::Requeue);
        assert_eq!(log.settlements(), vec![Settlement::Nack { requeue: true }]);
        assert!(harness.store.gets().is_empty());
    }

    #[tokio::test]
    async fn test_broker_delivery_count_reaches_ceiling() {
        let harness = Harness::new();
        let log = SettleLog::default();

        // Four earlier deliveries make this the fifth attempt
        let disposition = handler(&harness, 5)
            .handle(log.message("task", TASK, Some(4)))
            .await;

        assert_eq!(disposition, Disposition::DeadLetter);
        assert_eq!(log.settlements(), vec![Settlement::Nack { requeue: false }]);
    }

    #[tokio::test]
    async fn test_tracked_redeliveries_reach_ceiling() {
        let harness = Harness::new();
        let handler = handler(&harness, 3);
        let log = SettleLog::default();

        let payload = b"not json";
        let mut dispositions = Vec::new();
        for _ in 0..4 {
            dispositions.push(handler.handle(log.message("task", payload, None)).await);
        }

        // The dead-letter clears the history, so a fresh copy starts over
        assert_eq!(
            dispositions,
            vec![
                Disposition::Requeue,
                Disposition::Requeue,
                Disposition::DeadLetter,
                Disposition::Requeue,
            ]
        );
        assert_eq!(log.settlements().len(), 4);
    }

    #[tokio::test]
    async fn test_success_clears_failure_history() {
        let harness = Harness::new();
        let handler = handler(&harness, 2);
        let log = SettleLog::default();

        assert_eq!(
            handler.handle(log.message("task", TASK, None)).await,
            Disposition::Requeue
        );

        harness.seed("proj123", project_archive("proj123")).await;
        assert_eq!(
            handler.handle(log.message("task", TASK, None)).await,
            Disposition::Acknowledge
        );
        assert_eq!(handler.attempts.len(), 0);
    }

    #[tokio::test]
    async fn test_run_settles_every_message_exactly_once() {
        let harness = Harness::new();
        harness.seed("proj123", project_archive("proj123")).await;
        let log = SettleLog::default();

        let source = VecSource::new(vec![
            log.message("ok", TASK, None),
            log.message("missing", br#"{"key":"nope","buildType":"web"}"#, None),
            log.message("malformed", b"{}", None),
        ]);

        let consumer = TaskConsumer::new(handler(&harness, 5), 2);
        consumer
            .run(source, std::future::pending())
            .await
            .unwrap();

        let mut entries = log.entries();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            entries,
            vec![
                ("malformed".to_string(), Settlement::Nack { requeue: true }),
                ("missing".to_string(), Settlement::Nack { requeue: true }),
                ("ok".to_string(), Settlement::Ack),
            ]
        );
    }

    #[tokio::test]
    async fn test_shutdown_stops_waiting_for_messages() {
        let harness = Harness::new();
        harness.seed("proj123", project_archive("proj123")).await;
        let log = SettleLog::default();

        let source = VecSource::held_open(vec![
            log.message("first", TASK, None),
            log.message("second", TASK, None),
        ]);

        let watched = log.clone();
        let shutdown = async move {
            while watched.entries().len() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };

        let consumer = TaskConsumer::new(handler(&harness, 5), 1);
        tokio::time::timeout(Duration::from_secs(10), consumer.run(source, shutdown))
            .await
            .expect("consumer did not stop")
            .unwrap();

        assert_eq!(log.settlements(), vec![Settlement::Ack, Settlement::Ack]);
    }

    #[tokio::test]
    async fn test_source_error_drains_in_flight_tasks() {
        let harness = Harness::new();
        harness.seed("proj123", project_archive("proj123")).await;
        let log = SettleLog::default();

        let mut source = VecSource::new(vec![log.message("task", TASK, None)]);
        source.push_error(QueueError::Internal("channel closed".to_string()));

        let consumer = TaskConsumer::new(handler(&harness, 5), 4);
        let err = consumer
            .run(source, std::future::pending())
            .await
            .unwrap_err();

        assert!(matches!(err, QueueError::Internal(_)));
        assert_eq!(log.settlements(), vec![Settlement::Ack]);
    }
}
