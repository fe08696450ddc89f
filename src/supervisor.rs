//! Background task lifecycle helpers.
//!
//! Pipelines, delivery workers, and the dispatcher run as long-lived tasks
//! on a shared `TaskTracker` under one application-wide
//! `CancellationToken`. A cancellable task that fails takes the process
//! down with it; a supervised task is instead restarted after a fixed
//! backoff and picks its work back up from the ledger's pending scan.

use std::future::Future;
use std::time::Duration;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{error, info};

/// Spawn a task that runs until completion or shutdown. Failure is treated
/// as fatal: the application token is cancelled so the rest of the process
/// winds down instead of running half-blind.
pub fn spawn_cancellable_task<F, Fut>(
    tracker: &TaskTracker,
    app_token: CancellationToken,
    task_name: &'static str,
    task_builder: F,
) where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    info!(task = task_name, "Starting background task");

    let task_token = app_token.clone();
    tracker.spawn(async move {
        tokio::select! {
            result = task_builder(app_token.clone()) => {
                match result {
                    Ok(()) => {
                        info!(task = task_name, "Background task completed");
                    }
                    Err(e) => {
                        error!(task = task_name, error = ?e, "Background task failed unexpectedly");
                        task_token.cancel();
                    }
                }
            }
            () = task_token.cancelled() => {
                info!(task = task_name, "Background task shutting down");
            }
        }
    });
}

/// Spawn a task that is restarted after `restart_backoff` whenever it
/// fails. The builder is re-invoked for every attempt with a fresh view of
/// the shared token; a clean exit or a cancelled token stops the loop.
pub fn spawn_supervised_task<F, Fut>(
    tracker: &TaskTracker,
    app_token: CancellationToken,
    task_name: &'static str,
    restart_backoff: Duration,
    task_builder: F,
) where
    F: Fn(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    info!(
        task = task_name,
        backoff_secs = restart_backoff.as_secs(),
        "Starting supervised task"
    );

    tracker.spawn(async move {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            tokio::select! {
                result = task_builder(app_token.clone()) => {
                    match result {
                        Ok(()) => {
                            info!(task = task_name, "Supervised task completed");
                            return;
                        }
                        Err(e) => {
                            error!(
                                task = task_name,
                                error = ?e,
                                attempt,
                                backoff_secs = restart_backoff.as_secs(),
                                "Supervised task failed, restarting after backoff"
                            );
                        }
                    }
                }
                () = app_token.cancelled() => {
                    info!(task = task_name, "Supervised task shutting down");
                    return;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(restart_backoff) => {}
                () = app_token.cancelled() => {
                    info!(task = task_name, "Supervised task shutting down");
                    return;
                }
            }
        }
    });
}
