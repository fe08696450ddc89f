//! Outbound delivery: rendered replies leave through sink workers.
//!
//! Pipelines never call a delivery transport directly; they push finished
//! task snapshots onto per-destination named queues ([`crate::chain`]
//! names them) and a [`DeliveryWorker`] per queue renders each snapshot
//! into an [`Outbound`] payload and hands it to its [`DeliverySink`]. The
//! bundled tracing sink just logs the payload, which is all a demo or test
//! run needs; a real platform client implements the same one-method trait.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::errors::QueueError;
use crate::metrics::{MetricTimer, SharedMetricsPublisher};
use crate::queue::NamedQueue;
use crate::task::{EndReason, ReplyRef, SourceKind, Task, TaskResult};

/// A fully-formed reply, addressed and ready for a transport.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Outbound {
    pub task_id: String,
    pub source: SourceKind,
    pub recipient_id: u64,
    pub content_id: String,
    pub reply_ref: Option<ReplyRef>,
    pub body: String,
}

#[async_trait]
pub trait DeliverySink: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, outbound: &Outbound) -> anyhow::Result<()>;
}

/// Sink that logs each payload instead of calling a platform API.
pub struct TracingDeliverySink {
    name: String,
}

impl TracingDeliverySink {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl DeliverySink for TracingDeliverySink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, outbound: &Outbound) -> anyhow::Result<()> {
        info!(
            sink = %self.name,
            task.id = %outbound.task_id,
            recipient = outbound.recipient_id,
            content = %outbound.content_id,
            body = %outbound.body,
            "Delivering reply"
        );
        Ok(())
    }
}

/// Render a task snapshot into the text a requester sees. Error endings
/// show their detail; everything else shows the result. `None` means the
/// snapshot carries nothing to say.
pub fn render(task: &Task) -> Option<Outbound> {
    let body = if task.end_reason == Some(EndReason::Error) {
        task.error_detail
            .clone()
            .unwrap_or_else(|| "Processing failed.".to_string())
    } else {
        match task.result.as_ref()? {
            TaskResult::Summary(verdict) => {
                format!("{}\n\nScore: {}/100", verdict.summary.trim(), verdict.score)
            }
            TaskResult::Answer(reply) => {
                format!("{}\n\nScore: {}/100", reply.answer.trim(), reply.score)
            }
            TaskResult::Text { text } => text.clone(),
        }
    };
    Some(Outbound {
        task_id: task.id.clone(),
        source: task.source,
        recipient_id: task.sender_id,
        content_id: task.content_id.clone(),
        reply_ref: task.reply_ref.clone(),
        body,
    })
}

/// One worker per outbound queue: pull, render, deliver, repeat. A failed
/// delivery is logged and counted, never retried here; the platform side
/// owns its own retry policy.
pub struct DeliveryWorker {
    queue: NamedQueue<Task>,
    sink: Arc<dyn DeliverySink>,
    metrics: SharedMetricsPublisher,
}

impl DeliveryWorker {
    pub fn new(
        queue: NamedQueue<Task>,
        sink: Arc<dyn DeliverySink>,
        metrics: SharedMetricsPublisher,
    ) -> Self {
        Self {
            queue,
            sink,
            metrics,
        }
    }

    /// Serve the queue until the stop signal fires. An item pulled right
    /// as the signal fires is folded back for the shutdown snapshot.
    #[instrument(skip_all, fields(queue = %self.queue.name(), sink = %self.sink.name()))]
    pub async fn run(&self, token: CancellationToken) -> Result<(), QueueError> {
        loop {
            let task = tokio::select! {
                () = token.cancelled() => break,
                item = self.queue.pull() => match item {
                    Some(task) => task,
                    None => break,
                },
            };
            if token.is_cancelled() {
                self.queue.push(task)?;
                break;
            }

            let Some(outbound) = render(&task) else {
                warn!(task.id = %task.id, "Nothing to deliver for task, dropping");
                continue;
            };
            let timer = MetricTimer::new("delivery.duration", self.metrics.clone())
                .with_tag("sink", self.sink.name());
            match self.sink.deliver(&outbound).await {
                Ok(()) => {
                    self.metrics
                        .incr_with_tags("delivery.delivered", &[("sink", self.sink.name())])
                        .await;
                }
                Err(e) => {
                    warn!(task.id = %task.id, error = ?e, "Delivery failed");
                    self.metrics
                        .incr_with_tags("delivery.failed", &[("sink", self.sink.name())])
                        .await;
                }
            }
            timer.record().await;
        }
        Ok(())
    }
}
