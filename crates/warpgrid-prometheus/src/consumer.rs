//! Downstream metrics consumer contract.

use anyhow::anyhow;
use tokio::sync::mpsc;

use crate::types::MetricsBatch;
use crate::BoxFuture;

/// Receives translated metric batches, one per target per scrape cycle.
///
/// An error rejects the batch; the receiver logs it and does not retry.
pub trait MetricsConsumer: Send + Sync {
    fn consume_metrics(&self, batch: MetricsBatch) -> BoxFuture<'_, anyhow::Result<()>>;
}

/// Forwards batches into a channel, e.g. towards an exporter task.
impl MetricsConsumer for mpsc::UnboundedSender<MetricsBatch> {
    fn consume_metrics(&self, batch: MetricsBatch) -> BoxFuture<'_, anyhow::Result<()>> {
        let result = self
            .send(batch)
            .map_err(|_| anyhow!("metrics channel closed"));
        Box::pin(async move { result })
    }
}

impl MetricsConsumer for mpsc::Sender<MetricsBatch> {
    fn consume_metrics(&self, batch: MetricsBatch) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.send(batch)
                .await
                .map_err(|_| anyhow!("metrics channel closed"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Node;

    fn batch() -> MetricsBatch {
        MetricsBatch {
            receiver: "prometheus".to_string(),
            node: Node {
                job: "job1".to_string(),
                instance: "localhost:9090".to_string(),
            },
            generation: 1,
            metrics: Vec::new(),
        }
    }

    #[tokio::test]
    async fn unbounded_channel_forwards_batches() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.consume_metrics(batch()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().node.job, "job1");
    }

    #[tokio::test]
    async fn closed_channel_rejects_batch() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let err = tx.consume_metrics(batch()).await.unwrap_err();
        assert!(err.to_string().contains("closed"));
    }
}
