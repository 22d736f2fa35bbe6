//! Hosting environment contract.
//!
//! The host owns the root cancellation token and decides what a fatal
//! receiver error means (usually: shut the process down).

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ReceiverError;

pub trait Host: Send + Sync {
    /// Root token; the receiver derives its own cancellation from it.
    fn context(&self) -> CancellationToken;

    /// Report an error the receiver cannot recover from.
    fn report_fatal_error(&self, err: ReceiverError);
}

/// Host that forwards fatal errors into a channel.
#[derive(Debug, Clone)]
pub struct ChannelHost {
    root: CancellationToken,
    fatal_tx: mpsc::UnboundedSender<ReceiverError>,
}

impl ChannelHost {
    pub fn new(root: CancellationToken) -> (Self, mpsc::UnboundedReceiver<ReceiverError>) {
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        (Self { root, fatal_tx }, fatal_rx)
    }
}

impl Host for ChannelHost {
    fn context(&self) -> CancellationToken {
        self.root.clone()
    }

    fn report_fatal_error(&self, err: ReceiverError) {
        tracing::error!(error = %err, "fatal receiver error");
        let _ = self.fatal_tx.send(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fatal_errors_reach_the_channel() {
        let (host, mut fatal_rx) = ChannelHost::new(CancellationToken::new());
        host.report_fatal_error(ReceiverError::NotificationsClosed);
        assert!(matches!(
            fatal_rx.recv().await,
            Some(ReceiverError::NotificationsClosed)
        ));
    }

    #[test]
    fn context_shares_the_root_token() {
        let root = CancellationToken::new();
        let (host, _fatal_rx) = ChannelHost::new(root.clone());
        let ctx = host.context();
        root.cancel();
        assert!(ctx.is_cancelled());
    }
}
