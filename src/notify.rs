//! Outcome notifications
//!
//! Delivery is fire-and-forget: [`dispatch`] spawns the send and returns
//! immediately, so a slow or failing channel never holds up a transfer.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::core_types::{Currency, MinorUnits, OwnerId, TransactionId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    TransferCompleted {
        owner_id: OwnerId,
        transaction_id: TransactionId,
        amount: MinorUnits,
        currency: Currency,
    },
    TransferPending {
        owner_id: OwnerId,
        transaction_id: TransactionId,
    },
    TransferFailed {
        owner_id: OwnerId,
        transaction_id: TransactionId,
        reason: String,
        refunded: bool,
    },
    /// Operator alert
    IndeterminateTransaction {
        transaction_id: TransactionId,
        pending_secs: i64,
    },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification);
}

/// Writes notifications to the log; the default channel
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, notification: Notification) {
        match &notification {
            Notification::IndeterminateTransaction {
                transaction_id,
                pending_secs,
            } => warn!(
                transaction_id = %transaction_id,
                pending_secs,
                "Transaction needs operator attention"
            ),
            other => info!(notification = ?other, "Owner notification"),
        }
    }
}

/// Send without waiting for delivery
pub fn dispatch(notifier: &Arc<dyn Notifier>, notification: Notification) {
    let notifier = notifier.clone();
    tokio::spawn(async move {
        notifier.notify(notification).await;
    });
}

#[cfg(test)]
pub mod recording {
    use super::*;
    use tokio::sync::Mutex;

    /// Captures notifications for assertions
    #[derive(Default)]
    pub struct RecordingNotifier {
        pub sent: Mutex<Vec<Notification>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, notification: Notification) {
            self.sent.lock().await.push(notification);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::recording::RecordingNotifier;
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_dispatch_does_not_block() {
        struct Slow;

        #[async_trait]
        impl Notifier for Slow {
            async fn notify(&self, _: Notification) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
        }

        let slow: Arc<dyn Notifier> = Arc::new(Slow);
        let started = std::time::Instant::now();
        dispatch(
            &slow,
            Notification::TransferPending {
                owner_id: 1,
                transaction_id: TransactionId::new(),
            },
        );
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_dispatch_delivers() {
        let recorder = Arc::new(RecordingNotifier::default());
        let notifier: Arc<dyn Notifier> = recorder.clone();
        let id = TransactionId::new();
        dispatch(
            &notifier,
            Notification::TransferPending {
                owner_id: 3,
                transaction_id: id,
            },
        );
        for _ in 0..50 {
            if !recorder.sent.lock().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let sent = recorder.sent.lock().await;
        assert_eq!(
            sent[0],
            Notification::TransferPending {
                owner_id: 3,
                transaction_id: id
            }
        );
    }
}
