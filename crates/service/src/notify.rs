use async_trait::async_trait;
use model::Notification;

use crate::error::NotifyError;

/// Best-effort outbound channel for order confirmations.
///
/// Results are only logged by the caller; a failure never affects an order.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn dispatch(&self, notification: &Notification) -> Result<(), NotifyError>;
}
