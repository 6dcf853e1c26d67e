use async_trait::async_trait;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

/// Outbound notification collaborator (push/SMS delivery lives behind it).
/// Invoked fire-and-forget: implementations must swallow and log their own
/// failures, a dropped notification never fails a dispatch operation.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_driver(&self, driver_id: Uuid, event: &str, payload: Value);
    async fn notify_customer(&self, booking_id: Uuid, event: &str, payload: Value);
}

/// Default notifier: structured log lines only.
#[derive(Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_driver(&self, driver_id: Uuid, event: &str, payload: Value) {
        info!(%driver_id, event, %payload, "driver notification");
    }

    async fn notify_customer(&self, booking_id: Uuid, event: &str, payload: Value) {
        info!(%booking_id, event, %payload, "customer notification");
    }
}
