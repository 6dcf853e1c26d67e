use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::time::sleep;
use tracing::warn;

use crate::config::RetryPolicy;
use crate::error::DispatchError;
use crate::store::{TransactionalStore, Tx};

/// Run `work` inside a fresh transaction and commit it, retrying only on
/// transient store failures (contention, resource exhaustion) with capped
/// exponential backoff. Any other error, or retry exhaustion, propagates
/// immediately. Every Booking/Assignment/DriverAvailability mutation in the
/// crate goes through here.
///
/// The unit of work takes ownership of the [`Tx`] and hands it back alongside
/// its result so the commit can happen outside the closure.
pub async fn execute_transaction_with_retry<'a, T, F>(
    store: Arc<dyn TransactionalStore>,
    policy: &RetryPolicy,
    work: F,
) -> Result<T, DispatchError>
where
    F: Fn(Tx) -> BoxFuture<'a, Result<(Tx, T), DispatchError>>,
{
    let mut attempt = 0u32;

    loop {
        let tx = Tx::new(store.clone());

        let err = match work(tx).await {
            Ok((tx, value)) => match store.commit(tx.into_commit()).await {
                Ok(()) => return Ok(value),
                Err(commit_err) => DispatchError::Store(commit_err),
            },
            Err(work_err) => work_err,
        };

        if err.is_transient() && attempt < policy.max_retries {
            let delay = policy.delay_for_attempt(attempt);
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient store failure; retrying transaction"
            );
            sleep(delay).await;
            attempt += 1;
            continue;
        }

        return Err(err);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use serde_json::json;

    use super::execute_transaction_with_retry;
    use crate::config::RetryPolicy;
    use crate::error::DispatchError;
    use crate::store::memory::MemoryStore;
    use crate::store::{TransactionalStore, fetch};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[tokio::test]
    async fn retries_past_injected_conflicts() {
        let memory = Arc::new(MemoryStore::new());
        memory.inject_conflicts(2);
        let store: Arc<dyn TransactionalStore> = memory.clone();

        let attempts = AtomicU32::new(0);
        let result = execute_transaction_with_retry(store.clone(), &fast_policy(), |mut tx| {
            attempts.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                tx.set("bookings", "b1", &json!({"ok": true}))?;
                Ok((tx, ()))
            })
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        let doc: serde_json::Value = fetch(store.as_ref(), "bookings", "b1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc["ok"], true);
    }

    #[tokio::test]
    async fn exhaustion_surfaces_the_conflict() {
        let memory = Arc::new(MemoryStore::new());
        memory.inject_conflicts(10);
        let store: Arc<dyn TransactionalStore> = memory.clone();

        let result = execute_transaction_with_retry(store, &fast_policy(), |mut tx| {
            Box::pin(async move {
                tx.set("bookings", "b1", &json!({"ok": true}))?;
                Ok((tx, ()))
            })
        })
        .await;

        match result {
            Err(err) => assert!(err.is_transient()),
            Ok(()) => panic!("expected exhaustion"),
        }
    }

    #[tokio::test]
    async fn non_transient_errors_are_not_retried() {
        let store: Arc<dyn TransactionalStore> = Arc::new(MemoryStore::new());

        let attempts = AtomicU32::new(0);
        let result: Result<(), _> =
            execute_transaction_with_retry(store, &fast_policy(), |_tx| {
                attempts.fetch_add(1, Ordering::SeqCst);
                Box::pin(async move {
                    Err(DispatchError::Validation("nope".to_string()))
                })
            })
            .await;

        assert!(matches!(result, Err(DispatchError::Validation(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
