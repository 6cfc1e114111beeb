//! Idempotency primitives built on the store's atomic `set_nx`.
//!
//! The marker claim is a single atomic operation, never a separate
//! check followed by a set; two concurrent callers can therefore never
//! both observe "absent". Store unavailability propagates as an error
//! rather than falling back to running the operation anyway: for
//! idempotency checks, correctness wins over availability.

use sha2::{Digest, Sha256};
use std::future::Future;
use std::time::Duration;

use crate::errors::FlowError;
use crate::store::KeyValueStore;

/// Runs `operation` at most once per `key` within the TTL window.
///
/// The first caller to claim the key executes the operation and gets
/// `Some(value)` back; every other caller inside the window gets `None`
/// without the operation ever being invoked.
///
/// # Errors
///
/// Returns an error if the store is unavailable or the operation fails.
/// An operation failure releases the marker so a later call can retry.
pub async fn once<T, F, Fut>(
    store: &dyn KeyValueStore,
    key: &str,
    operation: F,
    ttl: Option<Duration>,
) -> Result<Option<T>, FlowError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, FlowError>>,
{
    let marker = format!("once:{key}");
    if !store.set_nx(&marker, "1", ttl).await? {
        tracing::debug!(key, "idempotent operation already executed, skipping");
        return Ok(None);
    }

    match operation().await {
        Ok(value) => Ok(Some(value)),
        Err(err) => {
            // Release the claim so the operation stays runnable.
            store.delete(&marker).await?;
            Err(err)
        }
    }
}

/// Flags whether an event id has been seen before.
///
/// Returns true the first time an id is observed within the TTL window,
/// false on repeats. After expiry the id counts as new again.
///
/// # Errors
///
/// Returns an error if the store is unavailable.
pub async fn deduplicate_event(
    store: &dyn KeyValueStore,
    event_id: &str,
    ttl: Duration,
) -> Result<bool, FlowError> {
    store
        .set_nx(&format!("dedup:{event_id}"), "1", Some(ttl))
        .await
}

/// Derives a stable idempotency key from components.
#[must_use]
pub fn idempotency_key(components: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(components.join(":").as_bytes());
    let digest = hasher.finalize();
    format!("idem:{}", hex::encode(&digest[..16]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryKvStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_once_runs_first_caller_only() {
        let store = InMemoryKvStore::new();

        let first = once(&store, "deploy-42", || async { Ok(7) }, None)
            .await
            .unwrap();
        assert_eq!(first, Some(7));

        let second = once(&store, "deploy-42", || async { Ok(8) }, None)
            .await
            .unwrap();
        assert_eq!(second, None);
    }

    #[tokio::test]
    async fn test_once_concurrent_single_execution() {
        let store = Arc::new(InMemoryKvStore::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            let runs = Arc::clone(&runs);
            handles.push(tokio::spawn(async move {
                once(
                    store.as_ref(),
                    "shared-key",
                    || async {
                        runs.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    },
                    None,
                )
                .await
                .unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_once_releases_marker_on_failure() {
        let store = InMemoryKvStore::new();

        let result: Result<Option<()>, _> = once(
            &store,
            "flaky",
            || async { Err(FlowError::Internal("boom".into())) },
            None,
        )
        .await;
        assert!(result.is_err());

        // The failed attempt does not burn the key.
        let retry = once(&store, "flaky", || async { Ok(1) }, None).await.unwrap();
        assert_eq!(retry, Some(1));
    }

    #[tokio::test]
    async fn test_once_ttl_window() {
        let store = InMemoryKvStore::new();
        let ttl = Some(Duration::from_millis(10));

        assert!(once(&store, "k", || async { Ok(()) }, ttl)
            .await
            .unwrap()
            .is_some());
        assert!(once(&store, "k", || async { Ok(()) }, ttl)
            .await
            .unwrap()
            .is_none());

        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(once(&store, "k", || async { Ok(()) }, ttl)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_deduplicate_event() {
        let store = InMemoryKvStore::new();
        let ttl = Duration::from_millis(20);

        assert!(deduplicate_event(&store, "evt-1", ttl).await.unwrap());
        assert!(!deduplicate_event(&store, "evt-1", ttl).await.unwrap());
        assert!(deduplicate_event(&store, "evt-2", ttl).await.unwrap());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(deduplicate_event(&store, "evt-1", ttl).await.unwrap());
    }

    #[test]
    fn test_idempotency_key_stable() {
        let a = idempotency_key(&["job", "nightly", "2026-01-01"]);
        let b = idempotency_key(&["job", "nightly", "2026-01-01"]);
        let c = idempotency_key(&["job", "nightly", "2026-01-02"]);

        assert!(a.starts_with("idem:"));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
