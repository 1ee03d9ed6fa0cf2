//! Single-lane background writer.

use crate::errors::StoreError;
use crate::store::DurableStore;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

type Ack = oneshot::Sender<Result<(), StoreError>>;

struct WriteJob {
    key: String,
    bytes: Vec<u8>,
    ack: Ack,
}

/// Writes records one at a time, strictly in submission order.
#[derive(Debug, Clone)]
pub struct PersistLane {
    jobs: mpsc::UnboundedSender<WriteJob>,
}

impl PersistLane {
    /// Spawns the writer task on the current runtime.
    pub fn spawn(store: Arc<dyn DurableStore>) -> Result<Self, StoreError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| StoreError::LaneClosed)?;
        let (jobs, mut queue) = mpsc::unbounded_channel::<WriteJob>();
        runtime.spawn(async move {
            while let Some(job) = queue.recv().await {
                let store = store.clone();
                let key = job.key.clone();
                let result = tokio::task::spawn_blocking(move || store.write(&job.key, &job.bytes))
                    .await
                    .unwrap_or(Err(StoreError::LaneClosed));
                if let Err(err) = &result {
                    warn!(key = %key, error = %err, "Persisting record failed");
                }
                let _ = job.ack.send(result);
            }
            debug!("Persistence lane stopped");
        });
        Ok(Self { jobs })
    }

    /// Queues a write. The receiver resolves once that write finished.
    ///
    /// Submission order is write order, so callers holding a lock while
    /// submitting get their writes applied in lock order.
    pub fn submit(&self, key: &str, bytes: Vec<u8>) -> oneshot::Receiver<Result<(), StoreError>> {
        let (ack, done) = oneshot::channel();
        let job = WriteJob {
            key: key.to_string(),
            bytes,
            ack,
        };
        if let Err(mpsc::error::SendError(job)) = self.jobs.send(job) {
            let _ = job.ack.send(Err(StoreError::LaneClosed));
        }
        done
    }
}

/// Waits for a queued write.
pub(crate) async fn settle(done: oneshot::Receiver<Result<(), StoreError>>) -> Result<(), StoreError> {
    done.await.unwrap_or(Err(StoreError::LaneClosed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, MockDurableStore};

    #[tokio::test]
    async fn test_writes_apply_in_order() {
        let store = Arc::new(MemoryStore::new());
        let lane = PersistLane::spawn(store.clone()).unwrap();

        let first = lane.submit("r", b"1".to_vec());
        let second = lane.submit("r", b"2".to_vec());
        settle(second).await.unwrap();
        settle(first).await.unwrap();

        assert_eq!(store.read("r").unwrap().unwrap(), b"2");
        assert_eq!(store.write_count(), 2);
    }

    #[tokio::test]
    async fn test_write_failure_reaches_submitter() {
        let mut store = MockDurableStore::new();
        store.expect_write().returning(|key, _| {
            Err(StoreError::io(key, std::io::Error::other("disk gone")))
        });
        let lane = PersistLane::spawn(Arc::new(store)).unwrap();

        let err = settle(lane.submit("r", b"x".to_vec())).await.unwrap_err();
        assert!(err.to_string().contains("disk gone"));
    }
}
