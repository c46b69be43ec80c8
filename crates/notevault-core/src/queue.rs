//! Per-key FIFO task serialization.
//!
//! Every key owns a fair `tokio::sync::Mutex` lane. Tasks submitted for the
//! same key run one after another in submission order; tasks for different
//! keys run concurrently. Lanes are dropped once nobody waits on them.

use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Serializes async tasks per key
#[derive(Debug, Default)]
pub struct KeyedQueue {
    lanes: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyedQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` once every earlier task for `key` has finished.
    ///
    /// Must not be re-entered for the same key from inside `task`.
    pub async fn run<F, Fut, T>(&self, key: &str, task: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lane = self
            .lanes
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let output = {
            let _turn = lane.lock().await;
            task().await
        };

        // Map + our handle = 2 references: nobody else is queued on this lane
        self.lanes
            .remove_if(key, |_, held| Arc::ptr_eq(held, &lane) && Arc::strong_count(held) <= 2);

        output
    }

    /// Number of keys with queued or running work
    pub fn active_lanes(&self) -> usize {
        self.lanes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_runs_in_order() {
        let queue = Arc::new(KeyedQueue::new());
        let log = Arc::new(order_log::Log::default());

        let mut handles = Vec::new();
        for i in 0..5u64 {
            let queue = Arc::clone(&queue);
            let log = Arc::clone(&log);
            handles.push(tokio::spawn(async move {
                queue
                    .run("note", move || async move {
                        // Later tasks sleep less; order must still hold
                        tokio::time::sleep(Duration::from_millis(10 * (5 - i))).await;
                        log.push(i);
                    })
                    .await;
            }));
            // Give each task time to enqueue before the next
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(log.snapshot(), vec![0, 1, 2, 3, 4]);
        assert_eq!(queue.active_lanes(), 0);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let queue = Arc::new(KeyedQueue::new());
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let blocked = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                queue
                    .run("a", move || async move {
                        rx.await.unwrap();
                    })
                    .await;
            })
        };

        // "b" completes while "a" is still waiting
        let value = tokio::time::timeout(
            Duration::from_secs(1),
            queue.run("b", || async { 42 }),
        )
        .await
        .unwrap();
        assert_eq!(value, 42);

        tx.send(()).unwrap();
        blocked.await.unwrap();
    }

    mod order_log {
        use std::sync::Mutex;

        #[derive(Default)]
        pub struct Log(Mutex<Vec<u64>>);

        impl Log {
            pub fn push(&self, v: u64) {
                self.0.lock().unwrap().push(v);
            }

            pub fn snapshot(&self) -> Vec<u64> {
                self.0.lock().unwrap().clone()
            }
        }
    }
}
