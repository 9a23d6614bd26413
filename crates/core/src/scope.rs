use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arbor_storage::{ConversationId, unix_timestamp_millis};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::tree::TreeIndex;

/// One async mutex per conversation; holders are the scope's only writer.
#[derive(Debug, Default)]
pub struct ScopeLocks {
    locks: Mutex<HashMap<ConversationId, Arc<Mutex<()>>>>,
}

impl ScopeLocks {
    pub async fn acquire(&self, scope: ConversationId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(scope).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Drops the entry of a deleted scope. Called by the guard holder; the entry stays
    /// while other writers are queued on it.
    pub async fn release(&self, scope: ConversationId) {
        let mut locks = self.locks.lock().await;
        let idle = locks
            .get(&scope)
            .is_some_and(|lock| Arc::strong_count(lock) <= 2);
        if idle {
            locks.remove(&scope);
        }
    }

    #[cfg(test)]
    async fn tracked(&self, scope: ConversationId) -> bool {
        self.locks.lock().await.contains_key(&scope)
    }
}

/// Last published index per scope. Snapshots are immutable once handed out.
#[derive(Debug, Default)]
pub struct IndexCache {
    snapshots: RwLock<HashMap<ConversationId, Arc<TreeIndex>>>,
}

impl IndexCache {
    pub async fn get(&self, scope: ConversationId) -> Option<Arc<TreeIndex>> {
        self.snapshots.read().await.get(&scope).cloned()
    }

    pub async fn publish(&self, index: TreeIndex) -> Arc<TreeIndex> {
        let snapshot = Arc::new(index);
        self.snapshots
            .write()
            .await
            .insert(snapshot.scope(), snapshot.clone());
        snapshot
    }

    /// Stores a cold-loaded index unless a writer published one first.
    pub async fn publish_if_absent(&self, index: TreeIndex) -> Arc<TreeIndex> {
        let mut snapshots = self.snapshots.write().await;
        snapshots
            .entry(index.scope())
            .or_insert_with(|| Arc::new(index))
            .clone()
    }

    pub async fn evict(&self, scope: ConversationId) {
        self.snapshots.write().await.remove(&scope);
    }
}

/// Wall-clock millis that never repeat within one controller, so creation order is total.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: AtomicU64,
}

impl MonotonicClock {
    pub fn now_ms(&self) -> u64 {
        let wall = unix_timestamp_millis();
        let mut previous = self.last.load(Ordering::Relaxed);
        loop {
            let next = wall.max(previous.saturating_add(1));
            match self
                .last
                .compare_exchange_weak(previous, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => previous = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn clock_is_strictly_increasing() {
        let clock = MonotonicClock::default();
        let stamps = (0..1_000).map(|_| clock.now_ms()).collect::<Vec<_>>();
        assert!(stamps.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[tokio::test]
    async fn same_scope_writers_are_serialized() {
        let locks = Arc::new(ScopeLocks::default());
        let scope = ConversationId::new_v7();
        let guard = locks.acquire(scope).await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire(scope).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        let other_scope = locks.acquire(ConversationId::new_v7()).await;
        drop(other_scope);

        drop(guard);
        contender.await.expect("contender finishes");
    }

    #[tokio::test]
    async fn release_forgets_a_scope_nobody_waits_on() {
        let locks = Arc::new(ScopeLocks::default());
        let scope = ConversationId::new_v7();

        let guard = locks.acquire(scope).await;
        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire(scope).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        locks.release(scope).await;
        assert!(locks.tracked(scope).await);
        drop(guard);
        waiter.await.expect("waiter finishes");

        let guard = locks.acquire(scope).await;
        locks.release(scope).await;
        assert!(!locks.tracked(scope).await);
        drop(guard);
    }
}
