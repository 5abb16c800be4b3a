//! Bounded resource pool with owner-fair waiters.
//!
//! One pool guards one scarce downstream resource (GPU inference slots,
//! outbound export connections). `allocated` never exceeds `capacity`, and
//! every successful claim has exactly one matching release: the claim hands
//! back a [`SlotGuard`] whose `Drop` releases the slot, so release runs on
//! every exit path including panics.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;

use cytoseg_core::types::DbId;

struct PoolState {
    allocated: usize,
    /// Waiting claims per owner, arrival order.
    waiters: HashMap<DbId, VecDeque<oneshot::Sender<()>>>,
    /// Owners with waiting claims, round-robin order.
    rotation: VecDeque<DbId>,
}

struct PoolInner {
    capacity: usize,
    state: Mutex<PoolState>,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // A poisoned lock only means a panic elsewhere; the counters are
        // still usable for release bookkeeping.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Release one slot: hand it to the next eligible waiter (round-robin
    /// across owners, arrival order within an owner), or decrement
    /// `allocated` when nobody is waiting. Waiters whose claim future was
    /// dropped are skipped.
    fn release(&self) {
        let mut state = self.lock();
        loop {
            let Some(owner_id) = state.rotation.pop_front() else {
                state.allocated = state.allocated.saturating_sub(1);
                return;
            };

            let mut handed = false;
            if let Some(queue) = state.waiters.get_mut(&owner_id) {
                while let Some(tx) = queue.pop_front() {
                    if tx.send(()).is_ok() {
                        handed = true;
                        break;
                    }
                }
            }

            let owner_has_more =
                state.waiters.get(&owner_id).is_some_and(|q| !q.is_empty());
            if owner_has_more {
                state.rotation.push_back(owner_id);
            } else {
                state.waiters.remove(&owner_id);
            }

            if handed {
                // Slot ownership transferred; `allocated` is unchanged.
                return;
            }
        }
    }
}

/// Bounded, fairness-aware slot pool. Cheap to clone via internal `Arc`.
#[derive(Clone)]
pub struct ResourcePool {
    inner: Arc<PoolInner>,
}

/// RAII handle for one claimed slot; dropping it releases the slot.
pub struct SlotGuard {
    inner: Arc<PoolInner>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.inner.release();
    }
}

impl ResourcePool {
    /// Create a pool with `capacity` slots (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                capacity: capacity.max(1),
                state: Mutex::new(PoolState {
                    allocated: 0,
                    waiters: HashMap::new(),
                    rotation: VecDeque::new(),
                }),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Currently claimed slot count (always `<= capacity`).
    pub fn allocated(&self) -> usize {
        self.inner.lock().allocated
    }

    /// Claim one slot for `owner_id`.
    ///
    /// Grants immediately when under capacity, otherwise suspends in the
    /// owner-fair waiter queue. Dropping the returned future while waiting
    /// abandons the claim safely (the releaser skips dead waiters).
    pub async fn claim(&self, owner_id: DbId) -> SlotGuard {
        loop {
            let rx = {
                let mut state = self.inner.lock();
                if state.allocated < self.inner.capacity {
                    state.allocated += 1;
                    return SlotGuard { inner: Arc::clone(&self.inner) };
                }
                let (tx, rx) = oneshot::channel();
                state.waiters.entry(owner_id).or_default().push_back(tx);
                if !state.rotation.contains(&owner_id) {
                    state.rotation.push_back(owner_id);
                }
                rx
            };

            if rx.await.is_ok() {
                // Slot handed over by the releaser; `allocated` was left
                // counted on our behalf.
                return SlotGuard { inner: Arc::clone(&self.inner) };
            }
            // Sender dropped without a grant (pool teardown); retry.
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    // -- capacity bound -------------------------------------------------------

    #[tokio::test]
    async fn grants_up_to_capacity_immediately() {
        let pool = ResourcePool::new(2);
        let _a = pool.claim(1).await;
        let _b = pool.claim(1).await;
        assert_eq!(pool.allocated(), 2);
    }

    #[tokio::test]
    async fn claim_blocks_at_capacity_until_release() {
        let pool = ResourcePool::new(1);
        let guard = pool.claim(1).await;

        let waiting = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.claim(2).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());
        assert_eq!(pool.allocated(), 1);

        drop(guard);
        let _handed = waiting.await.expect("waiter task");
        assert_eq!(pool.allocated(), 1);
    }

    #[tokio::test]
    async fn allocated_never_exceeds_capacity_under_load() {
        let pool = ResourcePool::new(3);
        let mut tasks = Vec::new();
        for owner in 0..20i64 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                let _guard = pool.claim(owner).await;
                assert!(pool.allocated() <= pool.capacity());
                tokio::time::sleep(Duration::from_millis(2)).await;
            }));
        }
        for task in tasks {
            task.await.expect("claimant task");
        }
        assert_eq!(pool.allocated(), 0);
    }

    // -- fairness -------------------------------------------------------------

    #[tokio::test]
    async fn release_rotates_across_waiting_owners() {
        let pool = ResourcePool::new(1);
        let guard = pool.claim(1).await;

        // Owner 1 queues two more claims, owner 2 queues one after them.
        let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel::<i64>();
        let mut spawn_claim = |owner: i64| {
            let pool = pool.clone();
            let done = done_tx.clone();
            tokio::spawn(async move {
                let _guard = pool.claim(owner).await;
                let _ = done.send(owner);
                // Hold briefly so grant order is observable.
                tokio::time::sleep(Duration::from_millis(10)).await;
            })
        };
        let _a1 = spawn_claim(1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let _a2 = spawn_claim(1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let _b1 = spawn_claim(2);
        tokio::time::sleep(Duration::from_millis(10)).await;

        drop(guard);

        let first = done_rx.recv().await.expect("first grant");
        let second = done_rx.recv().await.expect("second grant");
        let third = done_rx.recv().await.expect("third grant");

        // Owner 1 arrived first; owner 2 is granted before owner 1's
        // second claim.
        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert_eq!(third, 1);
    }

    // -- abandoned waiters ----------------------------------------------------

    #[tokio::test]
    async fn abandoned_claim_is_skipped_on_release() {
        let pool = ResourcePool::new(1);
        let guard = pool.claim(1).await;

        // A waiter that gives up before being granted.
        let abandoned = {
            let pool = pool.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _guard = pool.claim(2) => unreachable!("should be abandoned first"),
                    _ = tokio::time::sleep(Duration::from_millis(10)) => {}
                }
            })
        };
        abandoned.await.expect("abandoned task");

        drop(guard);
        // The dead waiter must not hold the slot hostage.
        let _next = pool.claim(3).await;
        assert_eq!(pool.allocated(), 1);
    }
}
