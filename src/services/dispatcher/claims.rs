//! Process-local claim set.
//!
//! A claim marks a step as owned by a handler task of this coordinator. The
//! returned [`ClaimGuard`] releases the claim when dropped, so success,
//! failure, timeout, and panic paths all release it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct ClaimSet {
    /// step id -> run id
    claims: Mutex<HashMap<Uuid, Uuid>>,
    released: Notify,
}

impl ClaimSet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Uuid>> {
        // A panic while holding the lock cannot leave the map half-updated
        self.claims.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim a step. Returns `None` when it is already claimed.
    pub fn try_claim(self: &Arc<Self>, step_id: Uuid, run_id: Uuid) -> Option<ClaimGuard> {
        let mut claims = self.lock();
        if claims.contains_key(&step_id) {
            return None;
        }
        claims.insert(step_id, run_id);
        Some(ClaimGuard {
            claims: Arc::clone(self),
            step_id,
        })
    }

    pub fn contains(&self, step_id: Uuid) -> bool {
        self.lock().contains_key(&step_id)
    }

    pub fn count_for_run(&self, run_id: Uuid) -> usize {
        self.lock().values().filter(|r| **r == run_id).count()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until at least one claim is released.
    pub async fn released(&self) {
        self.released.notified().await;
    }

    fn release(&self, step_id: Uuid) {
        self.lock().remove(&step_id);
        self.released.notify_waiters();
    }
}

/// Releases its claim on drop.
#[derive(Debug)]
pub struct ClaimGuard {
    claims: Arc<ClaimSet>,
    step_id: Uuid,
}

impl ClaimGuard {
    pub fn step_id(&self) -> Uuid {
        self.step_id
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        self.claims.release(self.step_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_is_exclusive_and_released_on_drop() {
        let claims = ClaimSet::new();
        let run = Uuid::new_v4();
        let step = Uuid::new_v4();

        let guard = claims.try_claim(step, run).unwrap();
        assert!(claims.try_claim(step, run).is_none());
        assert_eq!(claims.count_for_run(run), 1);
        assert!(claims.contains(step));

        drop(guard);
        assert!(claims.is_empty());
        assert!(claims.try_claim(step, run).is_some());
    }

    #[test]
    fn test_released_on_panic() {
        let claims = ClaimSet::new();
        let run = Uuid::new_v4();
        let step = Uuid::new_v4();

        let cloned = claims.clone();
        let result = std::panic::catch_unwind(move || {
            let _guard = cloned.try_claim(step, run).unwrap();
            panic!("handler blew up");
        });
        assert!(result.is_err());
        assert_eq!(claims.len(), 0);
    }

    #[test]
    fn test_counts_per_run() {
        let claims = ClaimSet::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let _g1 = claims.try_claim(Uuid::new_v4(), a).unwrap();
        let _g2 = claims.try_claim(Uuid::new_v4(), a).unwrap();
        let _g3 = claims.try_claim(Uuid::new_v4(), b).unwrap();
        assert_eq!(claims.count_for_run(a), 2);
        assert_eq!(claims.count_for_run(b), 1);
        assert_eq!(claims.len(), 3);
    }
}
