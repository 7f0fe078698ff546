//! Ack Coordinator
//!
//! "Wait until N of these parties signal" with a timeout. Every wait is
//! registered under its own token with its own lock and [`Notify`], so a
//! signal only wakes the waits whose party set contains the signaller and
//! unrelated waits never contend on the same lock.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

struct WaitSet<P> {
    parties: HashSet<P>,
    /// Signals below this mark do not count
    watermark: u64,
    signaled: Mutex<HashSet<P>>,
    notify: Notify,
}

impl<P: Eq + Hash> WaitSet<P> {
    fn signaled_count(&self) -> usize {
        self.signaled.lock().len()
    }
}

/// Node-wide coordinator, cheap to clone
pub struct AckCoordinator<P> {
    waits: Arc<Mutex<HashMap<u64, Arc<WaitSet<P>>>>>,
    next_token: Arc<AtomicU64>,
}

impl<P> Clone for AckCoordinator<P> {
    fn clone(&self) -> Self {
        Self {
            waits: self.waits.clone(),
            next_token: self.next_token.clone(),
        }
    }
}

impl<P> Default for AckCoordinator<P> {
    fn default() -> Self {
        Self {
            waits: Arc::new(Mutex::new(HashMap::new())),
            next_token: Arc::new(AtomicU64::new(1)),
        }
    }
}

impl<P> AckCoordinator<P>
where
    P: Clone + Eq + Hash + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a wait; signals count from now on
    ///
    /// Only signals carrying a mark at or above `watermark` are counted.
    pub fn register(&self, parties: impl IntoIterator<Item = P>, watermark: u64) -> WaitTicket<P> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let set = Arc::new(WaitSet {
            parties: parties.into_iter().collect(),
            watermark,
            signaled: Mutex::new(HashSet::new()),
            notify: Notify::new(),
        });
        self.waits.lock().insert(token, set.clone());

        WaitTicket {
            token,
            set,
            waits: self.waits.clone(),
        }
    }

    /// Register, wait, deregister
    pub async fn wait_for_signals(
        &self,
        required: usize,
        parties: impl IntoIterator<Item = P>,
        timeout: Duration,
    ) -> usize {
        self.register(parties, 0).wait(required, timeout).await
    }

    /// Signal `party` in every registered wait that contains it
    pub fn signal(&self, party: &P) {
        self.signal_at(party, u64::MAX);
    }

    /// Signal with a progress mark; waits with a higher watermark ignore it
    pub fn signal_at(&self, party: &P, mark: u64) {
        // clone the matching sets so the registry lock is not held while waking
        let matching: Vec<Arc<WaitSet<P>>> = self
            .waits
            .lock()
            .values()
            .filter(|set| mark >= set.watermark && set.parties.contains(party))
            .cloned()
            .collect();

        for set in matching {
            let newly = set.signaled.lock().insert(party.clone());
            if newly {
                set.notify.notify_waiters();
            }
        }
    }

    /// Number of live registrations
    pub fn active_waits(&self) -> usize {
        self.waits.lock().len()
    }
}

/// A registered wait; dropping it deregisters
pub struct WaitTicket<P: Eq + Hash> {
    token: u64,
    set: Arc<WaitSet<P>>,
    waits: Arc<Mutex<HashMap<u64, Arc<WaitSet<P>>>>>,
}

impl<P: Eq + Hash> WaitTicket<P> {
    /// Distinct parties signaled so far
    pub fn signaled(&self) -> usize {
        self.set.signaled_count()
    }

    pub fn parties(&self) -> usize {
        self.set.parties.len()
    }

    /// Block until `min(required, parties)` have signaled or the timeout
    /// passes. Returns the count at the moment of return.
    pub async fn wait(self, required: usize, timeout: Duration) -> usize {
        let goal = required.min(self.set.parties.len());
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.set.notify.notified();
            tokio::pin!(notified);
            // enable before checking so a signal between check and await is not lost
            notified.as_mut().enable();

            let count = self.signaled();
            if count >= goal {
                return count;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.signaled();
            }
        }
    }
}

impl<P: Eq + Hash> Drop for WaitTicket<P> {
    fn drop(&mut self) {
        self.waits.lock().remove(&self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_all_parties_signal() {
        let coordinator: AckCoordinator<u32> = AckCoordinator::new();
        let signaller = coordinator.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            signaller.signal(&1);
            signaller.signal(&2);
            signaller.signal(&2);
        });

        let count = coordinator
            .wait_for_signals(2, vec![1, 2, 3], Duration::from_secs(5))
            .await;
        assert_eq!(count, 2);
        assert_eq!(coordinator.active_waits(), 0);
    }

    #[tokio::test]
    async fn test_no_signals_waits_full_timeout() {
        let coordinator: AckCoordinator<u32> = AckCoordinator::new();
        let started = std::time::Instant::now();
        let count = coordinator
            .wait_for_signals(1, vec![1], Duration::from_millis(100))
            .await;
        assert_eq!(count, 0);
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_required_capped_by_parties() {
        let coordinator: AckCoordinator<u32> = AckCoordinator::new();
        let ticket = coordinator.register(vec![9], 0);
        coordinator.signal(&9);
        assert_eq!(ticket.wait(5, Duration::from_secs(5)).await, 1);
    }

    #[tokio::test]
    async fn test_zero_timeout_reports_current_state() {
        let coordinator: AckCoordinator<u32> = AckCoordinator::new();
        let ticket = coordinator.register(vec![1, 2], 0);
        coordinator.signal(&1);
        assert_eq!(ticket.wait(2, Duration::ZERO).await, 1);
    }

    #[tokio::test]
    async fn test_watermark_filters_stale_signals() {
        let coordinator: AckCoordinator<u32> = AckCoordinator::new();
        let ticket = coordinator.register(vec![1, 2], 100);
        coordinator.signal_at(&1, 99);
        coordinator.signal_at(&2, 100);
        assert_eq!(ticket.signaled(), 1);
    }

    #[tokio::test]
    async fn test_disjoint_waits_are_independent() {
        let coordinator: AckCoordinator<u32> = AckCoordinator::new();

        let first = tokio::spawn({
            let c = coordinator.clone();
            async move { c.wait_for_signals(2, vec![1, 2], Duration::from_millis(500)).await }
        });
        let second = tokio::spawn({
            let c = coordinator.clone();
            async move { c.wait_for_signals(2, vec![3, 4], Duration::from_millis(300)).await }
        });

        // let both register
        while coordinator.active_waits() < 2 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let started = std::time::Instant::now();
        coordinator.signal(&1);
        coordinator.signal(&2);

        assert_eq!(first.await.unwrap(), 2);
        assert!(started.elapsed() < Duration::from_millis(250));
        assert_eq!(second.await.unwrap(), 0);
    }
}
