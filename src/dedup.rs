// =============================================================================
// Dedup registry — time-bounded sets of processed and in-flight event keys
// =============================================================================
//
// Two sets per registry: `inflight` holds keys claimed by a worker but not
// yet finished; `processed` holds finished keys until their TTL expires. A
// key never lives in both sets. Memory stays O(events inside the TTL window).
//
// Expiry sweeps piggy-back on normal operations and run at most once per
// second.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::types::DedupKey;

/// TTL of the in-flight set.
const INFLIGHT_TTL: Duration = Duration::from_secs(5 * 60);
/// Processed TTL for order keys.
const ORDER_PROCESSED_TTL: Duration = Duration::from_secs(60 * 60);
/// Processed TTL for position keys.
const POSITION_PROCESSED_TTL: Duration = Duration::from_secs(30 * 60);

/// Minimum spacing between expiry sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

struct RegistryState {
    inflight: HashMap<DedupKey, Instant>,
    processed: HashMap<DedupKey, Instant>,
    last_sweep: Instant,
}

/// Concurrent registry of observed event keys.
pub struct DedupRegistry {
    state: Mutex<RegistryState>,
    inflight_ttl: Duration,
    processed_ttl: Duration,
}

impl DedupRegistry {
    pub fn new(processed_ttl: Duration, inflight_ttl: Duration) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                inflight: HashMap::new(),
                processed: HashMap::new(),
                last_sweep: Instant::now(),
            }),
            inflight_ttl,
            processed_ttl,
        }
    }

    /// Registry for order keys: processed entries live 60 min.
    pub fn for_orders() -> Self {
        Self::new(ORDER_PROCESSED_TTL, INFLIGHT_TTL)
    }

    /// Registry for position keys: processed entries live 30 min.
    pub fn for_positions() -> Self {
        Self::new(POSITION_PROCESSED_TTL, INFLIGHT_TTL)
    }

    /// Atomically claim `key` for processing. Returns `true` iff the key was
    /// neither in flight nor already processed; on `true` the key is now in
    /// the in-flight set.
    pub fn try_claim(&self, key: &DedupKey) -> bool {
        let mut state = self.state.lock();
        self.maybe_sweep(&mut state);
        if state.processed.contains_key(key) || state.inflight.contains_key(key) {
            return false;
        }
        state.inflight.insert(key.clone(), Instant::now());
        true
    }

    /// Move `key` from the in-flight set to the processed set.
    pub fn mark_processed(&self, key: &DedupKey) {
        let mut state = self.state.lock();
        state.inflight.remove(key);
        state.processed.insert(key.clone(), Instant::now());
    }

    pub fn is_processed(&self, key: &DedupKey) -> bool {
        let mut state = self.state.lock();
        self.maybe_sweep(&mut state);
        state.processed.contains_key(key)
    }

    fn maybe_sweep(&self, state: &mut RegistryState) {
        let now = Instant::now();
        if now.duration_since(state.last_sweep) < SWEEP_INTERVAL {
            return;
        }
        state.last_sweep = now;
        let inflight_ttl = self.inflight_ttl;
        let processed_ttl = self.processed_ttl;
        state
            .inflight
            .retain(|_, seen| now.duration_since(*seen) < inflight_ttl);
        state
            .processed
            .retain(|_, seen| now.duration_since(*seen) < processed_ttl);
    }

    #[cfg(test)]
    fn counts(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.inflight.len(), state.processed.len())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: i64) -> DedupKey {
        DedupKey::new("pid-1", n)
    }

    #[test]
    fn claim_is_exclusive() {
        let reg = DedupRegistry::for_positions();
        assert!(reg.try_claim(&key(1)));
        assert!(!reg.try_claim(&key(1)));
        // A different uTime is a different observation.
        assert!(reg.try_claim(&key(2)));
    }

    #[test]
    fn processed_blocks_reclaim() {
        let reg = DedupRegistry::for_orders();
        assert!(reg.try_claim(&key(1)));
        reg.mark_processed(&key(1));
        assert!(reg.is_processed(&key(1)));
        assert!(!reg.try_claim(&key(1)));
    }

    #[test]
    fn key_never_in_both_sets() {
        let reg = DedupRegistry::for_positions();
        assert!(reg.try_claim(&key(1)));
        assert_eq!(reg.counts(), (1, 0));
        reg.mark_processed(&key(1));
        assert_eq!(reg.counts(), (0, 1));
    }

    #[test]
    fn expired_entries_are_swept() {
        let reg = DedupRegistry::new(Duration::from_millis(10), Duration::from_millis(10));
        assert!(reg.try_claim(&key(1)));
        reg.mark_processed(&key(1));
        assert!(reg.try_claim(&key(2)));

        // Wait past both TTLs and the sweep interval.
        std::thread::sleep(Duration::from_millis(1100));
        assert!(!reg.is_processed(&key(1)));
        assert_eq!(reg.counts(), (0, 0));
        // The key is claimable again after expiry.
        assert!(reg.try_claim(&key(1)));
    }

    #[test]
    fn sweeps_are_rate_limited() {
        let reg = DedupRegistry::new(Duration::ZERO, Duration::ZERO);
        assert!(reg.try_claim(&key(1)));
        reg.mark_processed(&key(1));
        // TTL is zero but the sweep ran at construction time, so within the
        // one-second window the entry is still visible.
        assert!(reg.is_processed(&key(1)));
    }
}
