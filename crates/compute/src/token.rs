//! Process-wide admission control for CPU-heavy work.
//!
//! A [`TokenAllocator`] bounds the sum of computation tokens checked out by
//! all [`AllocatorKey`]s. The bound is soft in one direction: a key that holds
//! nothing is granted its full request as long as the pool is not already
//! full, even if that pushes the sum past the maximum. Keys that already hold
//! tokens may always grow, so a holder never deadlocks against itself.
//! Duplicated work goes through [`TokenAllocator::request_additional_abortable`]
//! which only takes genuinely free capacity.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};

use kiln_core::sync::{lock, wait};
use kiln_core::ExecutionConfig;
use tracing::{debug, info};

static NEXT_KEY: AtomicU64 = AtomicU64::new(1);

/// Identity grouping the tokens of one holder. Keys compare by identity:
/// clones share it, and no two calls to [`AllocatorKey::new`] produce equal keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AllocatorKey(u64);

impl AllocatorKey {
    /// Mint a fresh identity.
    pub fn new() -> Self {
        Self(NEXT_KEY.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for AllocatorKey {
    fn default() -> Self {
        Self::new()
    }
}

/// Tokens held by one key. `epoch` identifies this holding: once it is
/// emptied by `close_all`, tokens granted under it release nothing.
#[derive(Debug, Clone, Copy)]
struct Holding {
    count: usize,
    epoch: u64,
}

#[derive(Debug, Default)]
struct AllocationState {
    allocated: HashMap<AllocatorKey, Holding>,
    total: usize,
    next_epoch: u64,
    /// First-time requesters blocked on a full pool, by key.
    priority_waiters: HashMap<AllocatorKey, usize>,
}

impl AllocationState {
    fn held(&self, key: &AllocatorKey) -> usize {
        self.allocated.get(key).map_or(0, |h| h.count)
    }

    /// Returns the epoch of the holding the tokens were added to.
    fn grant(&mut self, key: &AllocatorKey, count: usize) -> u64 {
        self.total += count;
        if let Some(holding) = self.allocated.get_mut(key) {
            holding.count += count;
            return holding.epoch;
        }
        self.next_epoch += 1;
        let epoch = self.next_epoch;
        self.allocated.insert(key.clone(), Holding { count, epoch });
        epoch
    }

    /// Release `count` tokens granted under `epoch`. A holding that was
    /// already emptied by `release_all` is left alone. Returns whether
    /// anything was released.
    fn release(&mut self, key: &AllocatorKey, count: usize, epoch: u64) -> bool {
        let Some(holding) = self.allocated.get_mut(key) else {
            return false;
        };
        if holding.epoch != epoch {
            return false;
        }
        let held = holding.count;
        assert!(
            count <= held,
            "releasing {count} computation tokens but the key holds {held}"
        );
        if held == count {
            self.allocated.remove(key);
        } else {
            holding.count -= count;
        }
        self.total -= count;
        true
    }

    fn release_all(&mut self, key: &AllocatorKey) -> usize {
        let held = self.allocated.remove(key).map_or(0, |h| h.count);
        self.total -= held;
        held
    }

    fn add_priority_waiter(&mut self, key: &AllocatorKey) {
        *self.priority_waiters.entry(key.clone()).or_insert(0) += 1;
    }

    fn remove_priority_waiter(&mut self, key: &AllocatorKey) {
        if let Some(n) = self.priority_waiters.get_mut(key) {
            *n -= 1;
            if *n == 0 {
                self.priority_waiters.remove(key);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    /// Holders may grow; newcomers wait as priority waiters.
    Primary,
    /// Only free capacity, and only when no priority waiter is queued.
    Additional,
}

/// Bounded pool of computation tokens shared by every [`AllocatorKey`].
pub struct TokenAllocator {
    max_tokens: usize,
    state: Mutex<AllocationState>,
    changed: Condvar,
}

static GLOBAL: OnceLock<Arc<TokenAllocator>> = OnceLock::new();

impl TokenAllocator {
    /// Independent allocator with room for `max_tokens` (at least one).
    pub fn new(max_tokens: usize) -> Self {
        Self {
            max_tokens: max_tokens.max(1),
            state: Mutex::new(AllocationState::default()),
            changed: Condvar::new(),
        }
    }

    /// Allocator sized by `computation_token_count`.
    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self::new(config.computation_token_count)
    }

    /// The process-wide allocator, sized from the environment on first use.
    pub fn global() -> Arc<TokenAllocator> {
        Arc::clone(GLOBAL.get_or_init(|| {
            let config = ExecutionConfig::from_env();
            info!("Computation tokens: max={}", config.computation_token_count);
            Arc::new(Self::from_config(&config))
        }))
    }

    /// Configured maximum. The sum of grants may exceed it through first holders.
    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// Tokens currently checked out by all keys.
    pub fn allocated_total(&self) -> usize {
        lock(&self.state).total
    }

    /// Tokens currently checked out by `key`.
    pub fn allocated_for(&self, key: &AllocatorKey) -> usize {
        lock(&self.state).held(key)
    }

    /// Blocks until `count` tokens are granted to `key`.
    pub fn request(self: &Arc<Self>, key: &AllocatorKey, count: usize) -> ComputationToken {
        let epoch = self.acquire(key, count, Admission::Primary, None).unwrap_or(0);
        ComputationToken::new(Arc::clone(self), key.clone(), count, epoch)
    }

    /// Like [`request`](Self::request), but gives up with `None` once `abort`
    /// returns true. `abort` is re-checked before every wait.
    pub fn request_abortable(
        self: &Arc<Self>,
        key: &AllocatorKey,
        count: usize,
        abort: &dyn Fn() -> bool,
    ) -> Option<ComputationToken> {
        self.acquire(key, count, Admission::Primary, Some(abort))
            .map(|epoch| ComputationToken::new(Arc::clone(self), key.clone(), count, epoch))
    }

    /// Grants only free capacity, without the reentrant shortcut, and defers
    /// to first-time requesters waiting on a full pool.
    pub fn request_additional_abortable(
        self: &Arc<Self>,
        key: &AllocatorKey,
        count: usize,
        abort: &dyn Fn() -> bool,
    ) -> Option<ComputationToken> {
        self.acquire(key, count, Admission::Additional, Some(abort))
            .map(|epoch| ComputationToken::new(Arc::clone(self), key.clone(), count, epoch))
    }

    /// Wake every waiter so it re-evaluates its abort condition.
    pub fn wake_up_waiters(&self) {
        let _guard = lock(&self.state);
        self.changed.notify_all();
    }

    /// Returns the epoch of the grant, `None` only if aborted. Empty
    /// requests get epoch 0, which matches no holding.
    fn acquire(
        &self,
        key: &AllocatorKey,
        count: usize,
        admission: Admission,
        abort: Option<&dyn Fn() -> bool>,
    ) -> Option<u64> {
        if count == 0 {
            return Some(0);
        }
        let mut state = lock(&self.state);
        let mut waiting = false;
        loop {
            let granted = match admission {
                Admission::Primary => {
                    state.allocated.contains_key(key) || state.total < self.max_tokens
                }
                Admission::Additional => {
                    state.total < self.max_tokens && state.priority_waiters.is_empty()
                }
            };
            if granted {
                let left_priority = waiting && admission == Admission::Primary;
                if left_priority {
                    state.remove_priority_waiter(key);
                }
                let epoch = state.grant(key, count);
                debug!(
                    count,
                    total = state.total,
                    max = self.max_tokens,
                    "computation tokens granted"
                );
                drop(state);
                if left_priority {
                    // Additional requests may have been held back by us.
                    self.changed.notify_all();
                }
                return Some(epoch);
            }
            if abort.is_some_and(|abort| abort()) {
                if waiting && admission == Admission::Primary {
                    state.remove_priority_waiter(key);
                    drop(state);
                    self.changed.notify_all();
                }
                return None;
            }
            if !waiting {
                waiting = true;
                if admission == Admission::Primary {
                    state.add_priority_waiter(key);
                }
            }
            state = wait(&self.changed, state);
        }
    }

    fn release(&self, key: &AllocatorKey, count: usize, epoch: u64) {
        if count == 0 {
            return;
        }
        let released = lock(&self.state).release(key, count, epoch);
        if released {
            self.changed.notify_all();
        }
    }

    fn release_all(&self, key: &AllocatorKey) {
        let held = lock(&self.state).release_all(key);
        if held > 0 {
            self.changed.notify_all();
        }
    }
}

impl std::fmt::Debug for TokenAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenAllocator")
            .field("max_tokens", &self.max_tokens)
            .field("allocated_total", &self.allocated_total())
            .finish()
    }
}

// ── Token ──────────────────────────────────────────

/// A lease of `allocated` tokens for one key. Released exactly once: the first
/// of `close`, `close_all`, a successful `release_if_over_allocated`, or drop.
pub struct ComputationToken {
    allocator: Arc<TokenAllocator>,
    key: AllocatorKey,
    allocated: usize,
    epoch: u64,
    released: AtomicBool,
}

impl ComputationToken {
    fn new(allocator: Arc<TokenAllocator>, key: AllocatorKey, allocated: usize, epoch: u64) -> Self {
        Self {
            allocator,
            key,
            allocated,
            epoch,
            released: AtomicBool::new(false),
        }
    }

    /// Tokens granted by the request that produced this lease.
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    /// Key the tokens were granted to.
    pub fn key(&self) -> &AllocatorKey {
        &self.key
    }

    /// True once this lease gave its tokens back, by any release path.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Release this token's allocation. Later calls are no-ops, and so is a
    /// close after the key's tokens were released with `close_all`.
    pub fn close(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.allocator.release(&self.key, self.allocated, self.epoch);
        }
    }

    /// Release everything the key holds, including other tokens' shares.
    pub fn close_all(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.allocator.release_all(&self.key);
        }
    }

    /// Give the tokens back if the pool is oversubscribed by at least this
    /// token's size, or a first-time requester is waiting. Returns true when
    /// the token no longer holds anything.
    pub fn release_if_over_allocated(&self) -> bool {
        if self.allocated == 0 {
            return true;
        }
        let allocator = &self.allocator;
        let mut state = lock(&allocator.state);
        if self.is_released() {
            return true;
        }
        let over = state.total.saturating_sub(allocator.max_tokens) >= self.allocated;
        if !over && state.priority_waiters.is_empty() {
            return false;
        }
        if self
            .released
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return true;
        }
        if state.release(&self.key, self.allocated, self.epoch) {
            drop(state);
            allocator.changed.notify_all();
        }
        true
    }
}

impl Drop for ComputationToken {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ComputationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputationToken")
            .field("key", &self.key)
            .field("allocated", &self.allocated)
            .field("released", &self.is_released())
            .finish()
    }
}
