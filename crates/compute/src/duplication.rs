//! Duplication predicates gate how many times an inner task is invoked.
//!
//! Contract: once a predicate answers `false` it must answer `false` forever.
//! [`SerializedPredicate`] enforces that contract and additionally makes
//! evaluation mutually exclusive when a predicate is shared by several
//! duplicating environments.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use kiln_core::sync::lock;
use kiln_core::TaskError;

pub trait DuplicationPredicate: Send + Sync {
    fn should_invoke_once_more(&self) -> Result<bool, TaskError>;
}

impl<F> DuplicationPredicate for F
where
    F: Fn() -> Result<bool, TaskError> + Send + Sync,
{
    fn should_invoke_once_more(&self) -> Result<bool, TaskError> {
        self()
    }
}

/// Answers `true` exactly `count` times.
#[derive(Debug)]
pub struct FixedCountPredicate {
    remaining: AtomicI64,
}

impl FixedCountPredicate {
    pub fn new(count: u32) -> Self {
        Self {
            remaining: AtomicI64::new(i64::from(count)),
        }
    }

    pub fn remaining(&self) -> i64 {
        self.remaining.load(Ordering::Acquire)
    }
}

impl DuplicationPredicate for FixedCountPredicate {
    fn should_invoke_once_more(&self) -> Result<bool, TaskError> {
        Ok(self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| (r > 0).then(|| r - 1))
            .is_ok())
    }
}

/// Serializes evaluation of the wrapped predicate and latches the first
/// `false` (or error) so every later call answers `false`.
///
/// Evaluation and the decision to start an invocation are still separate
/// steps: a caller that saw `true` may start its invocation after another
/// caller already saw `false`. Callers needing an exact count must encode it
/// in the predicate itself.
pub struct SerializedPredicate<P> {
    inner: P,
    exhausted: Mutex<bool>,
}

impl<P: DuplicationPredicate> SerializedPredicate<P> {
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            exhausted: Mutex::new(false),
        }
    }

    pub fn is_exhausted(&self) -> bool {
        *lock(&self.exhausted)
    }
}

impl<P: DuplicationPredicate> DuplicationPredicate for SerializedPredicate<P> {
    fn should_invoke_once_more(&self) -> Result<bool, TaskError> {
        let mut exhausted = lock(&self.exhausted);
        if *exhausted {
            return Ok(false);
        }
        let answer = self.inner.should_invoke_once_more();
        if !matches!(answer, Ok(true)) {
            *exhausted = true;
        }
        answer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fixed_count_answers_true_n_times() {
        let p = FixedCountPredicate::new(2);
        assert!(p.should_invoke_once_more().unwrap());
        assert!(p.should_invoke_once_more().unwrap());
        assert!(!p.should_invoke_once_more().unwrap());
        assert!(!p.should_invoke_once_more().unwrap());
        assert_eq!(p.remaining(), 0);
    }

    #[test]
    fn serialized_latches_false_even_if_inner_flips_back() {
        let calls = AtomicUsize::new(0);
        // true, false, true, true, ...
        let flaky = move || Ok::<_, TaskError>(calls.fetch_add(1, Ordering::SeqCst) != 1);
        let p = SerializedPredicate::new(flaky);
        assert!(p.should_invoke_once_more().unwrap());
        assert!(!p.should_invoke_once_more().unwrap());
        assert!(!p.should_invoke_once_more().unwrap());
        assert!(p.is_exhausted());
    }

    #[test]
    fn serialized_latches_errors() {
        let p = SerializedPredicate::new(|| Err::<bool, _>(TaskError::failed("predicate broke")));
        assert!(p.should_invoke_once_more().is_err());
        assert_eq!(p.should_invoke_once_more(), Ok(false));
    }

    #[test]
    fn serialized_evaluation_is_exclusive() {
        let inside = Arc::new(AtomicUsize::new(0));
        let overlap = Arc::new(AtomicUsize::new(0));
        let p = {
            let inside = Arc::clone(&inside);
            let overlap = Arc::clone(&overlap);
            Arc::new(SerializedPredicate::new(move || {
                if inside.fetch_add(1, Ordering::SeqCst) > 0 {
                    overlap.fetch_add(1, Ordering::SeqCst);
                }
                thread::yield_now();
                inside.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, TaskError>(true)
            }))
        };
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let p = Arc::clone(&p);
                thread::spawn(move || {
                    for _ in 0..200 {
                        p.should_invoke_once_more().unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(overlap.load(Ordering::SeqCst), 0);
    }
}
