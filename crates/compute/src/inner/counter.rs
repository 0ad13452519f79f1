//! Lock-free bookkeeping of one inner task's invocations.
//!
//! Layout of the packed word: bits 0..31 invoked count, bits 31..62 result
//! count, bit 63 the "last result sent" flag.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

const COUNT_BITS: u32 = 31;
const COUNT_MASK: u64 = (1 << COUNT_BITS) - 1;
const RESULT_SHIFT: u32 = COUNT_BITS;
const LAST_FLAG: u64 = 1 << 63;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationCounts {
    pub invoked: u32,
    pub results: u32,
    pub last_result_sent: bool,
}

impl InvocationCounts {
    fn unpack(word: u64) -> Self {
        Self {
            invoked: (word & COUNT_MASK) as u32,
            results: ((word >> RESULT_SHIFT) & COUNT_MASK) as u32,
            last_result_sent: word & LAST_FLAG != 0,
        }
    }

    fn pack(&self) -> u64 {
        let mut word = u64::from(self.invoked) | (u64::from(self.results) << RESULT_SHIFT);
        if self.last_result_sent {
            word |= LAST_FLAG;
        }
        word
    }
}

#[derive(Debug, Default)]
pub struct InvocationCounter {
    state: AtomicU64,
}

impl InvocationCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> InvocationCounts {
        InvocationCounts::unpack(self.state.load(Ordering::Acquire))
    }

    /// Idle → Invoking. Fails once the last result was sent.
    pub fn try_begin(&self) -> bool {
        self.update(|c| {
            if c.last_result_sent {
                return None;
            }
            assert!(u64::from(c.invoked) < COUNT_MASK, "invocation count overflow");
            Some(InvocationCounts {
                invoked: c.invoked + 1,
                ..c
            })
        })
        .is_some()
    }

    /// Roll back a begin whose invocation never ran.
    pub fn cancel_begin(&self) {
        self.update(|c| {
            assert!(
                c.invoked > c.results && !c.last_result_sent,
                "cancelling an invocation that was not begun: {c:?}"
            );
            Some(InvocationCounts {
                invoked: c.invoked - 1,
                ..c
            })
        });
    }

    /// Invoking → ResultPosted.
    pub fn post_result(&self) -> InvocationCounts {
        self.update(|c| {
            assert!(!c.last_result_sent, "result posted after the last result: {c:?}");
            assert!(c.results < c.invoked, "more results than invocations: {c:?}");
            Some(InvocationCounts {
                results: c.results + 1,
                ..c
            })
        })
        .unwrap_or_default()
    }

    /// Set the last-result flag. Every begun invocation must have posted.
    pub fn finish(&self) -> InvocationCounts {
        self.update(|c| {
            assert!(!c.last_result_sent, "last result sent twice: {c:?}");
            assert_eq!(c.results, c.invoked, "finishing with invocations in flight");
            Some(InvocationCounts {
                last_result_sent: true,
                ..c
            })
        })
        .unwrap_or_default()
    }

    /// CAS loop; `f` returning `None` leaves the state untouched.
    fn update(
        &self,
        f: impl Fn(InvocationCounts) -> Option<InvocationCounts>,
    ) -> Option<InvocationCounts> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let next = f(InvocationCounts::unpack(current))?;
            match self.state.compare_exchange_weak(
                current,
                next.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(next),
                Err(actual) => current = actual,
            }
        }
    }
}
