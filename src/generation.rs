//! Monotonic switch generation
//!
//! Every backend switch takes a fresh token. Continuations holding an older
//! token must not commit: the newest switch owns the outcome.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SwitchToken(u64);

impl SwitchToken {
    pub fn value(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Default)]
pub struct SwitchGeneration {
    latest: AtomicU64,
}

impl SwitchGeneration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the token that supersedes every token handed out before.
    pub fn begin(&self) -> SwitchToken {
        SwitchToken(self.latest.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn current(&self) -> SwitchToken {
        SwitchToken(self.latest.load(Ordering::SeqCst))
    }

    pub fn is_current(&self, token: SwitchToken) -> bool {
        self.latest.load(Ordering::SeqCst) == token.0
    }
}
