//! Producer retirement: CancellationToken + generation guard.
//! Every source activation advances the generation; a sink holding an older
//! generation is stale and its writes are dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

/// Issues one generation (and one token) per activated producer.
pub struct SourceGeneration {
    current_token: RwLock<CancellationToken>,
    generation: Arc<AtomicU64>,
}

impl Default for SourceGeneration {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceGeneration {
    pub fn new() -> Self {
        Self {
            current_token: RwLock::new(CancellationToken::new()),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Cancel the current producer, advance the generation and return a guard for the next one.
    pub fn cancel_and_advance(&self) -> GenerationGuard {
        let mut token_guard = self.current_token.write();
        token_guard.cancel();
        let new_root = CancellationToken::new();
        let child = new_root.child_token();
        *token_guard = new_root;
        let gen = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        GenerationGuard::new(Arc::clone(&self.generation), gen, child)
    }

    /// Cancel the current producer without issuing a new generation.
    pub fn cancel_current(&self) {
        self.current_token.read().cancel();
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

/// Checked by a producer before every write.
#[derive(Clone)]
pub struct GenerationGuard {
    generation: Arc<AtomicU64>,
    my_generation: u64,
    token: CancellationToken,
}

impl GenerationGuard {
    pub fn new(generation: Arc<AtomicU64>, my_generation: u64, token: CancellationToken) -> Self {
        Self {
            generation,
            my_generation,
            token,
        }
    }

    #[inline]
    pub fn is_current(&self) -> bool {
        self.generation.load(Ordering::SeqCst) == self.my_generation
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// True while the producer is neither cancelled nor superseded.
    #[inline]
    pub fn should_continue(&self) -> bool {
        !self.is_cancelled() && self.is_current()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn my_generation(&self) -> u64 {
        self.my_generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advancing_retires_previous_guard() {
        let generations = SourceGeneration::new();
        let first = generations.cancel_and_advance();
        assert!(first.should_continue());

        let second = generations.cancel_and_advance();
        assert!(first.is_cancelled());
        assert!(!first.is_current());
        assert!(second.should_continue());
        assert_eq!(second.my_generation(), 2);
    }

    #[test]
    fn cancel_current_retires_without_new_guard() {
        let generations = SourceGeneration::new();
        let guard = generations.cancel_and_advance();
        generations.cancel_current();
        assert!(!guard.should_continue());
        assert_eq!(generations.current_generation(), 2);
    }
}
