//! Context window management
//!
//! Tracks how many tokens the runtime has evaluated (`n_past`), the history
//! ring used as repetition-penalty window, and the tokens waiting for
//! evaluation. When pending tokens would overflow the window, the context is
//! swapped: the first `n_keep` tokens stay, and half of the discarded tail is
//! re-evaluated from the history ring.

use std::collections::VecDeque;

use crate::error::ServiceError;
use crate::inference::runtime::{ModelRuntime, TokenId};

/// Fixed-size ring of the most recent tokens, oldest first.
#[derive(Debug, Clone)]
pub struct HistoryRing {
    tokens: VecDeque<TokenId>,
}

impl HistoryRing {
    /// A ring of `capacity` pad (0) tokens
    pub fn new(capacity: usize) -> Self {
        Self {
            tokens: std::iter::repeat(0).take(capacity).collect(),
        }
    }

    /// Evicts the oldest entry and appends `token`
    pub fn push(&mut self, token: TokenId) {
        if self.tokens.pop_front().is_some() {
            self.tokens.push_back(token);
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// The newest `n` entries, oldest first
    pub fn window(&mut self, n: usize) -> &[TokenId] {
        let n = n.min(self.tokens.len());
        let all = self.tokens.make_contiguous();
        &all[all.len() - n..]
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &TokenId> + ExactSizeIterator {
        self.tokens.iter()
    }

    /// `count` entries ending `skip_newest` entries before the newest one
    fn slice_before_newest(&self, skip_newest: usize, count: usize) -> Vec<TokenId> {
        let end = self.tokens.len().saturating_sub(skip_newest);
        let start = end.saturating_sub(count);
        self.tokens.range(start..end).copied().collect()
    }
}

/// Evaluation state of one query.
#[derive(Debug)]
pub struct ContextState {
    capacity: usize,
    n_keep: usize,
    n_past: usize,
    history: HistoryRing,
    pending: Vec<TokenId>,
}

impl ContextState {
    pub fn new(capacity: usize, n_keep: usize) -> Self {
        Self {
            capacity,
            n_keep: n_keep.min(capacity),
            n_past: 0,
            history: HistoryRing::new(capacity),
            pending: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Tokens resident in the runtime
    pub fn n_past(&self) -> usize {
        self.n_past
    }

    pub fn pending(&self) -> &[TokenId] {
        &self.pending
    }

    pub fn history(&self) -> &HistoryRing {
        &self.history
    }

    pub fn history_mut(&mut self) -> &mut HistoryRing {
        &mut self.history
    }

    /// Queues `token` for evaluation and records it in the history ring
    pub fn push_pending(&mut self, token: TokenId) {
        self.pending.push(token);
        self.history.push(token);
    }

    /// Makes room for the pending tokens, then evaluates them.
    ///
    /// On success `n_past + pending.len() <= capacity`.
    pub fn prepare_for_eval(
        &mut self,
        runtime: &mut (dyn ModelRuntime + '_),
    ) -> Result<(), ServiceError> {
        if self.pending.is_empty() {
            return Ok(());
        }

        if self.n_past + self.pending.len() > self.capacity {
            self.swap()?;
        }

        runtime.evaluate(&self.pending, self.n_past)
    }

    /// Marks the pending tokens as evaluated
    pub fn commit(&mut self) {
        self.n_past += self.pending.len();
        self.pending.clear();
    }

    /// Keeps the first `n_keep` tokens and re-queues half of the rest.
    /// Returns the number of history tokens spliced in front of pending.
    ///
    /// When `n_keep` plus the pending tokens exceed the capacity, this swap
    /// keeps only as much of the prefix as leaves room for them.
    pub fn swap(&mut self) -> Result<usize, ServiceError> {
        if self.pending.len() > self.capacity {
            return Err(ServiceError::EvalFailed(format!(
                "{} pending tokens exceed a context of {}",
                self.pending.len(),
                self.capacity
            )));
        }

        let keep = self.n_keep.min(self.capacity - self.pending.len());
        if keep < self.n_keep {
            tracing::warn!(
                "context swap keeps {} of {} prefix tokens to fit {} pending tokens",
                keep,
                self.n_keep,
                self.pending.len()
            );
        }

        let n_left = self.n_past as i64 - keep as i64;
        let room = self.capacity - keep - self.pending.len();
        let take = ((n_left / 2).max(0) as usize).min(room);

        // the last pending.len() ring entries are the pending tokens themselves
        let mut spliced = self.history.slice_before_newest(self.pending.len(), take);
        let count = spliced.len();
        spliced.extend_from_slice(&self.pending);
        self.pending = spliced;

        tracing::debug!(
            "context swap: n_past {} -> {}, re-evaluating {} history tokens",
            self.n_past,
            keep,
            count
        );
        self.n_past = keep;

        Ok(count)
    }

    #[cfg(test)]
    fn with_past(mut self, n_past: usize) -> Self {
        self.n_past = n_past;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::mock::MockModel;
    use crate::inference::runtime::{LoadedModel, RuntimeOptions};

    fn filled(capacity: usize, n_keep: usize, history: impl IntoIterator<Item = TokenId>) -> ContextState {
        let mut ctx = ContextState::new(capacity, n_keep);
        for token in history {
            ctx.history.push(token);
        }
        ctx
    }

    #[test]
    fn test_ring_keeps_capacity() {
        let mut ring = HistoryRing::new(4);
        assert_eq!(ring.len(), 4);
        for t in 1..=10 {
            ring.push(t);
            assert_eq!(ring.len(), 4);
        }
        assert_eq!(ring.iter().copied().collect::<Vec<_>>(), vec![7, 8, 9, 10]);
        assert_eq!(ring.window(2), &[9, 10]);
        assert_eq!(ring.window(99), &[7, 8, 9, 10]);
    }

    #[test]
    fn test_ring_starts_padded() {
        let mut ring = HistoryRing::new(3);
        ring.push(5);
        assert_eq!(ring.iter().copied().collect::<Vec<_>>(), vec![0, 0, 5]);
    }

    #[test]
    fn test_overflow_swap() {
        // history 100..=111, then the four pending tokens 200..=203
        let mut ctx = filled(16, 2, 100..112).with_past(15);
        for t in 200..204 {
            ctx.push_pending(t);
        }

        let spliced = ctx.swap().unwrap();

        assert_eq!(spliced, 6);
        assert_eq!(ctx.n_past(), 2);
        assert_eq!(
            ctx.pending(),
            &[106, 107, 108, 109, 110, 111, 200, 201, 202, 203]
        );
        assert!(ctx.n_past() + ctx.pending().len() <= ctx.capacity());
    }

    #[test]
    fn test_swap_with_nothing_to_discard() {
        let mut ctx = ContextState::new(8, 6).with_past(5);
        ctx.push_pending(42);
        ctx.push_pending(43);
        // n_left is negative
        assert_eq!(ctx.swap().unwrap(), 0);
        assert_eq!(ctx.n_past(), 6);
        assert_eq!(ctx.pending(), &[42, 43]);
    }

    #[test]
    fn test_swap_shrinks_oversized_prefix() {
        // n_keep 12 leaves no room for 8 pending tokens in 16
        let mut ctx = filled(16, 12, 100..108).with_past(15);
        for t in 200..208 {
            ctx.push_pending(t);
        }

        let spliced = ctx.swap().unwrap();

        assert_eq!(spliced, 0);
        assert_eq!(ctx.n_past(), 8);
        assert_eq!(ctx.pending(), &[200, 201, 202, 203, 204, 205, 206, 207]);
        assert!(ctx.n_past() + ctx.pending().len() <= ctx.capacity());
        assert_eq!(ctx.n_keep, 12);
    }

    #[test]
    fn test_swap_impossible() {
        let mut ctx = ContextState::new(4, 3).with_past(4);
        for t in 1..=5 {
            ctx.push_pending(t);
        }
        assert!(matches!(ctx.swap(), Err(ServiceError::EvalFailed(_))));
    }

    #[test]
    fn test_prepare_for_eval_keeps_invariant() {
        let model = MockModel::new();
        let mut runtime = model
            .new_runtime(&RuntimeOptions { n_ctx: 16, n_threads: 1, seed: 0 })
            .unwrap();
        let mut ctx = ContextState::new(16, 2);

        for step in 0..200 {
            let batch = (step % 5) + 1;
            for i in 0..batch {
                ctx.push_pending(10 + (step * 7 + i) as TokenId);
            }
            ctx.prepare_for_eval(runtime.as_mut()).unwrap();
            assert!(ctx.n_past() + ctx.pending().len() <= 16);
            ctx.commit();
            assert_eq!(ctx.history().len(), 16);
        }

        let log = model.log();
        assert!(log.evaluations.iter().all(|(n_past, t)| n_past + t.len() <= 16));
    }

    #[test]
    fn test_prepare_for_eval_empty_is_noop() {
        let model = MockModel::new();
        let mut runtime = model
            .new_runtime(&RuntimeOptions { n_ctx: 16, n_threads: 1, seed: 0 })
            .unwrap();
        let mut ctx = ContextState::new(16, 0);
        ctx.prepare_for_eval(runtime.as_mut()).unwrap();
        assert!(model.log().evaluations.is_empty());
    }
}
