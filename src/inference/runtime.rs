//! Model runtime facade
//!
//! The generation core only talks to the model through these traits. A
//! [`ModelLoader`] produces a [`LoadedModel`] once per setup; every query then
//! asks the loaded model for a fresh [`ModelRuntime`] that owns the evaluation
//! state (KV cache, logits) for that query only.

use crate::config::{ModelOptions, SamplingPolicy};
use crate::error::ServiceError;

/// Token id as understood by the model vocabulary
pub type TokenId = i32;

/// Per-query runtime options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeOptions {
    /// Context capacity in tokens
    pub n_ctx: usize,
    /// Threads used for evaluation
    pub n_threads: usize,
    /// Sampling seed (negative = random)
    pub seed: i64,
}

/// Evaluation and sampling against one context window.
pub trait ModelRuntime {
    /// Fixed context capacity of this runtime
    fn context_size(&self) -> usize;

    /// End-of-text token id
    fn eos_token(&self) -> TokenId;

    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>, ServiceError>;

    /// Raw bytes of a single token. Unknown or special tokens may map to
    /// an empty slice.
    fn detokenize(&self, token: TokenId) -> Vec<u8>;

    /// Evaluates `tokens` starting at position `n_past`. Anything the runtime
    /// held at positions `>= n_past` is discarded first.
    fn evaluate(&mut self, tokens: &[TokenId], n_past: usize) -> Result<(), ServiceError>;

    /// Samples the next token from the logits of the last evaluation.
    /// `history` is the repetition-penalty window, oldest first.
    fn sample(
        &mut self,
        history: &[TokenId],
        policy: &SamplingPolicy,
    ) -> Result<TokenId, ServiceError>;
}

/// A model held in memory for the lifetime of a session.
pub trait LoadedModel {
    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>, ServiceError>;

    fn detokenize(&self, token: TokenId) -> Vec<u8>;

    /// Human-readable summary for the setup log
    fn describe(&self) -> String;

    /// Creates the evaluation state for one query.
    fn new_runtime(
        &self,
        options: &RuntimeOptions,
    ) -> Result<Box<dyn ModelRuntime + '_>, ServiceError>;
}

/// Loads models on the engine worker thread.
pub trait ModelLoader: Send {
    fn load(&mut self, options: &ModelOptions) -> Result<Box<dyn LoadedModel>, ServiceError>;
}
