//! Scripted in-memory model
//!
//! A byte-level tokenizer and a sampler that replays a fixed script. Used by
//! the test suites and for exercising the service without model weights.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::{ModelOptions, SamplingPolicy};
use crate::error::ServiceError;
use crate::inference::runtime::{LoadedModel, ModelLoader, ModelRuntime, RuntimeOptions, TokenId};

pub const PAD_TOKEN: TokenId = 0;
pub const BOS_TOKEN: TokenId = 1;
pub const EOS_TOKEN: TokenId = 2;
const BYTE_OFFSET: TokenId = 3;

/// Token id of a single byte
pub fn byte_token(b: u8) -> TokenId {
    b as TokenId + BYTE_OFFSET
}

/// Everything the mock observed, for assertions
#[derive(Debug, Default, Clone)]
pub struct MockLog {
    /// `(n_past, tokens)` of every evaluation
    pub evaluations: Vec<(usize, Vec<TokenId>)>,
    /// Length of the history window passed to each sample call
    pub history_lens: Vec<usize>,
    /// Options of every model load, in order
    pub loads: Vec<ModelOptions>,
}

impl MockLog {
    pub fn sample_calls(&self) -> usize {
        self.history_lens.len()
    }
}

#[derive(Debug)]
struct MockState {
    script: VecDeque<TokenId>,
    filler: TokenId,
    fail_eval_at: Option<usize>,
    log: MockLog,
}

/// Shared handle to a scripted model. Clones observe the same script and log.
#[derive(Debug, Clone)]
pub struct MockModel {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockModel {
    fn default() -> Self {
        Self::new()
    }
}

impl MockModel {
    /// Empty script; every sample yields `'.'`
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                script: VecDeque::new(),
                filler: byte_token(b'.'),
                fail_eval_at: None,
                log: MockLog::default(),
            })),
        }
    }

    /// Appends the bytes of `text` to the sample script
    pub fn with_output(self, text: &str) -> Self {
        self.lock().script.extend(text.bytes().map(byte_token));
        self
    }

    /// Appends an end-of-text token to the sample script
    pub fn with_eos(self) -> Self {
        self.lock().script.push_back(EOS_TOKEN);
        self
    }

    /// Token sampled once the script is exhausted
    pub fn with_filler(self, filler: u8) -> Self {
        self.lock().filler = byte_token(filler);
        self
    }

    /// The evaluation with this zero-based index fails
    pub fn fail_eval_at(self, index: usize) -> Self {
        self.lock().fail_eval_at = Some(index);
        self
    }

    pub fn log(&self) -> MockLog {
        self.lock().log.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn encode(text: &str, add_bos: bool) -> Vec<TokenId> {
        let mut tokens = Vec::with_capacity(text.len() + 1);
        if add_bos {
            tokens.push(BOS_TOKEN);
        }
        tokens.extend(text.bytes().map(byte_token));
        tokens
    }

    fn decode(token: TokenId) -> Vec<u8> {
        match u8::try_from(token - BYTE_OFFSET) {
            Ok(b) if token >= BYTE_OFFSET => vec![b],
            _ => Vec::new(),
        }
    }
}

impl LoadedModel for MockModel {
    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>, ServiceError> {
        Ok(Self::encode(text, add_bos))
    }

    fn detokenize(&self, token: TokenId) -> Vec<u8> {
        Self::decode(token)
    }

    fn describe(&self) -> String {
        "mock byte-level model".to_string()
    }

    fn new_runtime(
        &self,
        options: &RuntimeOptions,
    ) -> Result<Box<dyn ModelRuntime + '_>, ServiceError> {
        Ok(Box::new(MockRuntime {
            model: self,
            n_ctx: options.n_ctx,
            has_logits: false,
        }))
    }
}

/// Per-query view of a [`MockModel`]
pub struct MockRuntime<'m> {
    model: &'m MockModel,
    n_ctx: usize,
    has_logits: bool,
}

impl ModelRuntime for MockRuntime<'_> {
    fn context_size(&self) -> usize {
        self.n_ctx
    }

    fn eos_token(&self) -> TokenId {
        EOS_TOKEN
    }

    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>, ServiceError> {
        Ok(MockModel::encode(text, add_bos))
    }

    fn detokenize(&self, token: TokenId) -> Vec<u8> {
        MockModel::decode(token)
    }

    fn evaluate(&mut self, tokens: &[TokenId], n_past: usize) -> Result<(), ServiceError> {
        let mut state = self.model.lock();
        let index = state.log.evaluations.len();
        state.log.evaluations.push((n_past, tokens.to_vec()));

        if state.fail_eval_at == Some(index) {
            return Err(ServiceError::EvalFailed("scripted failure".to_string()));
        }
        if n_past + tokens.len() > self.n_ctx {
            return Err(ServiceError::EvalFailed(format!(
                "context overflow: {} + {} > {}",
                n_past,
                tokens.len(),
                self.n_ctx
            )));
        }

        self.has_logits = !tokens.is_empty();
        Ok(())
    }

    fn sample(
        &mut self,
        history: &[TokenId],
        policy: &SamplingPolicy,
    ) -> Result<TokenId, ServiceError> {
        if !self.has_logits {
            return Err(ServiceError::EvalFailed("no logits available".to_string()));
        }

        let mut state = self.model.lock();
        state.log.history_lens.push(history.len());
        let token = state.script.pop_front().unwrap_or(state.filler);
        if policy.ignore_eos && token == EOS_TOKEN {
            return Ok(state.filler);
        }
        Ok(token)
    }
}

/// Loader handing out a shared [`MockModel`]
#[derive(Debug, Clone)]
pub struct MockLoader {
    model: MockModel,
    failure: Option<String>,
}

impl MockLoader {
    pub fn new(model: MockModel) -> Self {
        Self {
            model,
            failure: None,
        }
    }

    /// Every load fails with `reason`
    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            model: MockModel::new(),
            failure: Some(reason.into()),
        }
    }
}

impl ModelLoader for MockLoader {
    fn load(&mut self, options: &ModelOptions) -> Result<Box<dyn LoadedModel>, ServiceError> {
        self.model.lock().log.loads.push(options.clone());
        match &self.failure {
            Some(reason) => Err(ServiceError::ModelLoadFailed {
                path: options.path.display().to_string(),
                reason: reason.clone(),
            }),
            None => Ok(Box::new(self.model.clone())),
        }
    }
}
