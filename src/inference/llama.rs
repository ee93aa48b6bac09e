//! llama.cpp runtime
//!
//! [`ModelLoader`] implementation on top of `llama-cpp-2`. Everything here
//! runs on the engine worker thread.

use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::Arc;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::logit_bias::LlamaLogitBias;
use llama_cpp_2::token::LlamaToken;

use crate::config::{ModelOptions, SamplingPolicy};
use crate::error::ServiceError;
use crate::inference::runtime::{LoadedModel, ModelLoader, ModelRuntime, RuntimeOptions, TokenId};

/// Loads GGUF models with llama.cpp.
///
/// The backend is initialised on first use, on the worker thread.
#[derive(Default)]
pub struct LlamaLoader {
    backend: Option<Arc<LlamaBackend>>,
}

impl LlamaLoader {
    pub fn new() -> Self {
        Self::default()
    }

    fn backend(&mut self) -> Result<Arc<LlamaBackend>, ServiceError> {
        if let Some(backend) = &self.backend {
            return Ok(backend.clone());
        }

        let backend = Arc::new(
            LlamaBackend::init().map_err(|e| ServiceError::Worker(format!("backend init: {}", e)))?,
        );
        tracing::info!("LlamaBackend initialized in worker thread");
        self.backend = Some(backend.clone());
        Ok(backend)
    }
}

impl ModelLoader for LlamaLoader {
    fn load(&mut self, options: &ModelOptions) -> Result<Box<dyn LoadedModel>, ServiceError> {
        let backend = self.backend()?;

        for ignored in ignored_options(options) {
            tracing::warn!("llama.cpp cannot apply {}, ignoring it", ignored);
        }

        let mut params = LlamaModelParams::default().with_n_gpu_layers(options.n_gpu_layers);
        if options.use_mlock {
            params = params.with_use_mlock(true);
        }
        let model = LlamaModel::load_from_file(&backend, &options.path, &params).map_err(|e| {
            ServiceError::ModelLoadFailed {
                path: options.path.display().to_string(),
                reason: e.to_string(),
            }
        })?;

        tracing::info!(
            "Model loaded: {} ({} params, {} vocab, {} ctx)",
            options.path.display(),
            model.n_params(),
            model.n_vocab(),
            model.n_ctx_train()
        );

        Ok(Box::new(LlamaLoadedModel {
            backend,
            model,
            path: options.path.clone(),
        }))
    }
}

/// Load options the GGUF loader has no setter for, rendered as `name = value`.
///
/// GGUF files are single-part and memory-mapped by llama.cpp; the K/V cache
/// type keeps its default.
fn ignored_options(options: &ModelOptions) -> Vec<String> {
    let mut ignored = Vec::new();
    if options.n_parts > 1 {
        ignored.push(format!("n_parts = {}", options.n_parts));
    }
    if !options.use_mmap {
        ignored.push("use_mmap = false".to_string());
    }
    if !options.memory_f16 {
        ignored.push("memory_f16 = false".to_string());
    }
    ignored
}

/// Weights resident for the lifetime of a session
pub struct LlamaLoadedModel {
    backend: Arc<LlamaBackend>,
    model: LlamaModel,
    path: PathBuf,
}

fn tokenize_with(model: &LlamaModel, text: &str, add_bos: bool) -> Result<Vec<TokenId>, ServiceError> {
    let bos = if add_bos { AddBos::Always } else { AddBos::Never };
    let tokens = model
        .str_to_token(text, bos)
        .map_err(|e| ServiceError::Tokenization(e.to_string()))?;
    Ok(tokens.into_iter().map(|t| t.0).collect())
}

fn detokenize_with(model: &LlamaModel, token: TokenId) -> Vec<u8> {
    // control tokens such as end-of-text render as nothing
    match model.token_to_bytes(LlamaToken::new(token), Special::Plaintext) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::debug!("token {} has no text: {}", token, e);
            Vec::new()
        }
    }
}

impl LoadedModel for LlamaLoadedModel {
    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>, ServiceError> {
        tokenize_with(&self.model, text, add_bos)
    }

    fn detokenize(&self, token: TokenId) -> Vec<u8> {
        detokenize_with(&self.model, token)
    }

    fn describe(&self) -> String {
        format!(
            "{}: {} params, {} vocab, {} training ctx, {} bytes",
            self.path.display(),
            self.model.n_params(),
            self.model.n_vocab(),
            self.model.n_ctx_train(),
            self.model.size()
        )
    }

    fn new_runtime(
        &self,
        options: &RuntimeOptions,
    ) -> Result<Box<dyn ModelRuntime + '_>, ServiceError> {
        let n_ctx = NonZeroU32::new(options.n_ctx as u32)
            .ok_or_else(|| ServiceError::EvalFailed("context size must be positive".to_string()))?;
        let n_threads = options.n_threads.max(1) as i32;

        // one batch may hold a whole context after a swap
        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(Some(n_ctx))
            .with_n_batch(n_ctx.get())
            .with_n_threads(n_threads)
            .with_n_threads_batch(n_threads);

        let ctx = self
            .model
            .new_context(&self.backend, ctx_params)
            .map_err(|e| ServiceError::EvalFailed(format!("failed to create context: {}", e)))?;

        let seed = if options.seed < 0 {
            crate::rand_seed()
        } else {
            options.seed as u32
        };

        Ok(Box::new(LlamaRuntime {
            model: &self.model,
            ctx,
            n_ctx: options.n_ctx,
            last_batch_len: 0,
            seed,
            draws: 0,
        }))
    }
}

/// One llama.cpp context, created per query
pub struct LlamaRuntime<'m> {
    model: &'m LlamaModel,
    ctx: LlamaContext<'m>,
    n_ctx: usize,
    /// Size of the last decoded batch; its last position holds the logits
    last_batch_len: usize,
    seed: u32,
    draws: u32,
}

impl LlamaRuntime<'_> {
    fn sampler(&self, policy: &SamplingPolicy, history_len: usize) -> LlamaSampler {
        let n_vocab = self.model.n_vocab();
        let mut stages = vec![LlamaSampler::penalties(
            history_len as i32,
            policy.repeat_penalty,
            0.0,
            0.0,
        )];

        if policy.ignore_eos {
            stages.push(LlamaSampler::logit_bias(
                n_vocab,
                &[LlamaLogitBias::new(self.model.token_eos(), f32::NEG_INFINITY)],
            ));
        }

        if policy.temperature <= 0.0 {
            stages.push(LlamaSampler::greedy());
        } else {
            let top_k = if policy.top_k <= 0 { n_vocab } else { policy.top_k };
            stages.push(LlamaSampler::top_k(top_k));
            stages.push(LlamaSampler::top_p(policy.top_p, 1));
            stages.push(LlamaSampler::temp(policy.temperature));
            stages.push(LlamaSampler::dist(self.seed.wrapping_add(self.draws)));
        }

        LlamaSampler::chain_simple(stages)
    }
}

impl ModelRuntime for LlamaRuntime<'_> {
    fn context_size(&self) -> usize {
        self.n_ctx
    }

    fn eos_token(&self) -> TokenId {
        self.model.token_eos().0
    }

    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>, ServiceError> {
        tokenize_with(self.model, text, add_bos)
    }

    fn detokenize(&self, token: TokenId) -> Vec<u8> {
        detokenize_with(self.model, token)
    }

    fn evaluate(&mut self, tokens: &[TokenId], n_past: usize) -> Result<(), ServiceError> {
        if tokens.is_empty() {
            return Ok(());
        }

        // drop whatever a context swap discarded
        self.ctx
            .clear_kv_cache_seq(Some(0), Some(n_past as u32), None)
            .map_err(|e| ServiceError::EvalFailed(e.to_string()))?;

        let mut batch = LlamaBatch::new(tokens.len(), 1);
        let last = tokens.len() - 1;
        for (i, &token) in tokens.iter().enumerate() {
            batch
                .add(LlamaToken::new(token), (n_past + i) as i32, &[0], i == last)
                .map_err(|e| ServiceError::EvalFailed(format!("failed to add token to batch: {}", e)))?;
        }

        self.ctx
            .decode(&mut batch)
            .map_err(|e| ServiceError::EvalFailed(e.to_string()))?;

        self.last_batch_len = tokens.len();
        Ok(())
    }

    fn sample(
        &mut self,
        history: &[TokenId],
        policy: &SamplingPolicy,
    ) -> Result<TokenId, ServiceError> {
        if self.last_batch_len == 0 {
            return Err(ServiceError::EvalFailed("no logits available".to_string()));
        }

        let mut sampler = self.sampler(policy, history.len());
        sampler.accept_many(history.iter().map(|&t| LlamaToken::new(t)));

        let token = sampler.sample(&self.ctx, self.last_batch_len as i32 - 1);
        self.draws = self.draws.wrapping_add(1);
        Ok(token.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SetupRequest;

    #[test]
    fn test_default_options_apply_cleanly() {
        let options = SetupRequest::new("m.gguf").model_options(0);
        assert!(ignored_options(&options).is_empty());
    }

    #[test]
    fn test_unsupported_options_are_named() {
        let mut request = SetupRequest::new("m.gguf");
        request.n_parts = 2;
        request.use_mmap = false;
        request.memory_f16 = false;
        request.use_mlock = true;

        let ignored = ignored_options(&request.model_options(0));
        assert_eq!(
            ignored,
            vec!["n_parts = 2", "use_mmap = false", "memory_f16 = false"]
        );
    }
}
