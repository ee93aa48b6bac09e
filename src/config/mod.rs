//! Session configuration
//!
//! A [`SetupRequest`] arrives once per setup call and is resolved against the
//! loaded model into an immutable [`SessionConfig`] shared by every query.

pub mod settings;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ServiceError;
use crate::inference::runtime::{LoadedModel, TokenId};

/// Tokens reserved at the end of the context for control tokens
pub const CONTEXT_MARGIN: usize = 4;

/// Injected before every user turn in instruct mode
pub const INSTRUCT_PREFIX: &str = "\n\n### Instruction:\n\n";
/// Injected after every user turn in instruct mode
pub const INSTRUCT_SUFFIX: &str = "\n\n### Response:\n\n";
/// Reverse prompt appended in instruct mode
pub const INSTRUCT_ANTIPROMPT: &str = "### Instruction:\n\n";

const RANDOM_PROMPTS: [&str; 10] = [
    "So",
    "Once upon a time",
    "When",
    "The",
    "After",
    "If",
    "import",
    "He",
    "She",
    "They",
];

fn default_n_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().min(4))
        .unwrap_or(4)
}
fn default_n_predict() -> i32 {
    128
}
fn default_repeat_last_n() -> i32 {
    64
}
fn default_n_batch() -> i32 {
    8
}
fn default_top_k() -> i32 {
    40
}
fn default_top_p() -> f32 {
    0.95
}
fn default_temp() -> f32 {
    0.8
}
fn default_repeat_penalty() -> f32 {
    1.1
}
fn default_n_ctx() -> i32 {
    512
}
fn default_n_parts() -> i32 {
    -1
}
fn default_seed() -> i64 {
    -1
}
fn default_true() -> bool {
    true
}

/// Setup call body. Field names follow the wire format of the setup RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupRequest {
    #[serde(default = "default_n_threads")]
    pub n_threads: usize,
    /// New tokens per turn, -1 = unbounded
    #[serde(default = "default_n_predict")]
    pub n_predict: i32,
    #[serde(default = "default_repeat_last_n")]
    pub repeat_last_n: i32,
    #[serde(default = "default_n_batch")]
    pub n_batch: i32,
    /// Tokens of the prompt kept across context swaps. Unset or negative keeps the whole prompt.
    #[serde(default)]
    pub n_keep: Option<i32>,

    #[serde(default = "default_top_k")]
    pub top_k: i32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_temp")]
    pub temp: f32,
    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f32,

    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub input_prefix: String,
    #[serde(default)]
    pub antiprompt: Vec<String>,

    #[serde(default)]
    pub random_prompt: bool,
    #[serde(default)]
    pub interactive: bool,
    #[serde(default)]
    pub interactive_start: bool,
    #[serde(default)]
    pub instruct: bool,
    #[serde(default)]
    pub ignore_eos: bool,
    #[serde(default)]
    pub verbose_prompt: bool,
    /// Echo consumed input tokens back into the output stream
    #[serde(default = "default_true")]
    pub echo_input: bool,

    #[serde(default = "default_n_ctx")]
    pub n_ctx: i32,
    #[serde(default = "default_n_parts")]
    pub n_parts: i32,
    #[serde(default = "default_seed")]
    pub seed: i64,
    #[serde(default = "default_true")]
    pub memory_f16: bool,
    #[serde(default = "default_true")]
    pub use_mmap: bool,
    #[serde(default)]
    pub use_mlock: bool,
    /// Layers offloaded to the GPU; falls back to the server default
    #[serde(default)]
    pub n_gpu_layers: Option<u32>,
}

impl Default for SetupRequest {
    fn default() -> Self {
        Self {
            n_threads: default_n_threads(),
            n_predict: default_n_predict(),
            repeat_last_n: default_repeat_last_n(),
            n_batch: default_n_batch(),
            n_keep: None,
            top_k: default_top_k(),
            top_p: default_top_p(),
            temp: default_temp(),
            repeat_penalty: default_repeat_penalty(),
            model: String::new(),
            prompt: String::new(),
            input_prefix: String::new(),
            antiprompt: Vec::new(),
            random_prompt: false,
            interactive: false,
            interactive_start: false,
            instruct: false,
            ignore_eos: false,
            verbose_prompt: false,
            echo_input: true,
            n_ctx: default_n_ctx(),
            n_parts: default_n_parts(),
            seed: default_seed(),
            memory_f16: true,
            use_mmap: true,
            use_mlock: false,
            n_gpu_layers: None,
        }
    }
}

impl SetupRequest {
    /// A request with every field at its default and the given model path
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Self::default()
        }
    }

    /// Model-load options carried by this request
    pub fn model_options(&self, default_gpu_layers: u32) -> ModelOptions {
        ModelOptions {
            path: PathBuf::from(&self.model),
            n_gpu_layers: self.n_gpu_layers.unwrap_or(default_gpu_layers),
            n_parts: self.n_parts,
            memory_f16: self.memory_f16,
            use_mmap: self.use_mmap,
            use_mlock: self.use_mlock,
        }
    }
}

/// Options applied when loading model weights
#[derive(Debug, Clone, PartialEq)]
pub struct ModelOptions {
    pub path: PathBuf,
    pub n_gpu_layers: u32,
    pub n_parts: i32,
    pub memory_f16: bool,
    pub use_mmap: bool,
    pub use_mlock: bool,
}

/// Sampling policy handed to the runtime for every sampled token
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingPolicy {
    pub top_k: i32,
    pub top_p: f32,
    pub temperature: f32,
    pub repeat_penalty: f32,
    /// Never sample the end-of-text token
    pub ignore_eos: bool,
}

/// Mode switches resolved at setup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModeFlags {
    pub random_prompt: bool,
    pub interactive: bool,
    pub interactive_start: bool,
    pub instruct: bool,
    pub verbose_prompt: bool,
    pub echo_input: bool,
}

/// Validated, read-only generation parameters for one session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub n_threads: usize,
    pub n_predict: i32,
    pub repeat_last_n: usize,
    pub n_batch: usize,
    pub n_keep: usize,
    pub n_ctx: usize,
    pub seed: i64,
    pub sampling: SamplingPolicy,
    pub model: ModelOptions,
    pub prompt: String,
    pub input_prefix: String,
    pub antiprompts: Vec<String>,
    pub flags: ModeFlags,

    /// Tokenized prompt, BOS included
    pub prompt_tokens: Vec<TokenId>,
    pub newline_token: TokenId,
    pub instruct_prefix: Vec<TokenId>,
    pub instruct_suffix: Vec<TokenId>,
}

impl SessionConfig {
    /// Resolves a setup request against a loaded model.
    pub fn resolve(
        request: SetupRequest,
        model: &dyn LoadedModel,
        default_gpu_layers: u32,
    ) -> Result<Self, ServiceError> {
        let model_options = request.model_options(default_gpu_layers);
        let n_ctx = request.n_ctx.max(1) as usize;

        let mut prompt = request.prompt;
        if request.random_prompt && prompt.is_empty() {
            prompt = random_prompt().to_string();
            tracing::info!("Using random prompt: '{}'", prompt);
        }
        prompt.insert(0, ' ');

        let prompt_tokens = model.tokenize(&prompt, true)?;
        check_prompt_len(prompt_tokens.len(), n_ctx)?;

        let n_keep = resolve_n_keep(request.n_keep, prompt_tokens.len(), request.instruct);

        let instruct_prefix = model.tokenize(INSTRUCT_PREFIX, true)?;
        let instruct_suffix = model.tokenize(INSTRUCT_SUFFIX, false)?;

        let mut antiprompts: Vec<String> = request
            .antiprompt
            .into_iter()
            .filter(|a| !a.is_empty())
            .collect();

        let mut flags = ModeFlags {
            random_prompt: request.random_prompt,
            interactive: request.interactive,
            interactive_start: request.interactive_start,
            instruct: request.instruct,
            verbose_prompt: request.verbose_prompt,
            echo_input: request.echo_input,
        };

        if flags.instruct {
            flags.interactive_start = true;
            antiprompts.push(INSTRUCT_ANTIPROMPT.to_string());
        }

        if !antiprompts.is_empty() || flags.interactive_start {
            flags.interactive = true;
        }

        let newline_token = model
            .tokenize("\n", false)?
            .first()
            .copied()
            .ok_or_else(|| ServiceError::Tokenization("no token for newline".to_string()))?;

        Ok(Self {
            n_threads: request.n_threads.max(1),
            n_predict: request.n_predict,
            repeat_last_n: request.repeat_last_n.clamp(0, n_ctx as i32) as usize,
            n_batch: request.n_batch.clamp(1, n_ctx as i32) as usize,
            n_keep,
            n_ctx,
            seed: request.seed,
            sampling: SamplingPolicy {
                top_k: request.top_k,
                top_p: request.top_p,
                temperature: request.temp,
                repeat_penalty: request.repeat_penalty,
                ignore_eos: request.ignore_eos,
            },
            model: model_options,
            prompt,
            input_prefix: request.input_prefix,
            antiprompts,
            flags,
            prompt_tokens,
            newline_token,
            instruct_prefix,
            instruct_suffix,
        })
    }

    /// Writes the one-time setup summary to the log
    pub fn log_summary(&self, model: &dyn LoadedModel) {
        tracing::info!(
            "system_info: n_threads = {} | {}",
            self.n_threads,
            model.describe()
        );

        if self.flags.verbose_prompt {
            tracing::info!("prompt: '{}'", self.prompt);
            tracing::info!("number of tokens in prompt = {}", self.prompt_tokens.len());
            for &token in &self.prompt_tokens {
                tracing::info!(
                    "{:6} -> '{}'",
                    token,
                    String::from_utf8_lossy(&model.detokenize(token))
                );
            }
            if self.n_keep > 0 {
                let kept: Vec<u8> = self.prompt_tokens[..self.n_keep]
                    .iter()
                    .flat_map(|&t| model.detokenize(t))
                    .collect();
                tracing::info!(
                    "static prompt based on n_keep: '{}'",
                    String::from_utf8_lossy(&kept)
                );
            }
        }

        if self.flags.interactive {
            tracing::info!("interactive mode on.");
            for antiprompt in &self.antiprompts {
                tracing::info!("Reverse prompt: '{}'", antiprompt);
            }
            if !self.input_prefix.is_empty() {
                tracing::info!("Input prefix: '{}'", self.input_prefix);
            }
        }

        tracing::info!(
            "sampling: temp = {}, top_k = {}, top_p = {}, repeat_last_n = {}, repeat_penalty = {}",
            self.sampling.temperature,
            self.sampling.top_k,
            self.sampling.top_p,
            self.repeat_last_n,
            self.sampling.repeat_penalty
        );
        tracing::info!(
            "generate: n_ctx = {}, n_batch = {}, n_predict = {}, n_keep = {}",
            self.n_ctx,
            self.n_batch,
            self.n_predict,
            self.n_keep
        );
    }
}

/// Rejects inputs that do not leave room for the control-token margin
pub fn check_prompt_len(tokens: usize, n_ctx: usize) -> Result<(), ServiceError> {
    let max = n_ctx.saturating_sub(CONTEXT_MARGIN);
    if tokens > max {
        tracing::error!("prompt is too long ({} tokens, max {})", tokens, max);
        return Err(ServiceError::PromptTooLong { tokens, max });
    }
    Ok(())
}

/// Number of prompt tokens kept when the context is swapped
pub fn resolve_n_keep(requested: Option<i32>, prompt_len: usize, instruct: bool) -> usize {
    match requested {
        Some(n) if n >= 0 && (n as usize) <= prompt_len && !instruct => n as usize,
        _ => prompt_len,
    }
}

fn random_prompt() -> &'static str {
    RANDOM_PROMPTS[crate::rand_seed() as usize % RANDOM_PROMPTS.len()]
}
