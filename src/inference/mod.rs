//! Model inference
//!
//! The runtime facade the generation core is written against, its llama.cpp
//! and scripted implementations, the engine worker that owns the model, and
//! the stream types carrying output back to callers.

pub mod engine;
#[cfg(feature = "llama")]
pub mod llama;
pub mod mock;
pub mod model;
pub mod runtime;
pub mod streaming;

// Re-export main types for convenience
pub use engine::{GptEngine, QueryStream, SetupSummary};
#[cfg(feature = "llama")]
pub use llama::LlamaLoader;
pub use model::{preflight, read_gguf_header, GgufHeader, ModelError, GGUF_MAGIC};
pub use runtime::{LoadedModel, ModelLoader, ModelRuntime, RuntimeOptions, TokenId};
pub use streaming::{StreamEvent, TokenSink};
