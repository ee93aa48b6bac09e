//! gpt-service - streaming text generation over HTTP
//!
//! Loads a local GGUF model on demand and streams generated tokens to callers.

use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gpt_service::config::settings::load_settings;
use gpt_service::inference::{GptEngine, ModelLoader};
use gpt_service::server::{run_server, AppState};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("gpt_service=info".parse()?))
        .init();

    info!("Starting gpt-service v{}", env!("CARGO_PKG_VERSION"));

    let settings = load_settings();
    info!(
        "Models directory: {}, default GPU layers: {}",
        settings.models_directory.display(),
        settings.gpu_layers
    );

    let engine = GptEngine::spawn(model_loader(), &settings)?;
    let state = AppState::new(engine);

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run_server(state, settings.socket_addr()))
}

#[cfg(feature = "llama")]
fn model_loader() -> Box<dyn ModelLoader> {
    Box::new(gpt_service::inference::LlamaLoader::new())
}

/// Without llama.cpp the service runs on the scripted byte-level model.
#[cfg(not(feature = "llama"))]
fn model_loader() -> Box<dyn ModelLoader> {
    tracing::warn!("Built without the `llama` feature, serving the scripted mock model");
    Box::new(gpt_service::inference::mock::MockLoader::new(
        gpt_service::inference::mock::MockModel::new().with_filler(b' '),
    ))
}
