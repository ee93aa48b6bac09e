//! Application state shared across handlers.

use std::sync::Arc;

use crate::inference::GptEngine;

#[derive(Clone)]
pub struct AppState {
    /// Worker owning the model and the configured session
    pub engine: Arc<GptEngine>,
}

impl AppState {
    pub fn new(engine: GptEngine) -> Self {
        Self {
            engine: Arc::new(engine),
        }
    }
}
