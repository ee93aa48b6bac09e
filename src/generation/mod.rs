//! Generation orchestration: context window, queued input, interaction rules
//! and the loop tying them together.

pub mod context;
pub mod input;
pub mod interaction;
pub mod session;

pub use context::{ContextState, HistoryRing};
pub use input::InputQueue;
pub use interaction::{Flow, InteractionController, Phase, Step};
pub use session::{generate, Generation, QueryOutcome};
