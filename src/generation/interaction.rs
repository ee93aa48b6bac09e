//! Interaction control
//!
//! Decides per step whether to sample or consume input, rewrites end-of-text
//! in interactive sessions, detects reverse prompts, and hands control back to
//! the caller.

use crate::config::SessionConfig;
use crate::error::ServiceError;
use crate::generation::context::HistoryRing;
use crate::generation::input::InputQueue;
use crate::inference::runtime::{ModelRuntime, TokenId};
use crate::inference::streaming::StreamEvent;

/// Where the session stands between steps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Queued input remains to be consumed
    Idle,
    /// Input consumed; the next step samples
    AwaitingSample,
    /// Control belongs to the user
    Interacting,
    /// Control belongs to the user because a reverse prompt was generated
    Antiprompt,
    /// The query is over
    Terminated,
}

/// What the loop does after a step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Return to the caller and wait for the next query
    Pause,
    /// Generation concluded
    Stop,
}

/// Result of the post-step checks
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub marker: Option<StreamEvent>,
    pub flow: Flow,
}

impl Step {
    fn proceed() -> Self {
        Self {
            marker: None,
            flow: Flow::Continue,
        }
    }
}

/// State machine for one query.
#[derive(Debug)]
pub struct InteractionController<'c> {
    config: &'c SessionConfig,
    phase: Phase,
    remaining: i64,
    echo_suppressed: bool,
    /// The session opens on the user's turn and the query has not been consumed yet
    opening_turn: bool,
}

impl<'c> InteractionController<'c> {
    pub fn new(config: &'c SessionConfig) -> Self {
        let opening_turn = config.flags.interactive && config.flags.interactive_start;
        let phase = if opening_turn {
            Phase::Interacting
        } else {
            Phase::Idle
        };

        Self {
            config,
            phase,
            remaining: config.n_predict as i64,
            echo_suppressed: false,
            opening_turn,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn remaining(&self) -> i64 {
        self.remaining
    }

    pub fn is_interacting(&self) -> bool {
        matches!(self.phase, Phase::Interacting | Phase::Antiprompt)
    }

    pub fn echo_suppressed(&self) -> bool {
        self.echo_suppressed
    }

    /// Loop guard: budget left, or an interactive session
    pub fn should_continue(&self) -> bool {
        self.phase != Phase::Terminated && (self.remaining != 0 || self.config.flags.interactive)
    }

    /// Sample only once all queued input is consumed and the user does not
    /// hold control; otherwise forward queued input.
    pub fn should_sample(&self, queue: &InputQueue) -> bool {
        queue.is_drained() && !self.is_interacting()
    }

    /// Bookkeeping after input was forwarded.
    ///
    /// A query is the user's turn, so consuming it hands control to the model
    /// even when the session opens interacting.
    pub fn on_drained(&mut self, queue: &InputQueue) {
        if self.opening_turn && queue.is_drained() {
            self.opening_turn = false;
            self.phase = Phase::AwaitingSample;
        } else if !self.is_interacting() {
            self.phase = if queue.is_drained() {
                Phase::AwaitingSample
            } else {
                Phase::Idle
            };
        }
    }

    /// Bookkeeping for a freshly sampled token; returns the token to record.
    ///
    /// In an interactive, non-instruct session end-of-text becomes a newline
    /// and the first reverse prompt is queued, so the user gets the turn.
    pub fn on_sampled(
        &mut self,
        token: TokenId,
        queue: &mut InputQueue,
        runtime: &dyn ModelRuntime,
    ) -> Result<TokenId, ServiceError> {
        let mut token = token;
        let flags = self.config.flags;

        if token == runtime.eos_token() && flags.interactive && !flags.instruct {
            token = self.config.newline_token;
            if let Some(first) = self.config.antiprompts.first() {
                queue.extend(&runtime.tokenize(first, false)?);
            }
        }

        self.echo_suppressed = false;
        self.remaining -= 1;
        self.phase = if queue.is_drained() {
            Phase::AwaitingSample
        } else {
            Phase::Idle
        };
        Ok(token)
    }

    /// Post-step checks: reverse prompts, the interactive pause, end of text
    /// and budget rollover.
    pub fn after_step(
        &mut self,
        last_token: Option<TokenId>,
        n_past: usize,
        queue: &InputQueue,
        history: &HistoryRing,
        runtime: &dyn ModelRuntime,
    ) -> Step {
        let flags = self.config.flags;

        if flags.interactive && queue.is_drained() {
            if !self.config.antiprompts.is_empty() {
                if let Some(antiprompt) =
                    find_antiprompt(history, &self.config.antiprompts, runtime)
                {
                    tracing::debug!("reverse prompt '{}' detected", antiprompt.escape_debug());
                    self.phase = Phase::Antiprompt;
                }
            }

            if n_past > 0 && self.is_interacting() {
                if !self.config.input_prefix.is_empty() {
                    self.phase = Phase::Terminated;
                    return Step {
                        marker: Some(StreamEvent::EndOfInteraction),
                        flow: Flow::Pause,
                    };
                }
                // control returns without a prefix: hide the next step's echo
                self.echo_suppressed = true;
                self.phase = Phase::AwaitingSample;
            }
        }

        let mut step = Step::proceed();

        if last_token == Some(runtime.eos_token()) {
            if flags.instruct {
                step.marker = Some(StreamEvent::InstructEndOfText);
                self.phase = Phase::Interacting;
            } else {
                self.phase = Phase::Terminated;
                return Step {
                    marker: Some(StreamEvent::EndOfText),
                    flow: Flow::Stop,
                };
            }
        }

        if flags.interactive && self.remaining <= 0 && self.config.n_predict != -1 {
            self.remaining = self.config.n_predict as i64;
            self.phase = Phase::Interacting;
        }

        step
    }
}

/// First reverse prompt the detokenized history ends with.
///
/// Only the tail of the window that the longest reverse prompt can reach is
/// detokenized; the result is the same as matching against the whole window.
pub fn find_antiprompt<'a>(
    history: &HistoryRing,
    antiprompts: &'a [String],
    runtime: &dyn ModelRuntime,
) -> Option<&'a str> {
    let longest = antiprompts.iter().map(String::len).max()?;

    let mut pieces = Vec::new();
    let mut tail_len = 0;
    for &token in history.iter().rev() {
        if tail_len >= longest {
            break;
        }
        let piece = runtime.detokenize(token);
        tail_len += piece.len();
        pieces.push(piece);
    }

    let tail: Vec<u8> = pieces.into_iter().rev().flatten().collect();
    antiprompts
        .iter()
        .find(|a| tail.ends_with(a.as_bytes()))
        .map(String::as_str)
}
