//! Generation loop
//!
//! Runs one query against a configured session: feeds the query to the model,
//! samples new tokens and streams their text to a sink until the interaction
//! rules end the turn.

use tokio_util::sync::CancellationToken;

use crate::config::SessionConfig;
use crate::error::ServiceError;
use crate::generation::context::ContextState;
use crate::generation::input::InputQueue;
use crate::generation::interaction::{Flow, InteractionController};
use crate::inference::runtime::ModelRuntime;
use crate::inference::streaming::{StreamEvent, TokenSink, Utf8Assembler};

/// How a query ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOutcome {
    /// End-of-text sampled outside instruct mode
    EndOfText,
    /// Token budget used up with interaction off
    BudgetExhausted,
    /// Waiting for the next query after an end-of-interaction marker
    Paused,
    /// Stopped by the caller
    Cancelled,
}

/// One query's generation state, ready to run.
///
/// Creating it tokenizes and validates the query, so a rejected query fails
/// before any output is produced.
pub struct Generation<'c> {
    config: &'c SessionConfig,
    queue: InputQueue,
    ctx: ContextState,
    controller: InteractionController<'c>,
    text: Utf8Assembler,
}

impl<'c> Generation<'c> {
    pub fn start(
        config: &'c SessionConfig,
        runtime: &dyn ModelRuntime,
        query: &str,
    ) -> Result<Self, ServiceError> {
        let queue = InputQueue::for_query(config, runtime, query)?;
        let ctx = ContextState::new(runtime.context_size(), config.n_keep);

        tracing::debug!(
            "query: {} input tokens, n_ctx = {}, n_keep = {}",
            queue.len(),
            ctx.capacity(),
            config.n_keep
        );

        Ok(Self {
            config,
            queue,
            ctx,
            controller: InteractionController::new(config),
            text: Utf8Assembler::new(),
        })
    }

    /// Runs the loop until the interaction rules, the budget or `cancel`
    /// end it.
    pub fn run(
        mut self,
        runtime: &mut (dyn ModelRuntime + '_),
        sink: &mut dyn TokenSink,
        cancel: &CancellationToken,
    ) -> Result<QueryOutcome, ServiceError> {
        let config = self.config;

        while self.controller.should_continue() {
            if cancel.is_cancelled() {
                tracing::debug!("query cancelled at n_past = {}", self.ctx.n_past());
                self.flush(sink)?;
                return Ok(QueryOutcome::Cancelled);
            }

            self.ctx.prepare_for_eval(runtime)?;
            self.ctx.commit();

            let sampled = self.controller.should_sample(&self.queue);
            if sampled {
                let history = self.ctx.history_mut().window(config.repeat_last_n);
                let token = runtime.sample(history, &config.sampling)?;
                let token = self.controller.on_sampled(token, &mut self.queue, &*runtime)?;
                self.ctx.push_pending(token);
            } else {
                self.queue.drain_into(&mut self.ctx, config.n_batch);
                self.controller.on_drained(&self.queue);
            }

            if (sampled || config.flags.echo_input) && !self.controller.echo_suppressed() {
                for &token in self.ctx.pending() {
                    if let Some(fragment) = self.text.push(&runtime.detokenize(token)) {
                        sink.emit(StreamEvent::Token(fragment))?;
                    }
                }
            }

            let step = self.controller.after_step(
                self.ctx.pending().last().copied(),
                self.ctx.n_past(),
                &self.queue,
                self.ctx.history(),
                &*runtime,
            );

            if let Some(marker) = step.marker {
                self.flush(sink)?;
                sink.emit(marker)?;
            }

            match step.flow {
                Flow::Continue => {}
                Flow::Pause => return Ok(QueryOutcome::Paused),
                Flow::Stop => return Ok(QueryOutcome::EndOfText),
            }
        }

        self.flush(sink)?;
        Ok(QueryOutcome::BudgetExhausted)
    }

    fn flush(&mut self, sink: &mut dyn TokenSink) -> Result<(), ServiceError> {
        match self.text.flush() {
            Some(fragment) => sink.emit(StreamEvent::Token(fragment)),
            None => Ok(()),
        }
    }
}

/// Generates the answer to `query`, pushing output into `sink`.
///
/// The runtime is expected to be fresh for this query.
pub fn generate(
    config: &SessionConfig,
    runtime: &mut (dyn ModelRuntime + '_),
    query: &str,
    sink: &mut dyn TokenSink,
    cancel: &CancellationToken,
) -> Result<QueryOutcome, ServiceError> {
    Generation::start(config, &*runtime, query)?.run(runtime, sink, cancel)
}
