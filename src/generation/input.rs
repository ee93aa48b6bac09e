//! Queued user input
//!
//! Tokens of the query (and anything injected later) wait here until the
//! generation loop forwards them to the context in batches.

use crate::config::{check_prompt_len, SessionConfig};
use crate::error::ServiceError;
use crate::generation::context::ContextState;
use crate::inference::runtime::{ModelRuntime, TokenId};

/// Input tokens plus a cursor over the ones already consumed.
#[derive(Debug, Default, Clone)]
pub struct InputQueue {
    tokens: Vec<TokenId>,
    consumed: usize,
}

impl InputQueue {
    pub fn new(tokens: Vec<TokenId>) -> Self {
        Self {
            tokens,
            consumed: 0,
        }
    }

    /// Tokenizes a query the way the session is configured.
    ///
    /// In instruct mode the query is wrapped in the instruction prefix and
    /// response suffix.
    pub fn for_query(
        config: &SessionConfig,
        runtime: &dyn ModelRuntime,
        query: &str,
    ) -> Result<Self, ServiceError> {
        let text = format!(" {}", query);

        let tokens = if config.flags.instruct {
            let body = runtime.tokenize(&text, false)?;
            let mut tokens = Vec::with_capacity(
                config.instruct_prefix.len() + body.len() + config.instruct_suffix.len(),
            );
            tokens.extend_from_slice(&config.instruct_prefix);
            tokens.extend(body);
            tokens.extend_from_slice(&config.instruct_suffix);
            tokens
        } else {
            runtime.tokenize(&text, true)?
        };

        check_prompt_len(tokens.len(), runtime.context_size())?;
        Ok(Self::new(tokens))
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// True once every queued token has been forwarded
    pub fn is_drained(&self) -> bool {
        self.consumed >= self.tokens.len()
    }

    /// Appends tokens behind the unconsumed ones
    pub fn extend(&mut self, tokens: &[TokenId]) {
        self.tokens.extend_from_slice(tokens);
    }

    /// Forwards unconsumed tokens into the context until `n_batch` tokens
    /// are pending. Returns how many were moved.
    pub fn drain_into(&mut self, ctx: &mut ContextState, n_batch: usize) -> usize {
        let start = self.consumed;
        while let Some(&token) = self.tokens.get(self.consumed) {
            ctx.push_pending(token);
            self.consumed += 1;
            if ctx.pending().len() >= n_batch {
                break;
            }
        }
        self.consumed - start
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SetupRequest;
    use crate::inference::mock::{byte_token, MockModel, BOS_TOKEN};
    use crate::inference::runtime::{LoadedModel, RuntimeOptions};

    fn runtime_for(model: &MockModel, n_ctx: usize) -> Box<dyn ModelRuntime + '_> {
        model
            .new_runtime(&RuntimeOptions { n_ctx, n_threads: 1, seed: 0 })
            .unwrap()
    }

    #[test]
    fn test_drain_respects_batch() {
        let mut queue = InputQueue::new((10..15).collect());
        let mut ctx = ContextState::new(32, 0);

        assert_eq!(queue.drain_into(&mut ctx, 2), 2);
        assert_eq!(ctx.pending(), &[10, 11]);
        assert!(!queue.is_drained());

        ctx.commit();
        assert_eq!(queue.drain_into(&mut ctx, 8), 3);
        assert_eq!(ctx.pending(), &[12, 13, 14]);
        assert!(queue.is_drained());
        assert_eq!(queue.drain_into(&mut ctx, 8), 0);
    }

    #[test]
    fn test_extend_after_drain() {
        let mut queue = InputQueue::new(vec![1]);
        let mut ctx = ContextState::new(8, 0);
        queue.drain_into(&mut ctx, 8);
        assert!(queue.is_drained());

        queue.extend(&[7, 8]);
        assert!(!queue.is_drained());
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.consumed(), 1);
    }

    #[test]
    fn test_plain_query_gets_bos_and_space() {
        let model = MockModel::new();
        let config = SessionConfig::resolve(SetupRequest::new("m"), &model, 0).unwrap();
        let runtime = runtime_for(&model, config.n_ctx);

        let queue = InputQueue::for_query(&config, runtime.as_ref(), "hi").unwrap();
        assert_eq!(
            queue.tokens,
            vec![BOS_TOKEN, byte_token(b' '), byte_token(b'h'), byte_token(b'i')]
        );
    }

    #[test]
    fn test_instruct_query_is_wrapped() {
        let model = MockModel::new();
        let mut request = SetupRequest::new("m");
        request.instruct = true;
        let config = SessionConfig::resolve(request, &model, 0).unwrap();
        let runtime = runtime_for(&model, config.n_ctx);

        let queue = InputQueue::for_query(&config, runtime.as_ref(), "hi").unwrap();
        let prefix = config.instruct_prefix.len();
        let suffix = config.instruct_suffix.len();
        assert_eq!(queue.len(), prefix + 3 + suffix);
        assert_eq!(queue.tokens[..prefix], config.instruct_prefix[..]);
        assert_eq!(queue.tokens[queue.len() - suffix..], config.instruct_suffix[..]);
    }

    #[test]
    fn test_oversized_query_rejected() {
        let model = MockModel::new();
        let config = SessionConfig::resolve(SetupRequest::new("m"), &model, 0).unwrap();
        let runtime = runtime_for(&model, 10);

        let err = InputQueue::for_query(&config, runtime.as_ref(), "too long").unwrap_err();
        assert_eq!(err, ServiceError::PromptTooLong { tokens: 10, max: 6 });
    }
}
