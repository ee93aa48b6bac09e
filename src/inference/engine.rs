//! Generation engine
//!
//! Owns the model on a dedicated worker thread and serialises setup and query
//! commands onto it.
//!
//! # Architecture
//!
//! llama-cpp-2 types (`LlamaBackend`, `LlamaModel`, `LlamaContext`) contain raw
//! pointers that are not `Send`, so the loaded model never leaves the worker
//! thread. Async callers talk to it through a command channel and get replies
//! on oneshot channels; query output comes back through a bounded event
//! channel that the worker fills with `blocking_send`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tokio::sync::{mpsc as async_mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::{CancellationToken, DropGuard};
use uuid::Uuid;

use crate::config::settings::ServerSettings;
use crate::config::{SessionConfig, SetupRequest};
use crate::error::ServiceError;
use crate::generation::{Generation, QueryOutcome};
use crate::inference::model::preflight;
use crate::inference::runtime::{LoadedModel, ModelLoader, RuntimeOptions};
use crate::inference::streaming::{ChannelSink, StreamEvent};
use crate::truncate_str;

/// Acknowledgment returned by a successful setup
#[derive(Debug, Clone, PartialEq)]
pub struct SetupSummary {
    pub instance_id: String,
    /// Model summary as reported by the runtime
    pub model: String,
    pub prompt_tokens: usize,
    pub n_keep: usize,
    pub interactive: bool,
}

/// Commands sent to the worker thread
enum WorkerCommand {
    Setup {
        request: SetupRequest,
        reply: oneshot::Sender<Result<SetupSummary, ServiceError>>,
        permit: OwnedSemaphorePermit,
    },
    Query {
        id: Uuid,
        prompt: String,
        sink: ChannelSink,
        cancel: CancellationToken,
        accepted: oneshot::Sender<Result<(), ServiceError>>,
        permit: OwnedSemaphorePermit,
    },
    Shutdown,
}

/// Output of an accepted query.
///
/// Dropping it cancels generation.
pub struct QueryStream {
    pub id: Uuid,
    pub events: async_mpsc::Receiver<StreamEvent>,
    _cancel: DropGuard,
}

impl QueryStream {
    /// Next event, or `None` once the worker finished the query
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }
}

/// Handle to the generation worker.
///
/// Holds one in-flight permit: a query arriving while another runs is
/// rejected with [`ServiceError::Busy`], while setup waits its turn.
pub struct GptEngine {
    command_tx: Option<Sender<WorkerCommand>>,
    worker_handle: Option<JoinHandle<()>>,
    in_flight: Arc<Semaphore>,
    configured: Arc<AtomicBool>,
    channel_capacity: usize,
}

impl GptEngine {
    /// Starts the worker thread that owns `loader` and every model it loads.
    pub fn spawn(
        loader: Box<dyn ModelLoader>,
        settings: &ServerSettings,
    ) -> Result<Self, ServiceError> {
        let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>();
        let configured = Arc::new(AtomicBool::new(false));

        let worker_settings = settings.clone();
        let worker_configured = configured.clone();

        // the session holds non-Send model handles, so the worker is built
        // on its own thread
        let handle = thread::Builder::new()
            .name("gpt-worker".to_string())
            .spawn(move || {
                Worker {
                    loader,
                    session: None,
                    settings: worker_settings,
                    configured: worker_configured,
                }
                .run(command_rx)
            })
            .map_err(|e| ServiceError::Worker(e.to_string()))?;

        tracing::info!("Generation worker thread started");

        Ok(Self {
            command_tx: Some(command_tx),
            worker_handle: Some(handle),
            in_flight: Arc::new(Semaphore::new(1)),
            configured,
            channel_capacity: settings.channel_capacity.max(1),
        })
    }

    /// Returns true once a setup has succeeded and not been replaced by a
    /// failed one
    pub fn is_configured(&self) -> bool {
        self.configured.load(Ordering::Acquire)
    }

    /// Loads the model and resolves the session configuration.
    ///
    /// Waits for an in-flight query to finish first. A failed setup leaves
    /// the engine unconfigured.
    pub async fn setup(&self, request: SetupRequest) -> Result<SetupSummary, ServiceError> {
        let permit = self
            .in_flight
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| ServiceError::Worker(e.to_string()))?;

        let (reply, response) = oneshot::channel();
        self.send(WorkerCommand::Setup {
            request,
            reply,
            permit,
        })?;

        response
            .await
            .map_err(|_| ServiceError::Worker("worker dropped the setup reply".to_string()))?
    }

    /// Starts a query and returns its event stream.
    ///
    /// Fails without output when another query is running, no session is
    /// configured, or the query does not fit the context.
    pub async fn query(&self, prompt: impl Into<String>) -> Result<QueryStream, ServiceError> {
        let permit = self
            .in_flight
            .clone()
            .try_acquire_owned()
            .map_err(|_| ServiceError::Busy)?;

        if !self.is_configured() {
            return Err(ServiceError::NotConfigured);
        }

        let id = Uuid::new_v4();
        let (events_tx, events) = async_mpsc::channel(self.channel_capacity);
        let cancel = CancellationToken::new();
        let (accepted, acceptance) = oneshot::channel();

        self.send(WorkerCommand::Query {
            id,
            prompt: prompt.into(),
            sink: ChannelSink::new(events_tx),
            cancel: cancel.clone(),
            accepted,
            permit,
        })?;

        acceptance
            .await
            .map_err(|_| ServiceError::Worker("worker dropped the query".to_string()))??;

        Ok(QueryStream {
            id,
            events,
            _cancel: cancel.drop_guard(),
        })
    }

    fn send(&self, command: WorkerCommand) -> Result<(), ServiceError> {
        self.command_tx
            .as_ref()
            .ok_or_else(|| ServiceError::Worker("worker not running".to_string()))?
            .send(command)
            .map_err(|e| ServiceError::Worker(e.to_string()))
    }
}

impl Drop for GptEngine {
    fn drop(&mut self) {
        if let Some(tx) = self.command_tx.take() {
            let _ = tx.send(WorkerCommand::Shutdown);
        }
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}

/// A configured session: the model plus the resolved configuration
struct Session {
    model: Box<dyn LoadedModel>,
    config: SessionConfig,
}

/// State owned by the worker thread
struct Worker {
    loader: Box<dyn ModelLoader>,
    session: Option<Session>,
    settings: ServerSettings,
    configured: Arc<AtomicBool>,
}

impl Worker {
    fn run(mut self, command_rx: Receiver<WorkerCommand>) {
        loop {
            match command_rx.recv() {
                Ok(WorkerCommand::Setup {
                    request,
                    reply,
                    permit,
                }) => {
                    let result = self.setup(request);
                    self.configured
                        .store(self.session.is_some(), Ordering::Release);
                    // released before the caller sees the reply
                    drop(permit);
                    let _ = reply.send(result);
                }
                Ok(WorkerCommand::Query {
                    id,
                    prompt,
                    sink,
                    cancel,
                    accepted,
                    permit,
                }) => {
                    self.query(id, &prompt, sink, &cancel, accepted, permit);
                }
                Ok(WorkerCommand::Shutdown) => {
                    tracing::info!("Worker thread shutting down");
                    break;
                }
                Err(_) => {
                    tracing::debug!("Command channel closed, worker exiting");
                    break;
                }
            }
        }
    }

    fn setup(&mut self, mut request: SetupRequest) -> Result<SetupSummary, ServiceError> {
        // the previous model is released before the next one is loaded
        self.session = None;

        let path = self.settings.resolve_model_path(&request.model);
        let path_str = path.to_string_lossy().to_string();
        preflight(&path).map_err(|e| ServiceError::from_model_error(&path_str, e))?;
        request.model = path_str;

        let options = request.model_options(self.settings.gpu_layers);
        tracing::info!(
            "Loading model {} ({} GPU layers)",
            options.path.display(),
            options.n_gpu_layers
        );
        let model = self.loader.load(&options)?;

        let config = SessionConfig::resolve(request, model.as_ref(), self.settings.gpu_layers)?;
        config.log_summary(model.as_ref());

        let summary = SetupSummary {
            instance_id: "done".to_string(),
            model: model.describe(),
            prompt_tokens: config.prompt_tokens.len(),
            n_keep: config.n_keep,
            interactive: config.flags.interactive,
        };

        self.session = Some(Session { model, config });
        Ok(summary)
    }

    fn query(
        &self,
        id: Uuid,
        prompt: &str,
        mut sink: ChannelSink,
        cancel: &CancellationToken,
        accepted: oneshot::Sender<Result<(), ServiceError>>,
        permit: OwnedSemaphorePermit,
    ) {
        let Some(session) = &self.session else {
            drop(permit);
            let _ = accepted.send(Err(ServiceError::NotConfigured));
            return;
        };
        let config = &session.config;

        let options = RuntimeOptions {
            n_ctx: config.n_ctx,
            n_threads: config.n_threads,
            seed: config.seed,
        };

        let started = session.model.new_runtime(&options).and_then(|runtime| {
            let generation = Generation::start(config, runtime.as_ref(), prompt)?;
            Ok((runtime, generation))
        });
        let (mut runtime, generation) = match started {
            Ok(started) => started,
            Err(e) => {
                tracing::warn!("Query {} rejected: {}", id, e);
                drop(permit);
                let _ = accepted.send(Err(e));
                return;
            }
        };

        if accepted.send(Ok(())).is_err() {
            tracing::debug!("Query {} abandoned before start", id);
            return;
        }

        tracing::info!("Query {} started: '{}'", id, truncate_str(prompt, 80));

        match generation.run(runtime.as_mut(), &mut sink, cancel) {
            Ok(QueryOutcome::Cancelled) => tracing::info!("Query {} cancelled", id),
            Ok(outcome) => tracing::info!("Query {} finished: {:?}", id, outcome),
            Err(ServiceError::Delivery) => {
                tracing::debug!("Query {} stopped, stream closed", id)
            }
            Err(e) => {
                tracing::error!("Query {} failed: {}", id, e);
                sink.report(&e);
            }
        }

        // the permit goes first so a caller that saw the stream end can
        // start the next query right away
        drop(permit);
        drop(sink);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::mock::{MockLoader, MockModel};

    fn settings() -> ServerSettings {
        ServerSettings {
            channel_capacity: 8,
            ..ServerSettings::default()
        }
    }

    fn engine_with(model: MockModel) -> GptEngine {
        GptEngine::spawn(Box::new(MockLoader::new(model)), &settings()).unwrap()
    }

    async fn collect(mut stream: QueryStream) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = stream.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_query_before_setup() {
        let engine = engine_with(MockModel::new());
        assert!(!engine.is_configured());
        assert_eq!(
            engine.query("hi").await.err(),
            Some(ServiceError::NotConfigured)
        );
    }

    #[tokio::test]
    async fn test_setup_then_query() {
        let engine = engine_with(MockModel::new().with_output("yo").with_eos());

        let mut request = SetupRequest::new("/nonexistent/model.gguf");
        request.prompt = "Hi".to_string();
        request.echo_input = false;
        let summary = engine.setup(request).await.unwrap();

        assert_eq!(summary.instance_id, "done");
        assert_eq!(summary.prompt_tokens, 4);
        assert_eq!(summary.n_keep, 4);
        assert!(!summary.interactive);
        assert!(engine.is_configured());

        let events = collect(engine.query("q").await.unwrap()).await;
        assert_eq!(
            events,
            vec![
                StreamEvent::Token("y".to_string()),
                StreamEvent::Token("o".to_string()),
                StreamEvent::EndOfText,
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_setup_unconfigures() {
        let engine = GptEngine::spawn(Box::new(MockLoader::failing("bad weights")), &settings())
            .unwrap();
        let err = engine.setup(SetupRequest::new("/nonexistent/m.gguf")).await;
        assert!(matches!(err, Err(ServiceError::ModelLoadFailed { .. })));
        assert!(!engine.is_configured());
    }

    #[tokio::test]
    async fn test_load_options_reach_loader() {
        let model = MockModel::new();
        let engine = engine_with(model.clone());

        let mut request = SetupRequest::new("/nonexistent/m.gguf");
        request.use_mlock = true;
        request.use_mmap = false;
        request.memory_f16 = false;
        request.n_parts = 2;
        request.n_gpu_layers = Some(12);
        engine.setup(request).await.unwrap();

        let loads = model.log().loads;
        assert_eq!(loads.len(), 1);
        let options = &loads[0];
        assert_eq!(options.path, std::path::PathBuf::from("/nonexistent/m.gguf"));
        assert!(options.use_mlock);
        assert!(!options.use_mmap);
        assert!(!options.memory_f16);
        assert_eq!(options.n_parts, 2);
        assert_eq!(options.n_gpu_layers, 12);
    }

    #[tokio::test]
    async fn test_invalid_model_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.gguf");
        std::fs::write(&path, vec![0u8; 64]).unwrap();

        let engine = engine_with(MockModel::new());
        let err = engine
            .setup(SetupRequest::new(path.to_string_lossy()))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::ModelLoadFailed { .. }));
    }

    #[tokio::test]
    async fn test_oversized_query_rejected_before_streaming() {
        let engine = engine_with(MockModel::new());
        let mut request = SetupRequest::new("/nonexistent/m.gguf");
        request.n_ctx = 8;
        engine.setup(request).await.unwrap();

        let err = engine.query("far too long").await.err();
        assert_eq!(err, Some(ServiceError::PromptTooLong { tokens: 14, max: 4 }));

        // the permit is released, the next query runs
        assert!(engine.query("ok").await.is_ok());
    }

    #[tokio::test]
    async fn test_second_query_is_busy() {
        // the filler never ends, so the first query keeps the worker busy
        let engine = engine_with(MockModel::new());
        let mut request = SetupRequest::new("/nonexistent/m.gguf");
        request.n_predict = -1;
        engine.setup(request).await.unwrap();

        let first = engine.query("one").await.unwrap();
        assert_eq!(engine.query("two").await.err(), Some(ServiceError::Busy));

        drop(first);
        // setup waits until the cancelled query has released the worker
        engine.setup(SetupRequest::new("/nonexistent/m.gguf")).await.unwrap();
        assert!(engine.query("three").await.is_ok());
    }

    #[tokio::test]
    async fn test_eval_failure_reported_in_stream() {
        let engine = engine_with(MockModel::new().with_output("ab").fail_eval_at(1));
        let mut request = SetupRequest::new("/nonexistent/m.gguf");
        request.echo_input = false;
        engine.setup(request).await.unwrap();

        let events = collect(engine.query("q").await.unwrap()).await;
        assert_eq!(events[0], StreamEvent::Token("a".to_string()));
        assert!(matches!(events.last(), Some(StreamEvent::Error(msg)) if msg.contains("failed to eval")));
    }
}
