use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{instrument, Span};

pub use inference_adapter_backend_core::{
    BackendError, BackendKind, Embedder, Number, RawOutput, Reranker,
};

#[cfg(feature = "remote")]
pub use inference_adapter_backend_remote::{RemoteBackend, RemoteConfig, Url};

/// Process-wide handle to the embedder and reranker.
///
/// Both collaborators live on a dedicated thread; every call is a command sent to that
/// thread and answered through a oneshot channel.
#[derive(Debug, Clone)]
pub struct Backend {
    /// Channel to communicate with the background thread
    backend_sender: mpsc::Sender<BackendCommand>,
    /// Health status
    health_receiver: watch::Receiver<bool>,
    _backend_thread: Arc<BackendThread>,
    pub kind: BackendKind,
}

impl Backend {
    pub fn new(
        embedder: Box<dyn Embedder + Send>,
        reranker: Box<dyn Reranker + Send>,
        kind: BackendKind,
    ) -> Self {
        let (backend_sender, backend_receiver) = mpsc::channel(8);
        let (health_sender, health_receiver) = watch::channel(false);
        let _backend_thread = Arc::new(BackendThread::new(
            embedder,
            reranker,
            backend_receiver,
            health_sender,
        ));

        Self {
            backend_sender,
            health_receiver,
            _backend_thread,
            kind,
        }
    }

    /// Serve both collaborators from the same upstream inference server
    #[cfg(feature = "remote")]
    pub fn remote(config: RemoteConfig) -> Result<Self, BackendError> {
        let backend = Arc::new(RemoteBackend::new(config)?);
        Ok(Self::new(
            Box::new(backend.clone()),
            Box::new(backend),
            BackendKind::Remote,
        ))
    }

    #[instrument(skip(self))]
    pub async fn health(&self) -> Result<(), BackendError> {
        if *self.health_receiver.borrow() {
            // The backend answered its last command. Only ask the collaborators for their
            // own health status.
            let (sender, receiver) = oneshot::channel();
            self.send(BackendCommand::Health(Span::current(), sender))
                .await?;
            receiver.await.map_err(|_| dropped())?
        } else {
            // The backend is un-healthy or only just started. Run a real forward pass
            self.embed(vec!["health".to_string()]).await.map(|_| ())
        }
    }

    #[instrument(skip(self))]
    pub fn health_watcher(&self) -> watch::Receiver<bool> {
        self.health_receiver.clone()
    }

    #[instrument(skip_all)]
    pub async fn embed(&self, texts: Vec<String>) -> Result<(RawOutput, Duration), BackendError> {
        let (sender, receiver) = oneshot::channel();
        self.send(BackendCommand::Embed(texts, Span::current(), sender))
            .await?;
        receiver.await.map_err(|_| dropped())?
    }

    #[instrument(skip_all)]
    pub async fn score(
        &self,
        pairs: Vec<(String, String)>,
    ) -> Result<(RawOutput, Duration), BackendError> {
        let (sender, receiver) = oneshot::channel();
        self.send(BackendCommand::Score(pairs, Span::current(), sender))
            .await?;
        receiver.await.map_err(|_| dropped())?
    }

    async fn send(&self, command: BackendCommand) -> Result<(), BackendError> {
        self.backend_sender.send(command).await.map_err(|_| {
            let err = BackendError::Inference("backend thread is not running".to_string());
            tracing::error!("{err}");
            err
        })
    }
}

fn dropped() -> BackendError {
    let err = BackendError::Inference(
        "backend thread dropped the request without answering".to_string(),
    );
    tracing::error!("{err}");
    err
}

/// Turn a collaborator panic into an inference error carrying the panic message
fn guarded<T>(f: impl FnOnce() -> Result<T, BackendError>) -> Result<T, BackendError> {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        let message = panic_message(payload.as_ref());
        tracing::error!("collaborator panicked: {message}");
        Err(BackendError::Inference(message))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "collaborator panicked".to_string()
    }
}

#[derive(Debug)]
struct BackendThread(Option<JoinHandle<()>>);

impl BackendThread {
    fn new(
        embedder: Box<dyn Embedder + Send>,
        reranker: Box<dyn Reranker + Send>,
        mut backend_receiver: mpsc::Receiver<BackendCommand>,
        health_sender: watch::Sender<bool>,
    ) -> Self {
        let handle = std::thread::spawn(move || {
            while let Some(cmd) = backend_receiver.blocking_recv() {
                let start = Instant::now();
                // Health is published before answering so callers observe it on return
                match cmd {
                    BackendCommand::Health(span, sender) => {
                        let _span = span.entered();
                        let result = guarded(|| {
                            embedder.health()?;
                            reranker.health()
                        });
                        let _ = health_sender.send(result.is_ok());
                        let _ = sender.send(result);
                    }
                    BackendCommand::Embed(texts, span, sender) => {
                        let _span = span.entered();
                        let result = guarded(|| embedder.embed(texts)).map(|e| (e, start.elapsed()));
                        let _ = health_sender.send(result.is_ok());
                        let _ = sender.send(result);
                    }
                    BackendCommand::Score(pairs, span, sender) => {
                        let _span = span.entered();
                        let result = guarded(|| reranker.score(pairs)).map(|s| (s, start.elapsed()));
                        let _ = health_sender.send(result.is_ok());
                        let _ = sender.send(result);
                    }
                };
            }
        });
        Self(Some(handle))
    }
}

impl Drop for BackendThread {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            let _ = handle.join();
        }
    }
}

enum BackendCommand {
    Health(Span, oneshot::Sender<Result<(), BackendError>>),
    Embed(
        Vec<String>,
        Span,
        oneshot::Sender<Result<(RawOutput, Duration), BackendError>>,
    ),
    Score(
        Vec<(String, String)>,
        Span,
        oneshot::Sender<Result<(RawOutput, Duration), BackendError>>,
    ),
}
