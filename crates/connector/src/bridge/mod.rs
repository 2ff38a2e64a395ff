//! Bridge to a slideshow helper process.
//!
//! # Architecture
//!
//! - **codec**: `\r\n`-terminated line framing for AsyncRead/AsyncWrite
//! - **protocol**: reply parsing (`{"response": …}` / `{"error": "…"}`) and request errors
//! - **correlator**: FIFO matching of replies to in-flight requests
//! - **channel**: helper spawning and the event loop that owns the pipes
//!
//! [`Bridge`] ties them together: resolve the helper, install it, spawn it,
//! then exchange one JSON line per request.

pub mod channel;
pub mod codec;
pub mod correlator;
pub mod protocol;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;

use self::channel::{ChannelCommand, ChannelHandle, CommandSpawner, HelperSpawner, SpawnError};
use self::correlator::{Correlator, FifoCorrelator};
use self::protocol::RequestError;
use crate::install::{BundledInstaller, InstallError, Installer};
use crate::platform::{ExecMode, host_platform};
use crate::registry::{HelperKey, Registry, RegistryError};

/// Environment variable asserted to every helper, set to the helper's key.
pub const CONNECTOR_ENV: &str = "CONNECTOR";

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("unsupported platform/application combination: {key}")]
    UnsupportedCombination { key: HelperKey },
    #[error("registry error: {0}")]
    Registry(RegistryError),
    #[error("helper installation failed: {0}")]
    InstallationFailed(#[from] InstallError),
    #[error("failed to spawn helper: {0}")]
    Spawn(#[from] SpawnError),
}

impl From<RegistryError> for BridgeError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnsupportedCombination { key } => Self::UnsupportedCombination { key },
            other => Self::Registry(other),
        }
    }
}

pub struct BridgeConfig {
    pub application_id: String,
    /// Overrides host platform detection.
    pub platform_id: Option<String>,
    pub registry: Registry,
    /// Defaults to a [`BundledInstaller`] next to the current executable.
    pub installer: Option<Arc<dyn Installer>>,
    pub spawner: Arc<dyn HelperSpawner>,
    /// Extra variables for the helper, on top of the inherited environment.
    pub env: Vec<(String, String)>,
}

impl BridgeConfig {
    pub fn new(application_id: impl Into<String>) -> Self {
        Self {
            application_id: application_id.into(),
            platform_id: None,
            registry: Registry::builtin(),
            installer: None,
            spawner: Arc::new(CommandSpawner),
            env: Vec::new(),
        }
    }

    pub fn with_platform(mut self, platform_id: impl Into<String>) -> Self {
        self.platform_id = Some(platform_id.into());
        self
    }

    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_installer(mut self, installer: Arc<dyn Installer>) -> Self {
        self.installer = Some(installer);
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn HelperSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Extra variables plus the [`CONNECTOR_ENV`] marker, which always wins.
fn helper_env(key: &HelperKey, extra: Vec<(String, String)>) -> Vec<(String, String)> {
    let mut env: Vec<_> = extra
        .into_iter()
        .filter(|(name, _)| {
            let reserved = name == CONNECTOR_ENV;
            if reserved {
                tracing::warn!(helper = %key, var = CONNECTOR_ENV, "Ignoring caller-supplied variable");
            }
            !reserved
        })
        .collect();
    env.push((CONNECTOR_ENV.to_string(), key.to_string()));
    env
}

/// Request/response bridge to one helper process.
///
/// Clones share the same helper. Dropping the last clone ends the helper's
/// input, like [`Bridge::end`].
#[derive(Debug, Clone)]
pub struct Bridge {
    key: String,
    channel: ChannelHandle,
}

impl Bridge {
    /// Resolve, install and spawn the helper for `config.application_id`.
    ///
    /// Nothing is spawned unless resolution and installation succeed.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn connect(config: BridgeConfig) -> Result<Self, BridgeError> {
        let platform_id = config
            .platform_id
            .unwrap_or_else(|| host_platform().to_string());
        let descriptor = config
            .registry
            .resolve(&platform_id, &config.application_id)?;
        let key = descriptor.key();

        let installer: Arc<dyn Installer> = match config.installer {
            Some(installer) => installer,
            None => Arc::new(BundledInstaller::beside_current_exe()?),
        };
        let resolved = installer.materialize(
            &descriptor.executable_name,
            ExecMode::for_platform(&platform_id),
        )?;

        let env = helper_env(&key, config.env);
        let mut child = config.spawner.spawn(&resolved, &env)?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SpawnError::Other("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpawnError::Other("stdout not captured".to_string()))?;

        let label = key.to_string();
        let channel = channel::start(
            stdout,
            stdin,
            Some(child),
            Box::new(FifoCorrelator::new()),
            label.clone(),
        );
        Ok(Self {
            key: label,
            channel,
        })
    }

    /// Attach to a helper that is already running on the other end of a
    /// reader/writer pair.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn from_io<R, W>(label: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::with_correlator(label, reader, writer, Box::new(FifoCorrelator::new()))
    }

    /// Like [`Bridge::from_io`] with a custom correlation strategy.
    pub fn with_correlator<R, W>(
        label: impl Into<String>,
        reader: R,
        writer: W,
        correlator: Box<dyn Correlator>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let key = label.into();
        let channel = channel::start(reader, writer, None, correlator, key.clone());
        Self { key, channel }
    }

    /// Helper key (`{platform}-{application}`) or the label given to `from_io`.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Send one request.
    ///
    /// The line is queued immediately, in call order; the returned future
    /// only waits for the reply. Dropping it does not withdraw the request:
    /// its reply is still consumed when it arrives.
    pub fn request<T>(&self, payload: &T) -> ResponseFuture
    where
        T: Serialize + ?Sized,
    {
        let line = match serde_json::to_string(payload) {
            Ok(line) => line,
            Err(e) => return ResponseFuture::failed(RequestError::Serialize(e)),
        };

        let (reply, rx) = oneshot::channel();
        let command = ChannelCommand::Request { line, reply };
        if self.channel.commands.send(command).is_err() {
            return ResponseFuture::failed(RequestError::ChannelClosed);
        }
        ResponseFuture::waiting(rx)
    }

    /// Close the helper's input. Idempotent.
    ///
    /// The helper is not killed. Requests already sent still settle, with
    /// their reply or with `ChannelClosed` once the helper's output ends.
    pub fn end(&self) {
        let _ = self.channel.commands.send(ChannelCommand::End);
    }

    /// True once the helper's output has ended and all requests are settled.
    pub fn is_closed(&self) -> bool {
        *self.channel.closed.borrow()
    }

    /// Wait until the helper's output has ended, every pending request has
    /// been settled and the process (if any) has been reaped.
    pub async fn closed(&self) {
        let mut closed = self.channel.closed.clone();
        // Err means the event loop is gone, which is closed too.
        let _ = closed.wait_for(|done| *done).await;
    }
}

/// Eventual result of [`Bridge::request`]. Settles exactly once.
#[must_use = "a request's result is only observed by awaiting it"]
#[derive(Debug)]
pub struct ResponseFuture {
    state: ResponseState,
}

#[derive(Debug)]
enum ResponseState {
    Failed(Option<RequestError>),
    Waiting(oneshot::Receiver<Result<Value, RequestError>>),
}

impl ResponseFuture {
    fn failed(err: RequestError) -> Self {
        Self {
            state: ResponseState::Failed(Some(err)),
        }
    }

    fn waiting(rx: oneshot::Receiver<Result<Value, RequestError>>) -> Self {
        Self {
            state: ResponseState::Waiting(rx),
        }
    }
}

impl Future for ResponseFuture {
    type Output = Result<Value, RequestError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            ResponseState::Failed(err) => {
                Poll::Ready(Err(err.take().unwrap_or(RequestError::ChannelClosed)))
            }
            ResponseState::Waiting(rx) => Pin::new(rx)
                .poll(cx)
                .map(|result| result.unwrap_or_else(|_| Err(RequestError::ChannelClosed))),
        }
    }
}
