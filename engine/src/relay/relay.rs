//! Forwarding task between a remote stream and one subscriber

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::errors::EngineError;
use crate::relay::buffer::{Backlog, Delivery, LineSplitter};
use crate::relay::registry::{StreamGuard, StreamRegistry};
use crate::relay::source::LogSource;
use crate::ssh::{ManagedSession, RemoteStream, SessionManager, StreamEvent, Target};
use crate::storage::settings::RelaySettings;

/// Relay options
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Capacity of the delivery backlog and of the client-side history
    pub buffer_lines: usize,

    /// Upper bound on how long a stop request waits for the forwarding loop
    pub poll_interval: Duration,

    /// Lines of existing output sent when a stream opens
    pub initial_lines: u32,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            buffer_lines: 5000,
            poll_interval: Duration::from_millis(250),
            initial_lines: 100,
        }
    }
}

impl From<&RelaySettings> for RelayOptions {
    fn from(settings: &RelaySettings) -> Self {
        Self {
            buffer_lines: settings.buffer_lines,
            poll_interval: settings.poll_interval(),
            initial_lines: settings.initial_lines,
        }
    }
}

/// Why the forwarding loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Detach {
    Client,
    Remote(Option<u32>),
}

/// Opens live streams and keeps at most one reader per stream key
pub struct Relay {
    sessions: Arc<SessionManager>,
    registry: Arc<StreamRegistry>,
    options: RelayOptions,
}

impl Relay {
    pub fn new(sessions: Arc<SessionManager>, options: RelayOptions) -> Self {
        Self {
            sessions,
            registry: Arc::new(StreamRegistry::new()),
            options,
        }
    }

    pub fn options(&self) -> &RelayOptions {
        &self.options
    }

    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }

    /// Attach to `source` on the target. `owner` scopes the one-reader rule,
    /// normally the resource id.
    pub async fn open(
        &self,
        owner: &str,
        target: &Target,
        source: LogSource,
    ) -> Result<RelayHandle, EngineError> {
        source.validate()?;
        let guard = self.registry.register(format!("{}:{}", owner, source.key()))?;

        let session = self.sessions.open(target).await?;
        let command = source.command(self.options.initial_lines, session.username());
        let stream = match session.open_stream(&command).await {
            Ok(stream) => stream,
            Err(e) => {
                session.close().await;
                return Err(e);
            }
        };
        info!(stream = %guard.key(), target = %session.label(), "Live stream attached");

        let backlog = Backlog::new(self.options.buffer_lines);
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(forward(
            session,
            stream,
            backlog.clone(),
            stop_rx,
            guard,
            self.options.poll_interval,
        ));

        Ok(RelayHandle {
            backlog,
            stop: Some(stop_tx),
            task: Some(task),
        })
    }
}

/// Subscriber side of an open stream.
///
/// Dropping the handle detaches the stream; [`close`](Self::close) also
/// waits until the remote side has been released.
pub struct RelayHandle {
    backlog: Backlog,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl RelayHandle {
    /// Next batch of lines or the close notice; `None` once finished
    pub async fn next(&mut self) -> Option<Delivery> {
        self.backlog.recv().await
    }

    pub async fn close(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Stream forwarding task failed: {}", e);
            }
        }
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

async fn forward(
    session: ManagedSession,
    mut stream: Box<dyn RemoteStream>,
    backlog: Backlog,
    mut stop_rx: oneshot::Receiver<()>,
    guard: StreamGuard,
    poll_interval: Duration,
) {
    let mut splitter = LineSplitter::new();
    let mut exit_code = None;

    let detach = loop {
        tokio::select! {
            _ = &mut stop_rx => break Detach::Client,
            polled = tokio::time::timeout(poll_interval, stream.next_event()) => match polled {
                Err(_) => continue,
                Ok(Some(StreamEvent::Data(bytes))) => {
                    for line in splitter.push(&bytes) {
                        backlog.push(line);
                    }
                }
                Ok(Some(StreamEvent::Exit(code))) => exit_code = Some(code),
                Ok(None) => break Detach::Remote(exit_code),
            }
        }
    };

    if let Some(rest) = splitter.flush() {
        backlog.push(rest);
    }

    match detach {
        Detach::Client => debug!(stream = %guard.key(), "Client detached"),
        Detach::Remote(code) => {
            let notice = match code {
                Some(code) => format!("stream closed by remote host (exit {})", code),
                None => "stream closed by remote host".to_string(),
            };
            info!(stream = %guard.key(), "{}", notice);
            backlog.close(notice);
        }
    }

    let label = session.label().to_string();
    let stream_closed = stream.close().await;
    drop(stream);
    let session_closed = session.try_close().await;
    for result in [stream_closed, session_closed] {
        if let Err(e) = result {
            let err = EngineError::StreamTeardown(format!("{}: {}", label, e));
            warn!(stream = %guard.key(), "{}", err);
        }
    }

    if detach == Detach::Client {
        backlog.close("stream detached");
    }
    drop(guard);
}
