//! Scripted in-process [`Connector`] for tests and dry runs.
//!
//! Hosts are scripted with command rules matched by substring, first match
//! wins. Counters track live sessions and streams so callers can assert
//! nothing is left attached.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::errors::EngineError;
use crate::ssh::command::{shell_quote, CommandResult, StreamEvent};
use crate::ssh::session::{Connector, RemoteSession, RemoteStream};
use crate::ssh::target::Target;
use crate::vault::SshSecret;

/// Canned reply for a command rule
#[derive(Debug, Clone, Default)]
pub struct MockReply {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: u32,
    pub delay: Option<Duration>,
}

impl MockReply {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    pub fn fail(exit_code: u32, stderr: impl Into<String>) -> Self {
        Self {
            stderr: stderr.into(),
            exit_code,
            ..Default::default()
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[derive(Debug, Clone)]
struct StreamScript {
    pattern: String,
    lines: Vec<String>,
    hold_open: bool,
}

/// Behaviour of one scripted host
#[derive(Debug, Clone, Default)]
pub struct MockHost {
    unreachable: bool,
    reject_auth: bool,
    rules: Vec<(String, MockReply)>,
    streams: Vec<StreamScript>,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Default::default()
        }
    }

    pub fn rejecting_auth() -> Self {
        Self {
            reject_auth: true,
            ..Default::default()
        }
    }

    /// Reply to any command containing `pattern`
    pub fn on(mut self, pattern: impl Into<String>, reply: MockReply) -> Self {
        self.rules.push((pattern.into(), reply));
        self
    }

    /// Stream `lines` for a command containing `pattern`; with `hold_open`
    /// the stream stays attached after the lines until closed.
    pub fn stream(mut self, pattern: impl Into<String>, lines: &[&str], hold_open: bool) -> Self {
        self.streams.push(StreamScript {
            pattern: pattern.into(),
            lines: lines.iter().map(|l| l.to_string()).collect(),
            hold_open,
        });
        self
    }

    fn reply_for(&self, command: &str) -> MockReply {
        self.rules
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, reply)| reply.clone())
            .unwrap_or_default()
    }
}

#[derive(Default)]
struct MockStats {
    connects: AtomicUsize,
    open_sessions: AtomicUsize,
    peak_sessions: AtomicUsize,
    open_streams: AtomicUsize,
    commands: Mutex<Vec<(String, String)>>,
    uploads: Mutex<Vec<(String, String, usize)>>,
}

/// Decrements a live counter when released or dropped
struct LiveGuard(Arc<MockStats>, fn(&MockStats) -> &AtomicUsize);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        (self.1)(&self.0).fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct MockConnector {
    hosts: Mutex<HashMap<String, MockHost>>,
    stats: Arc<MockStats>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(self, host_address: impl Into<String>, host: MockHost) -> Self {
        self.set_host(host_address, host);
        self
    }

    pub fn set_host(&self, host_address: impl Into<String>, host: MockHost) {
        lock(&self.hosts).insert(host_address.into(), host);
    }

    pub fn connect_count(&self) -> usize {
        self.stats.connects.load(Ordering::SeqCst)
    }

    pub fn open_sessions(&self) -> usize {
        self.stats.open_sessions.load(Ordering::SeqCst)
    }

    pub fn peak_sessions(&self) -> usize {
        self.stats.peak_sessions.load(Ordering::SeqCst)
    }

    pub fn open_streams(&self) -> usize {
        self.stats.open_streams.load(Ordering::SeqCst)
    }

    /// Commands executed against `host_address`, in order
    pub fn commands(&self, host_address: &str) -> Vec<String> {
        lock(&self.stats.commands)
            .iter()
            .filter(|(host, _)| host == host_address)
            .map(|(_, command)| command.clone())
            .collect()
    }

    /// `(remote_path, byte_len)` of uploads to `host_address`
    pub fn uploads(&self, host_address: &str) -> Vec<(String, usize)> {
        lock(&self.stats.uploads)
            .iter()
            .filter(|(host, _, _)| host == host_address)
            .map(|(_, path, len)| (path.clone(), *len))
            .collect()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        target: &Target,
        secret: SshSecret,
        _timeout: Duration,
    ) -> Result<Box<dyn RemoteSession>, EngineError> {
        let host = lock(&self.hosts).get(&target.host_address).cloned();
        let host = match host {
            Some(host) if !host.unreachable => host,
            _ => {
                return Err(EngineError::ConnectionError(format!(
                    "{}: no route to host",
                    target.host_key()
                )))
            }
        };
        if host.reject_auth || secret.is_empty() {
            return Err(EngineError::ConnectionError(format!(
                "{}: authentication failed for user {}",
                target.host_key(),
                target.ssh_username
            )));
        }

        self.stats.connects.fetch_add(1, Ordering::SeqCst);
        let live = self.stats.open_sessions.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.peak_sessions.fetch_max(live, Ordering::SeqCst);

        Ok(Box::new(MockSession {
            host_address: target.host_address.clone(),
            host,
            stats: self.stats.clone(),
            guard: Mutex::new(Some(LiveGuard(self.stats.clone(), |s| &s.open_sessions))),
        }))
    }
}

struct MockSession {
    host_address: String,
    host: MockHost,
    stats: Arc<MockStats>,
    guard: Mutex<Option<LiveGuard>>,
}

impl MockSession {
    fn ensure_open(&self) -> Result<(), EngineError> {
        if lock(&self.guard).is_none() {
            return Err(EngineError::ConnectionError("session already closed".to_string()));
        }
        Ok(())
    }

    fn record(&self, command: &str) {
        lock(&self.stats.commands).push((self.host_address.clone(), command.to_string()));
    }

    async fn reply(&self, command: &str, timeout: Duration) -> Result<CommandResult, EngineError> {
        let reply = self.host.reply_for(command);
        if let Some(delay) = reply.delay {
            if delay > timeout {
                tokio::time::sleep(timeout).await;
                return Err(EngineError::CommandTimeout(timeout));
            }
            tokio::time::sleep(delay).await;
        }
        Ok(CommandResult::new(reply.stdout, reply.stderr, reply.exit_code))
    }
}

#[async_trait]
impl RemoteSession for MockSession {
    async fn exec(&self, command: &str, timeout: Duration) -> Result<CommandResult, EngineError> {
        self.ensure_open()?;
        self.record(command);
        self.reply(command, timeout).await
    }

    async fn upload(
        &self,
        contents: &[u8],
        remote_path: &str,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        self.ensure_open()?;
        let command = format!("cat > {}", shell_quote(remote_path));
        self.record(&command);
        lock(&self.stats.uploads).push((
            self.host_address.clone(),
            remote_path.to_string(),
            contents.len(),
        ));
        self.reply(&command, timeout).await?.into_checked().map(|_| ())
    }

    async fn open_stream(&self, command: &str) -> Result<Box<dyn RemoteStream>, EngineError> {
        self.ensure_open()?;
        self.record(command);

        let (events, hold_open) = match self
            .host
            .streams
            .iter()
            .find(|script| command.contains(script.pattern.as_str()))
        {
            Some(script) => (
                script
                    .lines
                    .iter()
                    .map(|line| StreamEvent::Data(format!("{}\n", line).into_bytes()))
                    .collect::<VecDeque<_>>(),
                script.hold_open,
            ),
            None => {
                let reply = self.host.reply_for(command);
                let mut events = VecDeque::new();
                if !reply.stdout.is_empty() {
                    events.push_back(StreamEvent::Data(reply.stdout.into_bytes()));
                }
                events.push_back(StreamEvent::Exit(reply.exit_code));
                (events, false)
            }
        };

        self.stats.open_streams.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockStream {
            events,
            hold_open,
            guard: Some(LiveGuard(self.stats.clone(), |s| &s.open_streams)),
        }))
    }

    async fn close(&self) -> Result<(), EngineError> {
        lock(&self.guard).take();
        Ok(())
    }
}

struct MockStream {
    events: VecDeque<StreamEvent>,
    hold_open: bool,
    guard: Option<LiveGuard>,
}

#[async_trait]
impl RemoteStream for MockStream {
    async fn next_event(&mut self) -> Option<StreamEvent> {
        if self.guard.is_none() {
            return None;
        }
        match self.events.pop_front() {
            Some(event) => Some(event),
            None if self.hold_open => std::future::pending().await,
            None => None,
        }
    }

    async fn close(&mut self) -> Result<(), EngineError> {
        self.guard.take();
        Ok(())
    }
}
