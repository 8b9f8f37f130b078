use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use ::time::OffsetDateTime;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::clock::{ClockTick, LiveClock};
use crate::completion::{CompletionDetector, CompletionEvent};
use crate::config::SessionConfig;
use crate::error::ScanError;
use crate::history::{HistoryEntry, NewHistoryEntry, PersistenceBridge};
use crate::session::{apply_tool_result, Applied, SessionState, SessionStatus};
use crate::target::is_valid_domain;
use crate::types::{ScanRequest, ToolFrame};

/// Text channel to the scan backend.
#[async_trait]
pub trait Transport: Send {
    async fn send_text(&mut self, text: String) -> Result<(), ScanError>;

    /// Next inbound text frame, or `None` once the peer closed the channel.
    async fn next_text(&mut self) -> Option<Result<String, ScanError>>;

    async fn close(&mut self);
}

/// WebSocket transport to the backend's `/scan/stream` endpoint.
pub struct WsTransport {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsTransport {
    pub async fn connect(url: &str) -> Result<Self, ScanError> {
        let (inner, _) = connect_async(url)
            .await
            .map_err(|e| ScanError::Transport(e.to_string()))?;
        Ok(Self { inner })
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send_text(&mut self, text: String) -> Result<(), ScanError> {
        self.inner
            .send(Message::Text(text))
            .await
            .map_err(|e| ScanError::Transport(e.to_string()))
    }

    async fn next_text(&mut self) -> Option<Result<String, ScanError>> {
        loop {
            match self.inner.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(bytes)) => {
                    return Some(Ok(String::from_utf8_lossy(&bytes).into_owned()))
                }
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(e) => return Some(Err(ScanError::Transport(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.inner.close(None).await;
    }
}

/// In-process transport, paired with a [`ChannelPeer`] playing the backend.
pub struct ChannelTransport {
    inbound: mpsc::UnboundedReceiver<Result<String, ScanError>>,
    outbound: mpsc::UnboundedSender<String>,
}

/// Backend end of a [`ChannelTransport`]. Dropping it closes the channel.
pub struct ChannelPeer {
    to_client: mpsc::UnboundedSender<Result<String, ScanError>>,
    from_client: mpsc::UnboundedReceiver<String>,
}

pub fn channel_transport() -> (ChannelTransport, ChannelPeer) {
    let (to_client, inbound) = mpsc::unbounded_channel();
    let (outbound, from_client) = mpsc::unbounded_channel();
    (
        ChannelTransport { inbound, outbound },
        ChannelPeer {
            to_client,
            from_client,
        },
    )
}

impl ChannelPeer {
    /// Send a raw text frame. Returns false once the client side is gone.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.to_client.send(Ok(text.into())).is_ok()
    }

    pub fn send_frame(&self, frame: &ToolFrame) -> bool {
        match serde_json::to_string(frame) {
            Ok(text) => self.send_text(text),
            Err(_) => false,
        }
    }

    /// Inject a transport-level failure.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.to_client
            .send(Err(ScanError::Transport(reason.into())))
            .is_ok()
    }

    /// Next frame the client sent.
    pub async fn recv(&mut self) -> Option<String> {
        self.from_client.recv().await
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send_text(&mut self, text: String) -> Result<(), ScanError> {
        self.outbound
            .send(text)
            .map_err(|_| ScanError::Transport("peer dropped".into()))
    }

    async fn next_text(&mut self) -> Option<Result<String, ScanError>> {
        self.inbound.recv().await
    }

    async fn close(&mut self) {
        self.inbound.close();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseKind {
    Clean,
    Error(String),
}

/// Lifecycle of the single channel a session owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connecting,
    Open,
    Closed(CloseKind),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PersistOutcome {
    Saved(HistoryEntry),
    Failed(String),
}

/// Everything a finished session leaves behind.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session: SessionState,
    pub channel: ChannelState,
    pub completion: Option<CompletionEvent>,
    pub persisted: Option<PersistOutcome>,
}

impl SessionReport {
    pub fn status(&self) -> SessionStatus {
        self.session.status()
    }
}

/// Drives one scan session over one channel: sends the request, applies each
/// inbound frame in arrival order, detects completion and saves the result once.
pub struct StreamClient {
    channel: ChannelState,
    session: SessionState,
    detector: CompletionDetector,
    persistence: Arc<dyn PersistenceBridge>,
    snapshots: watch::Sender<SessionState>,
    cancel: CancellationToken,
    grace_period: Option<Duration>,
    completion: Option<CompletionEvent>,
    persisted: Option<PersistOutcome>,
}

impl StreamClient {
    /// Prepare an idle session. Refuses requests without a valid domain.
    pub fn new(
        request: ScanRequest,
        config: &SessionConfig,
        persistence: Arc<dyn PersistenceBridge>,
    ) -> Result<Self, ScanError> {
        if !is_valid_domain(&request.domain) {
            return Err(ScanError::InvalidDomain(request.domain));
        }
        let session = SessionState::new(
            request,
            config.expected_tools.iter().copied(),
            OffsetDateTime::now_utc(),
        );
        let (snapshots, _) = watch::channel(session.clone());
        Ok(Self {
            channel: ChannelState::Idle,
            session,
            detector: CompletionDetector::new(config.expected_tools.iter().copied()),
            persistence,
            snapshots,
            cancel: CancellationToken::new(),
            grace_period: config.grace_period,
            completion: None,
            persisted: None,
        })
    }

    pub fn scan_id(&self) -> &str {
        &self.session.request.scan_id
    }

    pub fn channel_state(&self) -> &ChannelState {
        &self.channel
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    /// Receiver of session snapshots, published after every change.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.snapshots.subscribe()
    }

    /// Cancelling this token tears the session down: the channel is released
    /// and no later frame touches the session.
    pub fn teardown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Start a live clock bound to this session's lifetime.
    pub fn spawn_clock<F>(&self, period: Duration, on_tick: F) -> LiveClock
    where
        F: FnMut(ClockTick) + Send + 'static,
    {
        LiveClock::spawn(self.subscribe(), period, self.cancel.child_token(), on_tick)
    }

    /// Run the session to the end. `connect` establishes the channel.
    pub async fn run<T, F>(self, connect: F) -> SessionReport
    where
        T: Transport,
        F: Future<Output = Result<T, ScanError>> + Send,
    {
        let span = info_span!(
            "scan",
            scan_id = %self.session.request.scan_id,
            domain = %self.session.request.domain
        );
        self.drive(connect).instrument(span).await
    }

    async fn drive<T, F>(mut self, connect: F) -> SessionReport
    where
        T: Transport,
        F: Future<Output = Result<T, ScanError>> + Send,
    {
        self.channel = ChannelState::Connecting;
        debug!("connecting");
        let connected = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            res = connect => Some(res),
        };
        let mut transport = match connected {
            None => {
                info!("torn down while connecting");
                return self.finish(CloseKind::Clean);
            }
            Some(Err(e)) => {
                let reason = e.to_string();
                self.fail(&reason);
                return self.finish(CloseKind::Error(reason));
            }
            Some(Ok(t)) => t,
        };

        self.channel = ChannelState::Open;
        let payload = match serde_json::to_string(&self.session.request) {
            Ok(p) => p,
            Err(e) => {
                transport.close().await;
                let reason = e.to_string();
                self.fail(&reason);
                return self.finish(CloseKind::Error(reason));
            }
        };
        if let Err(e) = transport.send_text(payload).await {
            transport.close().await;
            let reason = e.to_string();
            self.fail(&reason);
            return self.finish(CloseKind::Error(reason));
        }
        info!(source = %self.session.request.source, "scan request sent");

        let close = self.pump(&mut transport).await;
        transport.close().await;
        self.finish(close)
    }

    async fn pump<T: Transport>(&mut self, transport: &mut T) -> CloseKind {
        let mut deadline: Option<Instant> = None;
        loop {
            let grace = async move {
                match deadline {
                    Some(d) => time::sleep_until(d).await,
                    None => std::future::pending::<()>().await,
                }
            };
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!("session torn down");
                    return CloseKind::Clean;
                }
                _ = grace => {
                    debug!("grace period over");
                    return CloseKind::Clean;
                }
                next = transport.next_text() => next,
            };

            match next {
                None if self.session.completed => return CloseKind::Clean,
                None => {
                    let reason = ScanError::ClosedEarly.to_string();
                    self.fail(&reason);
                    return CloseKind::Error(reason);
                }
                Some(Err(e)) if self.session.completed => {
                    debug!(error = %e, "transport error after completion");
                    return CloseKind::Clean;
                }
                Some(Err(e)) => {
                    let reason = e.to_string();
                    self.fail(&reason);
                    return CloseKind::Error(reason);
                }
                Some(Ok(text)) => {
                    if self.handle_text(&text).await && deadline.is_none() {
                        deadline = self.grace_period.map(|g| Instant::now() + g);
                    }
                }
            }
        }
    }

    /// Apply one inbound frame. Returns true when it completed the session.
    async fn handle_text(&mut self, text: &str) -> bool {
        let frame: ToolFrame = match serde_json::from_str(text) {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "malformed frame ignored");
                return false;
            }
        };

        let now = OffsetDateTime::now_utc();
        let (next, applied) = apply_tool_result(&self.session, &frame, now);
        match &applied {
            Applied::Recorded(tool) | Applied::Replaced(tool) => {
                info!(tool = %tool, duration = ?frame.duration, "tool reported");
                if let Some(theirs) = &frame.combined {
                    if *theirs != next.combined {
                        debug!(tool = %tool, "backend union differs from local merge");
                    }
                }
            }
            Applied::ToolFailed(tool) => {
                warn!(tool = %tool, error = ?frame.error, "tool failed");
            }
            Applied::Ignored(reason) => {
                warn!(source = %frame.source, ?reason, "frame ignored");
            }
        }
        self.session = next;

        let event = self.detector.evaluate(&mut self.session, now);
        self.publish();
        match event {
            Some(event) => {
                self.persist(event).await;
                true
            }
            None => false,
        }
    }

    async fn persist(&mut self, event: CompletionEvent) {
        if self.persisted.is_some() {
            return;
        }
        info!(
            elapsed_ms = event.elapsed().as_millis() as u64,
            findings = event.combined.total(),
            "scan complete"
        );
        let record = NewHistoryEntry::from(&event);
        self.completion = Some(event);
        let outcome = match self.persistence.save(record).await {
            Ok(entry) => {
                info!(id = entry.id, "scan saved");
                PersistOutcome::Saved(entry)
            }
            Err(e) => {
                warn!(error = %e, "failed to save scan");
                PersistOutcome::Failed(e.to_string())
            }
        };
        self.persisted = Some(outcome);
    }

    fn fail(&mut self, reason: &str) {
        if self.session.status() == SessionStatus::Running {
            warn!(reason, "session failed");
        }
        self.session = self.session.mark_failed(reason, OffsetDateTime::now_utc());
        self.publish();
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.session.clone());
    }

    fn finish(mut self, close: CloseKind) -> SessionReport {
        self.channel = ChannelState::Closed(close);
        debug!(channel = ?self.channel, "channel closed");
        SessionReport {
            session: self.session,
            channel: self.channel,
            completion: self.completion,
            persisted: self.persisted,
        }
    }
}
