//! Research session state machine.
//!
//! Every transport event is fed to exactly one handler on [`ResearchSession`].
//! Handlers mutate the session and return the [`Command`]s the driver must
//! carry out; they never perform I/O themselves. Events that carry a
//! [`ConnectionId`] other than the active one are ignored.

use std::{sync::Arc, time::Duration};

use shared::{
    domain::{ApiKeyPolicy, ConnectionId, SessionId},
    protocol::{FormSnapshot, ServerMessage, SessionRequest, DEFAULT_SERVER_ERROR_MESSAGE},
};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    endpoint::endpoint_for_page,
    error::{Alert, SessionFailure, Severity},
    events::SessionEvent,
    renderer::Renderer,
};

pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(2000);
pub const THINKING_MESSAGE: &str = "🤔 Thinking about research questions for the task...";

/// Supplies the research form fields; read, never written.
pub trait FormDataProvider: Send + Sync {
    fn snapshot(&self) -> FormSnapshot;
}

impl FormDataProvider for FormSnapshot {
    fn snapshot(&self) -> FormSnapshot {
        self.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    Clean,
    Unclean,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closed(CloseKind),
}

#[derive(Debug, Clone)]
pub struct SessionPolicy {
    pub page_url: String,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub api_key_policy: ApiKeyPolicy,
}

impl SessionPolicy {
    pub fn for_page(page_url: impl Into<String>) -> Self {
        Self {
            page_url: page_url.into(),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            api_key_policy: ApiKeyPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect {
        connection: ConnectionId,
        endpoint: Url,
    },
    Send {
        connection: ConnectionId,
        frame: String,
    },
    /// The session already treats the connection as gone; no close event follows.
    Close { connection: ConnectionId },
    ScheduleReconnect {
        connection: ConnectionId,
        delay: Duration,
    },
}

pub struct ResearchSession {
    policy: SessionPolicy,
    renderer: Renderer,
    events: broadcast::Sender<SessionEvent>,
    form: Option<Arc<dyn FormDataProvider>>,
    session_id: Option<SessionId>,
    state: ConnectionState,
    endpoint: Option<Url>,
    reconnect_attempts: u32,
    last_connection: ConnectionId,
    active: Option<ConnectionId>,
    pending_retry: Option<ConnectionId>,
    torn_down: bool,
    download_target: Option<String>,
    alerts: Vec<Alert>,
}

impl ResearchSession {
    pub fn new(policy: SessionPolicy, events: broadcast::Sender<SessionEvent>) -> Self {
        Self {
            policy,
            renderer: Renderer::new(events.clone()),
            events,
            form: None,
            session_id: None,
            state: ConnectionState::Idle,
            endpoint: None,
            reconnect_attempts: 0,
            last_connection: ConnectionId(0),
            active: None,
            pending_retry: None,
            torn_down: false,
            download_target: None,
            alerts: Vec::new(),
        }
    }

    /// Begins a fresh session, superseding whatever connection the previous
    /// one left behind.
    pub fn start(&mut self, form: Arc<dyn FormDataProvider>) -> Vec<Command> {
        let mut commands = Vec::new();
        if let Some(previous) = self.active.take() {
            commands.push(Command::Close {
                connection: previous,
            });
        }
        self.pending_retry = None;
        self.torn_down = false;
        self.reconnect_attempts = 0;
        self.download_target = None;
        self.endpoint = None;
        self.form = None;
        self.alerts.clear();
        self.renderer.clear();
        self.set_state(ConnectionState::Idle);

        let session_id = SessionId::new();
        self.session_id = Some(session_id);
        info!(%session_id, page_url = %self.policy.page_url, "starting research session");
        let _ = self.events.send(SessionEvent::Started { session_id });

        self.renderer.append_log(THINKING_MESSAGE);

        if let Err(err) = SessionRequest::from_form(&form.snapshot(), self.policy.api_key_policy) {
            self.raise(
                Severity::Blocking,
                SessionFailure::InvalidRequest(err.to_string()),
            );
            return commands;
        }
        self.form = Some(form);

        let endpoint = match endpoint_for_page(&self.policy.page_url) {
            Ok(endpoint) => endpoint,
            Err(err) => {
                self.raise(
                    Severity::Blocking,
                    SessionFailure::TransportConstructionFailure(err.to_string()),
                );
                return commands;
            }
        };
        self.endpoint = Some(endpoint.clone());
        commands.push(self.open_connection(endpoint));
        commands
    }

    pub fn on_open(&mut self, connection: ConnectionId) -> Vec<Command> {
        if !self.is_active(connection) {
            debug!(%connection, "ignoring open from superseded connection");
            return Vec::new();
        }
        self.reconnect_attempts = 0;
        self.set_state(ConnectionState::Open);

        let Some(snapshot) = self.form.as_ref().map(|form| form.snapshot()) else {
            return Vec::new();
        };
        let request = match SessionRequest::from_form(&snapshot, self.policy.api_key_policy) {
            Ok(request) => request,
            Err(err) => {
                self.raise(
                    Severity::Blocking,
                    SessionFailure::InvalidRequest(err.to_string()),
                );
                return vec![self.close_active(connection)];
            }
        };
        if !request.has_api_key() {
            warn!(%connection, "API key is missing or empty");
        }

        match request.start_command() {
            Ok(frame) => {
                info!(%connection, ?request, "sending start command");
                vec![Command::Send { connection, frame }]
            }
            Err(err) => {
                self.raise(
                    Severity::Blocking,
                    SessionFailure::InvalidRequest(err.to_string()),
                );
                vec![self.close_active(connection)]
            }
        }
    }

    pub fn on_message(&mut self, connection: ConnectionId, raw: &str) {
        if !self.is_active(connection) {
            debug!(%connection, "dropping message from superseded connection");
            return;
        }

        let message = match ServerMessage::parse(raw) {
            Ok(message) => message,
            Err(err) => {
                let failure = SessionFailure::MalformedMessage(err.to_string());
                warn!(%connection, %failure, "dropping inbound frame");
                return;
            }
        };
        debug!(%connection, tag = message.tag(), "server message");

        match message {
            ServerMessage::Logs { text } => self.renderer.append_log(&text),
            ServerMessage::Report { markdown_fragment } => {
                self.renderer.append_report_markdown(&markdown_fragment)
            }
            ServerMessage::Path { download_uri } => {
                self.download_target = Some(download_uri.clone());
                let _ = self
                    .events
                    .send(SessionEvent::DownloadTargetChanged(download_uri));
            }
            ServerMessage::Error { message } => {
                let message =
                    message.unwrap_or_else(|| DEFAULT_SERVER_ERROR_MESSAGE.to_string());
                self.renderer.append_error(&message);
                self.raise(
                    Severity::Blocking,
                    SessionFailure::ServerReportedError(message),
                );
            }
            ServerMessage::Unknown { tag } => {
                warn!(%connection, %tag, "ignoring server message with unknown type");
            }
        }
    }

    /// Surfaces the error only; the close event that follows decides recovery.
    pub fn on_transport_error(&mut self, connection: ConnectionId, error: &str) {
        if !self.is_active(connection) {
            return;
        }
        self.raise(
            Severity::NonBlocking,
            SessionFailure::Transport(error.to_string()),
        );
    }

    pub fn on_close(&mut self, connection: ConnectionId, was_clean: bool) -> Vec<Command> {
        if !self.is_active(connection) {
            debug!(%connection, "ignoring close from superseded connection");
            return Vec::new();
        }
        self.active = None;

        if was_clean {
            info!(%connection, "connection closed cleanly");
            self.set_state(ConnectionState::Closed(CloseKind::Clean));
            return Vec::new();
        }

        self.set_state(ConnectionState::Closed(CloseKind::Unclean));
        let max_attempts = self.policy.max_reconnect_attempts;
        if self.reconnect_attempts < max_attempts {
            self.reconnect_attempts += 1;
            self.pending_retry = Some(connection);
            let failure = SessionFailure::TransientDisconnect {
                attempt: self.reconnect_attempts,
                max_attempts,
            };
            info!(%connection, delay_ms = self.policy.reconnect_delay.as_millis() as u64, "{failure}");
            return vec![Command::ScheduleReconnect {
                connection,
                delay: self.policy.reconnect_delay,
            }];
        }

        self.raise(
            Severity::Blocking,
            SessionFailure::ReconnectExhausted {
                attempts: self.reconnect_attempts,
            },
        );
        Vec::new()
    }

    /// Acts only if `connection` is the one whose close scheduled the pending retry.
    pub fn on_reconnect_timer(&mut self, connection: ConnectionId) -> Vec<Command> {
        if self.torn_down || self.pending_retry != Some(connection) {
            debug!(%connection, "stale reconnect timer ignored");
            return Vec::new();
        }
        self.pending_retry = None;

        let Some(endpoint) = self.endpoint.clone() else {
            return Vec::new();
        };
        info!(attempt = self.reconnect_attempts, "reconnecting");
        vec![self.open_connection(endpoint)]
    }

    /// Releases the session when its host goes away. Later events are no-ops.
    pub fn teardown(&mut self) -> Vec<Command> {
        self.torn_down = true;
        self.pending_retry = None;
        match self.active.take() {
            Some(connection) => {
                info!(%connection, "tearing down session");
                self.set_state(ConnectionState::Closed(CloseKind::Clean));
                vec![Command::Close { connection }]
            }
            None => Vec::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    pub fn active_connection(&self) -> Option<ConnectionId> {
        self.active
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn has_pending_retry(&self) -> bool {
        self.pending_retry.is_some()
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// Started, with neither a live connection nor a retry outstanding.
    pub fn is_settled(&self) -> bool {
        self.session_id.is_some() && self.active.is_none() && self.pending_retry.is_none()
    }

    pub fn download_target(&self) -> Option<&str> {
        self.download_target.as_deref()
    }

    pub fn alerts(&self) -> &[Alert] {
        &self.alerts
    }

    pub fn renderer(&self) -> &Renderer {
        &self.renderer
    }

    pub fn into_summary(self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id,
            state: self.state,
            download_target: self.download_target,
            alerts: self.alerts,
            renderer: self.renderer,
        }
    }

    fn is_active(&self, connection: ConnectionId) -> bool {
        !self.torn_down && self.active == Some(connection)
    }

    fn open_connection(&mut self, endpoint: Url) -> Command {
        let connection = self.last_connection.next();
        self.last_connection = connection;
        self.active = Some(connection);
        self.set_state(ConnectionState::Connecting);
        info!(%connection, %endpoint, "opening connection");
        Command::Connect {
            connection,
            endpoint,
        }
    }

    fn close_active(&mut self, connection: ConnectionId) -> Command {
        self.active = None;
        self.set_state(ConnectionState::Closed(CloseKind::Clean));
        Command::Close { connection }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            self.state = state;
            let _ = self.events.send(SessionEvent::StateChanged(state));
        }
    }

    fn raise(&mut self, severity: Severity, failure: SessionFailure) {
        match severity {
            Severity::Blocking => error!(%failure, "session failure"),
            Severity::NonBlocking => warn!(%failure, "session problem"),
        }
        let alert = Alert { severity, failure };
        self.alerts.push(alert.clone());
        let _ = self.events.send(SessionEvent::Alert(alert));
    }
}

/// What is left of a session once its driver stops.
pub struct SessionSummary {
    pub session_id: Option<SessionId>,
    pub state: ConnectionState,
    pub download_target: Option<String>,
    pub alerts: Vec<Alert>,
    pub renderer: Renderer,
}

impl SessionSummary {
    pub fn blocking_alerts(&self) -> impl Iterator<Item = &Alert> {
        self.alerts
            .iter()
            .filter(|alert| alert.severity == Severity::Blocking)
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
