//! Event loop that executes session commands against a transport.

use std::{collections::VecDeque, future::Future, pin::Pin, sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use shared::domain::ConnectionId;
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
    time::{sleep_until, timeout, Instant},
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    config::Settings,
    error::TransportError,
    events::SessionEvent,
    session::{Command, FormDataProvider, ResearchSession, SessionPolicy, SessionSummary},
    transport::{Transport, TransportConnection, TransportEvent},
};

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const CONTROL_CHANNEL_CAPACITY: usize = 16;

pub enum SessionControl {
    Start(Arc<dyn FormDataProvider>),
    Teardown,
}

/// Controller-side handle. Dropping every handle tears the session down.
#[derive(Clone)]
pub struct SessionHandle {
    controls: mpsc::Sender<SessionControl>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionHandle {
    pub async fn start(&self, form: Arc<dyn FormDataProvider>) -> Result<()> {
        self.controls
            .send(SessionControl::Start(form))
            .await
            .map_err(|_| anyhow!("session driver has stopped"))
    }

    pub async fn teardown(&self) -> Result<()> {
        self.controls
            .send(SessionControl::Teardown)
            .await
            .map_err(|_| anyhow!("session driver has stopped"))
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

pub fn spawn_session<T>(
    transport: T,
    settings: &Settings,
) -> (SessionHandle, JoinHandle<Result<SessionSummary>>)
where
    T: Transport + 'static,
{
    let (handle, driver) = SessionDriver::new(
        transport,
        settings.session_policy(),
        settings.connect_timeout(),
    );
    (handle, tokio::spawn(driver.run()))
}

struct ActiveConnection<C> {
    id: ConnectionId,
    connection: C,
}

type ConnectFuture<C> = Pin<Box<dyn Future<Output = Result<C, TransportError>> + Send>>;

/// A connect in flight. Dropping it abandons the attempt.
struct PendingConnect<C> {
    id: ConnectionId,
    endpoint: Url,
    future: ConnectFuture<C>,
}

struct PendingRetry {
    connection: ConnectionId,
    due: Instant,
}

pub struct SessionDriver<T: Transport + 'static> {
    session: ResearchSession,
    transport: Arc<T>,
    connect_timeout: Duration,
    controls: mpsc::Receiver<SessionControl>,
    events: broadcast::Sender<SessionEvent>,
    connecting: Option<PendingConnect<T::Connection>>,
    active: Option<ActiveConnection<T::Connection>>,
    retry: Option<PendingRetry>,
    settled: bool,
}

impl<T: Transport + 'static> SessionDriver<T> {
    pub fn new(
        transport: T,
        policy: SessionPolicy,
        connect_timeout: Duration,
    ) -> (SessionHandle, Self) {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (controls_tx, controls) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
        let driver = Self {
            session: ResearchSession::new(policy, events.clone()),
            transport: Arc::new(transport),
            connect_timeout,
            controls,
            events: events.clone(),
            connecting: None,
            active: None,
            retry: None,
            settled: false,
        };
        let handle = SessionHandle {
            controls: controls_tx,
            events,
        };
        (handle, driver)
    }

    /// Runs until torn down or until every handle is dropped.
    pub async fn run(mut self) -> Result<SessionSummary> {
        loop {
            let retry_due = self.retry.as_ref().map(|retry| retry.due);

            tokio::select! {
                control = self.controls.recv() => match control {
                    Some(SessionControl::Start(form)) => {
                        let commands = self.session.start(form);
                        self.settled = false;
                        self.execute(commands).await;
                    }
                    Some(SessionControl::Teardown) | None => {
                        let commands = self.session.teardown();
                        self.retry = None;
                        self.connecting = None;
                        self.execute(commands).await;
                        break;
                    }
                },
                (connection, outcome) = connect_outcome(&mut self.connecting) => {
                    self.connecting = None;
                    self.handle_connect_outcome(connection, outcome).await;
                }
                (connection, event) = next_event(&mut self.active) => {
                    self.handle_transport_event(connection, event).await;
                }
                _ = sleep_until(retry_due.unwrap_or_else(Instant::now)), if retry_due.is_some() => {
                    if let Some(retry) = self.retry.take() {
                        let commands = self.session.on_reconnect_timer(retry.connection);
                        self.execute(commands).await;
                    }
                }
            }

            self.publish_settled();
        }

        self.publish_settled();
        info!(session_id = ?self.session.session_id(), "session driver stopped");
        Ok(self.session.into_summary())
    }

    async fn handle_transport_event(&mut self, connection: ConnectionId, event: TransportEvent) {
        match event {
            TransportEvent::Text(raw) => self.session.on_message(connection, &raw),
            TransportEvent::Error(err) => self.session.on_transport_error(connection, &err),
            TransportEvent::Closed { was_clean } => {
                if self.active.as_ref().map(|active| active.id) == Some(connection) {
                    self.active = None;
                }
                let commands = self.session.on_close(connection, was_clean);
                self.execute(commands).await;
            }
        }
    }

    async fn execute(&mut self, commands: Vec<Command>) {
        let mut queue: VecDeque<Command> = commands.into();

        while let Some(command) = queue.pop_front() {
            match command {
                Command::Connect {
                    connection,
                    endpoint,
                } => {
                    self.drop_active().await;
                    self.begin_connect(connection, endpoint);
                }
                Command::Send { connection, frame } => {
                    let Some(active) = self.active.as_mut().filter(|active| active.id == connection)
                    else {
                        debug!(%connection, "send skipped for inactive connection");
                        continue;
                    };
                    let sent = active.connection.send_text(frame).await;
                    if let Err(err) = sent {
                        warn!(%connection, %err, "send failed");
                        self.active = None;
                        self.session
                            .on_transport_error(connection, &err.to_string());
                        queue.extend(self.session.on_close(connection, false));
                    }
                }
                Command::Close { connection } => {
                    if self.connecting.as_ref().map(|pending| pending.id) == Some(connection) {
                        debug!(%connection, "abandoning connect in flight");
                        self.connecting = None;
                    }
                    if self.active.as_ref().map(|active| active.id) == Some(connection) {
                        self.drop_active().await;
                    }
                }
                Command::ScheduleReconnect { connection, delay } => {
                    self.retry = Some(PendingRetry {
                        connection,
                        due: Instant::now() + delay,
                    });
                }
            }
        }
    }

    fn begin_connect(&mut self, connection: ConnectionId, endpoint: Url) {
        let transport = Arc::clone(&self.transport);
        let connect_timeout = self.connect_timeout;
        let target = endpoint.clone();
        let future: ConnectFuture<T::Connection> = Box::pin(async move {
            timeout(connect_timeout, transport.connect(&target))
                .await
                .unwrap_or(Err(TransportError::TimedOut(connect_timeout)))
        });
        if let Some(previous) = self.connecting.replace(PendingConnect {
            id: connection,
            endpoint,
            future,
        }) {
            debug!(connection = %previous.id, "superseded connect in flight");
        }
    }

    async fn handle_connect_outcome(
        &mut self,
        connection: ConnectionId,
        outcome: (Url, Result<T::Connection, TransportError>),
    ) {
        let (endpoint, result) = outcome;
        match result {
            Ok(established) => {
                self.active = Some(ActiveConnection {
                    id: connection,
                    connection: established,
                });
                let commands = self.session.on_open(connection);
                self.execute(commands).await;
            }
            Err(err) => {
                warn!(%connection, %endpoint, %err, "connect failed");
                self.session
                    .on_transport_error(connection, &err.to_string());
                let commands = self.session.on_close(connection, false);
                self.execute(commands).await;
            }
        }
    }

    async fn drop_active(&mut self) {
        if let Some(mut active) = self.active.take() {
            debug!(connection = %active.id, "closing connection");
            active.connection.close().await;
        }
    }

    fn publish_settled(&mut self) {
        let settled = self.session.is_settled();
        if settled && !self.settled {
            let _ = self.events.send(SessionEvent::Settled {
                state: self.session.state(),
            });
        }
        self.settled = settled;
    }
}

async fn connect_outcome<C>(
    connecting: &mut Option<PendingConnect<C>>,
) -> (ConnectionId, (Url, Result<C, TransportError>)) {
    match connecting {
        Some(pending) => {
            let result = (&mut pending.future).await;
            (pending.id, (pending.endpoint.clone(), result))
        }
        None => std::future::pending().await,
    }
}

async fn next_event<C: TransportConnection>(
    active: &mut Option<ActiveConnection<C>>,
) -> (ConnectionId, TransportEvent) {
    match active {
        Some(active) => (active.id, active.connection.next_event().await),
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[path = "tests/driver_tests.rs"]
mod tests;
