use super::*;

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Mutex,
};

use async_trait::async_trait;
use shared::protocol::FormSnapshot;
use url::Url;

use crate::{
    error::{SessionFailure, Severity},
    session::{CloseKind, ConnectionState, THINKING_MESSAGE},
};

const START_FRAME: &str =
    r#"start {"task":"T","report_type":"R","agent":"A","language":"en","openai_api_key":"K"}"#;

enum Script {
    Refuse,
    /// Connect never completes.
    Hang,
    Serve(Vec<TransportEvent>),
}

#[derive(Clone, Default)]
struct ScriptLog {
    connects: Arc<Mutex<Vec<Url>>>,
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicUsize>,
}

struct ScriptedTransport {
    scripts: Mutex<VecDeque<Script>>,
    log: ScriptLog,
}

impl ScriptedTransport {
    fn new(scripts: Vec<Script>) -> (Self, ScriptLog) {
        let log = ScriptLog::default();
        let transport = Self {
            scripts: Mutex::new(scripts.into()),
            log: log.clone(),
        };
        (transport, log)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    type Connection = ScriptedConnection;

    async fn connect(&self, endpoint: &Url) -> Result<ScriptedConnection, TransportError> {
        self.log
            .connects
            .lock()
            .expect("connects lock")
            .push(endpoint.clone());
        let script = self.scripts.lock().expect("scripts lock").pop_front();
        match script {
            Some(Script::Serve(events)) => Ok(ScriptedConnection {
                events: events.into(),
                log: self.log.clone(),
            }),
            Some(Script::Hang) => std::future::pending().await,
            Some(Script::Refuse) | None => {
                Err(TransportError::Other("connection refused".to_string()))
            }
        }
    }
}

struct ScriptedConnection {
    events: VecDeque<TransportEvent>,
    log: ScriptLog,
}

#[async_trait]
impl TransportConnection for ScriptedConnection {
    async fn send_text(&mut self, frame: String) -> Result<(), TransportError> {
        self.log.sent.lock().expect("sent lock").push(frame);
        Ok(())
    }

    async fn next_event(&mut self) -> TransportEvent {
        match self.events.pop_front() {
            Some(event) => event,
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) {
        self.log.closed.fetch_add(1, Ordering::SeqCst);
    }
}

fn form() -> Arc<dyn FormDataProvider> {
    Arc::new(FormSnapshot {
        task: "T".to_string(),
        report_type: "R".to_string(),
        agent: "A".to_string(),
        language: "en".to_string(),
        openai_api_key: "K".to_string(),
    })
}

fn settings(reconnect_delay_ms: u64) -> Settings {
    Settings {
        page_url: "http://localhost:8000/".to_string(),
        reconnect_delay_ms,
        connect_timeout_ms: 1_000,
        ..Settings::default()
    }
}

fn slow_connect_settings() -> Settings {
    Settings {
        connect_timeout_ms: 60_000,
        ..settings(2_000)
    }
}

fn text(raw: &str) -> TransportEvent {
    TransportEvent::Text(raw.to_string())
}

async fn wait_for(
    events: &mut broadcast::Receiver<SessionEvent>,
    mut predicate: impl FnMut(&SessionEvent) -> bool,
) -> SessionEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for session event")
}

fn transcript_texts(summary: &SessionSummary) -> Vec<String> {
    summary
        .renderer
        .transcript()
        .iter()
        .map(|entry| entry.text.clone())
        .collect()
}

#[tokio::test]
async fn streams_report_and_settles_after_clean_close() {
    let (transport, log) = ScriptedTransport::new(vec![Script::Serve(vec![
        text(r#"{"type":"logs","output":"step1"}"#),
        text(r##"{"type":"report","output":"# Title"}"##),
        text(r#"{"type":"report","output":"\nBody"}"#),
        text(r#"{"type":"path","output":"/dl/1"}"#),
        TransportEvent::Closed { was_clean: true },
    ])]);
    let (handle, driver) = spawn_session(transport, &settings(2_000));
    let mut events = handle.subscribe_events();

    handle.start(form()).await.expect("start");
    let settled = wait_for(&mut events, |event| {
        matches!(event, SessionEvent::Settled { .. })
    })
    .await;
    assert!(matches!(
        settled,
        SessionEvent::Settled {
            state: ConnectionState::Closed(CloseKind::Clean)
        }
    ));
    drop(handle);

    let summary = driver.await.expect("join").expect("summary");
    assert_eq!(
        transcript_texts(&summary),
        vec![THINKING_MESSAGE.to_string(), "step1".to_string()]
    );
    assert_eq!(
        summary.renderer.report_html(),
        format!("{}{}", markdown::to_html("# Title"), markdown::to_html("\nBody"))
    );
    assert_eq!(summary.download_target.as_deref(), Some("/dl/1"));
    assert_eq!(*log.sent.lock().expect("sent"), vec![START_FRAME.to_string()]);
    assert_eq!(
        log.connects.lock().expect("connects").as_slice(),
        &[Url::parse("ws://localhost:8000/ws").expect("url")]
    );
}

#[tokio::test]
async fn reconnects_after_unclean_close_and_resends_start_command() {
    let (transport, log) = ScriptedTransport::new(vec![
        Script::Serve(vec![TransportEvent::Closed { was_clean: false }]),
        Script::Serve(vec![
            text(r#"{"type":"logs","output":"after reconnect"}"#),
            TransportEvent::Closed { was_clean: true },
        ]),
    ]);
    let (handle, driver) = spawn_session(transport, &settings(5));
    let mut events = handle.subscribe_events();

    handle.start(form()).await.expect("start");
    wait_for(&mut events, |event| {
        matches!(event, SessionEvent::Settled { .. })
    })
    .await;
    drop(handle);

    let summary = driver.await.expect("join").expect("summary");
    assert_eq!(summary.state, ConnectionState::Closed(CloseKind::Clean));
    assert!(transcript_texts(&summary).contains(&"after reconnect".to_string()));
    assert_eq!(log.connects.lock().expect("connects").len(), 2);
    assert_eq!(
        *log.sent.lock().expect("sent"),
        vec![START_FRAME.to_string(), START_FRAME.to_string()]
    );
    assert!(summary.alerts.is_empty());
}

#[tokio::test]
async fn gives_up_after_five_reconnect_attempts() {
    let (transport, log) = ScriptedTransport::new(Vec::new());
    let (handle, driver) = spawn_session(transport, &settings(1));
    let mut events = handle.subscribe_events();

    handle.start(form()).await.expect("start");
    wait_for(&mut events, |event| {
        matches!(event, SessionEvent::Settled { .. })
    })
    .await;
    drop(handle);

    let summary = driver.await.expect("join").expect("summary");
    assert_eq!(summary.state, ConnectionState::Closed(CloseKind::Unclean));
    assert_eq!(log.connects.lock().expect("connects").len(), 6);

    let blocking: Vec<_> = summary.blocking_alerts().collect();
    assert_eq!(blocking.len(), 1);
    assert_eq!(
        blocking[0].failure,
        SessionFailure::ReconnectExhausted { attempts: 5 }
    );
    assert!(summary
        .alerts
        .iter()
        .filter(|alert| alert.severity == Severity::NonBlocking)
        .all(|alert| matches!(alert.failure, SessionFailure::Transport(_))));
}

#[tokio::test]
async fn teardown_cancels_pending_reconnect() {
    let (transport, log) = ScriptedTransport::new(vec![Script::Serve(vec![
        TransportEvent::Closed { was_clean: false },
    ])]);
    let (handle, driver) = spawn_session(transport, &settings(60_000));
    let mut events = handle.subscribe_events();

    handle.start(form()).await.expect("start");
    wait_for(&mut events, |event| {
        matches!(
            event,
            SessionEvent::StateChanged(ConnectionState::Closed(CloseKind::Unclean))
        )
    })
    .await;
    handle.teardown().await.expect("teardown");

    let summary = timeout(Duration::from_secs(1), driver)
        .await
        .expect("driver stops without waiting for the retry")
        .expect("join")
        .expect("summary");
    assert_eq!(log.connects.lock().expect("connects").len(), 1);
    assert_eq!(summary.state, ConnectionState::Closed(CloseKind::Unclean));
}

#[tokio::test]
async fn dropping_the_handle_closes_the_open_connection() {
    let (transport, log) = ScriptedTransport::new(vec![Script::Serve(vec![text(
        r#"{"type":"logs","output":"step1"}"#,
    )])]);
    let (handle, driver) = spawn_session(transport, &settings(2_000));
    let mut events = handle.subscribe_events();

    handle.start(form()).await.expect("start");
    wait_for(&mut events, |event| {
        matches!(event, SessionEvent::TranscriptAppended(entry) if entry.text == "step1")
    })
    .await;
    drop(handle);

    let summary = driver.await.expect("join").expect("summary");
    assert_eq!(summary.state, ConnectionState::Closed(CloseKind::Clean));
    assert_eq!(log.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn restart_supersedes_previous_connection_without_leaking_output() {
    let (transport, log) = ScriptedTransport::new(vec![
        Script::Serve(vec![text(r#"{"type":"logs","output":"first"}"#)]),
        Script::Serve(vec![
            text(r#"{"type":"logs","output":"second"}"#),
            TransportEvent::Closed { was_clean: true },
        ]),
    ]);
    let (handle, driver) = spawn_session(transport, &settings(2_000));
    let mut events = handle.subscribe_events();

    handle.start(form()).await.expect("first start");
    wait_for(&mut events, |event| {
        matches!(event, SessionEvent::TranscriptAppended(entry) if entry.text == "first")
    })
    .await;
    handle.start(form()).await.expect("second start");
    wait_for(&mut events, |event| {
        matches!(event, SessionEvent::Settled { .. })
    })
    .await;
    drop(handle);

    let summary = driver.await.expect("join").expect("summary");
    assert_eq!(
        transcript_texts(&summary),
        vec![THINKING_MESSAGE.to_string(), "second".to_string()]
    );
    assert_eq!(log.closed.load(Ordering::SeqCst), 1);
    assert_eq!(log.sent.lock().expect("sent").len(), 2);
}

#[tokio::test]
async fn teardown_abandons_connect_in_flight() {
    let (transport, log) = ScriptedTransport::new(vec![Script::Hang]);
    let (handle, driver) = spawn_session(transport, &slow_connect_settings());
    let mut events = handle.subscribe_events();

    handle.start(form()).await.expect("start");
    wait_for(&mut events, |event| {
        matches!(event, SessionEvent::StateChanged(ConnectionState::Connecting))
    })
    .await;
    handle.teardown().await.expect("teardown");

    let summary = timeout(Duration::from_secs(1), driver)
        .await
        .expect("driver stops without waiting for the connect timeout")
        .expect("join")
        .expect("summary");
    assert_eq!(log.connects.lock().expect("connects").len(), 1);
    assert!(log.sent.lock().expect("sent").is_empty());
    assert_eq!(summary.state, ConnectionState::Closed(CloseKind::Clean));
    assert!(summary.alerts.is_empty());
}

#[tokio::test]
async fn restart_supersedes_connect_in_flight() {
    let (transport, log) = ScriptedTransport::new(vec![
        Script::Hang,
        Script::Serve(vec![
            text(r#"{"type":"logs","output":"second"}"#),
            TransportEvent::Closed { was_clean: true },
        ]),
    ]);
    let (handle, driver) = spawn_session(transport, &slow_connect_settings());
    let mut events = handle.subscribe_events();

    handle.start(form()).await.expect("first start");
    wait_for(&mut events, |event| {
        matches!(event, SessionEvent::StateChanged(ConnectionState::Connecting))
    })
    .await;
    handle.start(form()).await.expect("second start");
    wait_for(&mut events, |event| {
        matches!(event, SessionEvent::Settled { .. })
    })
    .await;
    drop(handle);

    let summary = driver.await.expect("join").expect("summary");
    assert_eq!(summary.state, ConnectionState::Closed(CloseKind::Clean));
    assert_eq!(
        transcript_texts(&summary),
        vec![THINKING_MESSAGE.to_string(), "second".to_string()]
    );
    assert_eq!(log.connects.lock().expect("connects").len(), 2);
    assert_eq!(*log.sent.lock().expect("sent"), vec![START_FRAME.to_string()]);
    assert_eq!(log.closed.load(Ordering::SeqCst), 0);
}
