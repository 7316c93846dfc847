use std::{path::PathBuf, sync::Arc};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use client_core::{
    endpoint::resolve_download_target, load_settings, spawn_session, SessionEvent, Severity,
    SystemClipboard, WsTransport,
};
use shared::{
    domain::{ApiKeyPolicy, TranscriptKind},
    protocol::FormSnapshot,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Run one research task against a research server and print the report")]
struct Args {
    /// What the research agent should investigate.
    #[arg(long)]
    task: String,
    #[arg(long, default_value = "research_report")]
    report_type: String,
    #[arg(long, default_value = "Auto Agent")]
    agent: String,
    #[arg(long, default_value = "en")]
    language: String,
    #[arg(long, env = "OPENAI_API_KEY", default_value = "", hide_env_values = true)]
    openai_api_key: String,
    /// Page the research UI is served from; the socket endpoint is derived from it.
    #[arg(long)]
    page_url: Option<String>,
    #[arg(long, default_value = client_core::config::DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    #[arg(long)]
    max_reconnect_attempts: Option<u32>,
    #[arg(long)]
    reconnect_delay_ms: Option<u64>,
    /// Refuse to start without an API key instead of only warning.
    #[arg(long)]
    require_api_key: bool,
    /// Write the rendered HTML report here once the session ends.
    #[arg(long)]
    report_out: Option<PathBuf>,
    /// Copy the plain-text report to the system clipboard.
    #[arg(long)]
    copy: bool,
}

impl Args {
    fn form(&self) -> FormSnapshot {
        FormSnapshot {
            task: self.task.clone(),
            report_type: self.report_type.clone(),
            agent: self.agent.clone(),
            language: self.language.clone(),
            openai_api_key: self.openai_api_key.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut settings = load_settings(&args.config);
    if let Some(page_url) = &args.page_url {
        settings.page_url = page_url.clone();
    }
    if let Some(attempts) = args.max_reconnect_attempts {
        settings.max_reconnect_attempts = attempts;
    }
    if let Some(delay) = args.reconnect_delay_ms {
        settings.reconnect_delay_ms = delay;
    }
    if args.require_api_key {
        settings.api_key_policy = ApiKeyPolicy::Require;
    }
    debug!(?settings, "resolved settings");

    let (handle, driver) = spawn_session(WsTransport, &settings);
    let mut events = handle.subscribe_events();
    handle.start(Arc::new(args.form())).await?;

    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SessionEvent::Settled { state }) => {
                    debug!(?state, "session settled");
                    break;
                }
                Ok(event) => print_event(&event, &settings.page_url),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "missed session events"),
                Err(RecvError::Closed) => break,
            },
            _ = &mut interrupt => {
                info!("interrupted, closing session");
                break;
            }
        }
    }

    handle.teardown().await?;
    let summary = driver.await.context("session driver panicked")??;

    let report = summary.renderer.report_plain_text();
    if !report.is_empty() {
        println!("\n{report}");
    }
    if let Some(path) = &args.report_out {
        tokio::fs::write(path, summary.renderer.report_html())
            .await
            .with_context(|| format!("failed to write report to '{}'", path.display()))?;
        info!(path = %path.display(), "report written");
    }
    if args.copy {
        match summary
            .renderer
            .copy_report_to_clipboard(&mut SystemClipboard)
        {
            Ok(()) => info!("report copied to clipboard"),
            Err(err) => warn!(%err, "could not copy report"),
        }
    }

    let failures: Vec<String> = summary
        .blocking_alerts()
        .map(|alert| alert.failure.to_string())
        .collect();
    if failures.is_empty() {
        Ok(())
    } else {
        Err(anyhow!("research session failed: {}", failures.join("; ")))
    }
}

fn print_event(event: &SessionEvent, page_url: &str) {
    match event {
        SessionEvent::TranscriptAppended(entry) => match entry.kind {
            TranscriptKind::AgentResponse => println!("{}", entry.plain_text()),
            TranscriptKind::ServerError => eprintln!("server error: {}", entry.plain_text()),
        },
        SessionEvent::DownloadTargetChanged(target) => {
            match resolve_download_target(page_url, target) {
                Some(url) => println!("report download: {url}"),
                None => println!("report download: {target}"),
            }
        }
        SessionEvent::Alert(alert) => match alert.severity {
            Severity::Blocking => eprintln!("error: {}", alert.failure),
            Severity::NonBlocking => warn!(failure = %alert.failure, "session warning"),
        },
        SessionEvent::StateChanged(state) => debug!(?state, "connection state"),
        SessionEvent::Started { session_id } => info!(%session_id, "research session started"),
        SessionEvent::ReportAppended { .. }
        | SessionEvent::ScrolledToBottom
        | SessionEvent::Settled { .. } => {}
    }
}
