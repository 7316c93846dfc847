use shared::domain::SessionId;

use crate::{error::Alert, renderer::TranscriptEntry, session::ConnectionState};

/// Progress broadcast to whatever front end is rendering the session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Started { session_id: SessionId },
    StateChanged(ConnectionState),
    TranscriptAppended(TranscriptEntry),
    ReportAppended { html: String },
    DownloadTargetChanged(String),
    ScrolledToBottom,
    Alert(Alert),
    /// Terminal state reached with no reconnect pending.
    Settled { state: ConnectionState },
}
