//! Client side of a streamed research session.
//!
//! [`session::ResearchSession`] is the protocol state machine,
//! [`driver::SessionDriver`] runs it against a [`transport::Transport`], and
//! [`renderer::Renderer`] owns the transcript and report it produces.

pub mod config;
pub mod driver;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod renderer;
pub mod session;
pub mod transport;

pub use config::{load_settings, Settings};
pub use driver::{spawn_session, SessionControl, SessionDriver, SessionHandle};
pub use error::{Alert, SessionFailure, Severity};
pub use events::SessionEvent;
pub use renderer::{ClipboardSink, Renderer, SystemClipboard, TranscriptEntry};
pub use session::{
    CloseKind, Command, ConnectionState, FormDataProvider, ResearchSession, SessionPolicy,
    SessionSummary,
};
pub use transport::{Transport, TransportConnection, TransportEvent, WsTransport};
