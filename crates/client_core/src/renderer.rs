//! Output buffers of a session: the transcript of progress entries and the
//! incrementally built HTML report.

use chrono::{DateTime, Utc};
use shared::domain::TranscriptKind;
use tokio::sync::broadcast;

use crate::{error::ClipboardError, events::SessionEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEntry {
    pub kind: TranscriptKind,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

impl TranscriptEntry {
    /// Server log lines carry inline markup such as `<br>`, so the text is
    /// embedded as-is.
    pub fn to_html(&self) -> String {
        format!("<div class=\"{}\">{}</div>", self.kind.css_class(), self.text)
    }

    pub fn plain_text(&self) -> String {
        html_to_plain_text(&self.text)
    }
}

pub trait ClipboardSink {
    fn set_text(&mut self, text: String) -> Result<(), ClipboardError>;
}

/// System clipboard backed by `arboard`.
pub struct SystemClipboard;

impl ClipboardSink for SystemClipboard {
    fn set_text(&mut self, text: String) -> Result<(), ClipboardError> {
        let mut clipboard =
            arboard::Clipboard::new().map_err(|err| ClipboardError::Unavailable(err.to_string()))?;
        clipboard
            .set_text(text)
            .map_err(|err| ClipboardError::Write(err.to_string()))
    }
}

pub struct Renderer {
    transcript: Vec<TranscriptEntry>,
    report: Vec<String>,
    events: broadcast::Sender<SessionEvent>,
}

impl Renderer {
    pub fn new(events: broadcast::Sender<SessionEvent>) -> Self {
        Self {
            transcript: Vec::new(),
            report: Vec::new(),
            events,
        }
    }

    pub fn clear(&mut self) {
        self.transcript.clear();
        self.report.clear();
    }

    pub fn append_log(&mut self, text: &str) {
        self.push_entry(TranscriptKind::AgentResponse, text);
    }

    pub fn append_error(&mut self, text: &str) {
        self.push_entry(TranscriptKind::ServerError, text);
    }

    pub fn append_report_markdown(&mut self, fragment: &str) {
        let html = markdown::to_html(fragment);
        self.report.push(html.clone());
        let _ = self.events.send(SessionEvent::ReportAppended { html });
        self.scroll_to_bottom();
    }

    pub fn transcript(&self) -> &[TranscriptEntry] {
        &self.transcript
    }

    pub fn transcript_html(&self) -> String {
        self.transcript.iter().map(TranscriptEntry::to_html).collect()
    }

    pub fn report_fragments(&self) -> &[String] {
        &self.report
    }

    pub fn report_html(&self) -> String {
        self.report.concat()
    }

    pub fn report_plain_text(&self) -> String {
        html_to_plain_text(&self.report_html())
    }

    pub fn copy_report_to_clipboard(
        &self,
        clipboard: &mut dyn ClipboardSink,
    ) -> Result<(), ClipboardError> {
        clipboard.set_text(self.report_plain_text())
    }

    fn push_entry(&mut self, kind: TranscriptKind, text: &str) {
        let entry = TranscriptEntry {
            kind,
            text: text.to_string(),
            received_at: Utc::now(),
        };
        self.transcript.push(entry.clone());
        let _ = self.events.send(SessionEvent::TranscriptAppended(entry));
        self.scroll_to_bottom();
    }

    fn scroll_to_bottom(&self) {
        let _ = self.events.send(SessionEvent::ScrolledToBottom);
    }
}

const BLOCK_TAGS: &[&str] = &[
    "p", "div", "h1", "h2", "h3", "h4", "h5", "h6", "li", "ul", "ol", "pre", "blockquote", "tr",
    "table",
];

/// Approximates the text a browser shows for a fragment of HTML.
pub fn html_to_plain_text(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut chars = html.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '<' if !chars
                .peek()
                .is_some_and(|next| next.is_ascii_alphabetic() || matches!(*next, '/' | '!')) =>
            {
                out.push('<');
            }
            '<' => {
                let mut tag = String::new();
                for next in chars.by_ref() {
                    if next == '>' {
                        break;
                    }
                    tag.push(next);
                }
                let closing = tag.starts_with('/');
                let name = tag
                    .trim_start_matches('/')
                    .split(|c: char| c.is_whitespace() || c == '/')
                    .next()
                    .unwrap_or_default()
                    .to_ascii_lowercase();
                if name == "br" || (closing && BLOCK_TAGS.contains(&name.as_str())) {
                    out.push('\n');
                }
            }
            '&' => {
                let mut entity = String::new();
                while let Some(&next) = chars.peek() {
                    if next == ';' || entity.len() > 8 {
                        break;
                    }
                    entity.push(next);
                    chars.next();
                }
                match (chars.peek(), decode_entity(&entity)) {
                    (Some(';'), Some(decoded)) => {
                        chars.next();
                        out.push(decoded);
                    }
                    _ => {
                        out.push('&');
                        out.push_str(&entity);
                    }
                }
            }
            _ => out.push(ch),
        }
    }

    out.trim_end().to_string()
}

fn decode_entity(entity: &str) -> Option<char> {
    match entity {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some(' '),
        _ => {
            let code = entity.strip_prefix('#')?;
            let value = match code.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => code.parse().ok()?,
            };
            char::from_u32(value)
        }
    }
}

#[cfg(test)]
#[path = "tests/renderer_tests.rs"]
mod tests;
