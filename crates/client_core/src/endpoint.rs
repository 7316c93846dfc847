use url::{Position, Url};

use crate::error::EndpointError;

/// Path suffix the research backend serves its socket on.
pub const SOCKET_PATH_SUFFIX: &str = "ws";

/// Derives the socket endpoint from the page the client was loaded from:
/// the scheme is upgraded, host and path are kept and `ws` is appended.
pub fn endpoint_for_page(page_url: &str) -> Result<Url, EndpointError> {
    let page = Url::parse(page_url.trim()).map_err(|source| EndpointError::InvalidPageUrl {
        url: page_url.to_string(),
        source,
    })?;

    let scheme = match page.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => return Err(EndpointError::UnsupportedScheme(other.to_string())),
    };
    if page.host_str().is_none() {
        return Err(EndpointError::MissingHost(page_url.to_string()));
    }

    let host_and_path = &page[Position::BeforeHost..Position::AfterPath];
    let raw = format!("{scheme}://{host_and_path}{SOCKET_PATH_SUFFIX}");
    Url::parse(&raw).map_err(|source| EndpointError::InvalidPageUrl { url: raw, source })
}

/// Resolves a `path` message target against the page so it can be opened directly.
pub fn resolve_download_target(page_url: &str, target: &str) -> Option<Url> {
    Url::parse(page_url.trim()).ok()?.join(target).ok()
}
