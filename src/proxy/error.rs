//! Per-request error taxonomy for the proxy engine.
//!
//! Every variant is terminal for the request that produced it. Variants that
//! map to a status code are answered with a short plain-text body; the rest
//! only close the client connection.

use http::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// Missing or wrong `Proxy-Authorization` header.
    #[error("proxy authentication required")]
    AuthRequired,

    /// CONNECT destination could not be dialed through the tunnel.
    #[error("failed to dial {target}: {source}")]
    DialFailed {
        target: String,
        #[source]
        source: std::io::Error,
    },

    /// The response sink cannot hand out a raw byte stream.
    #[error("response writer does not support hijacking")]
    HijackUnsupported,

    /// The response sink supports hijacking but taking the stream failed.
    #[error("hijacking client connection failed: {0}")]
    HijackFailed(#[source] std::io::Error),

    /// The request cannot be turned into an outbound request.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// Dialing or talking to the upstream of a plain HTTP request failed.
    #[error("failed to reach {target}: {source}")]
    UpstreamUnreachable {
        target: String,
        #[source]
        source: std::io::Error,
    },

    /// The client went away before the request could complete.
    #[error("client closed the connection")]
    ClientClosed,

    /// Client-side I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ProxyResult<T> = Result<T, ProxyError>;

impl ProxyError {
    /// Status code to answer with, or `None` when nothing should be written.
    #[must_use]
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ProxyError::AuthRequired => Some(StatusCode::PROXY_AUTHENTICATION_REQUIRED),
            ProxyError::DialFailed { .. } | ProxyError::UpstreamUnreachable { .. } => {
                Some(StatusCode::SERVICE_UNAVAILABLE)
            }
            ProxyError::HijackUnsupported | ProxyError::HijackFailed(_) => {
                Some(StatusCode::INTERNAL_SERVER_ERROR)
            }
            ProxyError::MalformedRequest(_) => Some(StatusCode::BAD_REQUEST),
            ProxyError::ClientClosed | ProxyError::Io(_) => None,
        }
    }

    /// Body text sent to the client. Never includes upstream details.
    #[must_use]
    pub fn public_message(&self) -> &'static str {
        match self {
            ProxyError::AuthRequired => "Proxy authentication required",
            ProxyError::DialFailed { .. } => "Unable to connect to destination",
            ProxyError::HijackUnsupported => "Hijacking not supported",
            ProxyError::HijackFailed(_) => "Hijacking failed",
            ProxyError::MalformedRequest(_) => "Invalid request",
            ProxyError::UpstreamUnreachable { .. } => "Failed to reach destination",
            ProxyError::ClientClosed | ProxyError::Io(_) => "",
        }
    }
}
