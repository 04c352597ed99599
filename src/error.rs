//! Error types for the gateway.
//!
//! Semantic error kinds map one-to-one onto HTTP statuses at the gateway
//! front-end. Handler errors additionally carry a generated short id and a
//! `file:line` origin so a failure reported to a client can be correlated
//! with the matching log line.

use std::fmt;

use thiserror::Error;

/// Semantic errors raised by the routing, persistence, and admin layers.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed admin payload; the message is the decoder error.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The request path matched no registered route pattern.
    #[error("no route for {0}")]
    NotFound(String),

    /// The matched group has no available host.
    #[error("no available host for {0}")]
    NoHealthyUpstream(String),

    /// The relay to the chosen host failed before the response committed.
    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    /// A host with this name is already registered in the group.
    #[error("duplicate host name {0}")]
    DuplicateHost(String),

    /// Embedded store failure.
    #[error("store: {0}")]
    Store(String),

    /// Unrecoverable startup problem.
    #[error("config: {0}")]
    Config(String),
}

impl GatewayError {
    /// The HTTP status this error renders as at the front-end.
    pub fn status(&self) -> u16 {
        match self {
            GatewayError::BadRequest(_) => 400,
            GatewayError::NotFound(_) => 404,
            GatewayError::NoHealthyUpstream(_) => 503,
            GatewayError::UpstreamUnreachable(_) => 502,
            GatewayError::DuplicateHost(_) => 409,
            GatewayError::Store(_) | GatewayError::Config(_) => 500,
        }
    }
}

impl From<rocksdb::Error> for GatewayError {
    fn from(err: rocksdb::Error) -> Self {
        GatewayError::Store(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::BadRequest(err.to_string())
    }
}

/// Number of characters in a generated error id.
const ID_LEN: usize = 9;

/// Id alphabet; lowercase only, confusable glyphs (l, o, 1) removed.
const ID_DICT: &[u8] = b"abcdefghijkmnpqrstuvwxyz023456789";

/// Returns a short random identifier for tagging handler errors in logs.
pub fn error_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..ID_LEN)
        .map(|_| ID_DICT[rng.gen_range(0..ID_DICT.len())] as char)
        .collect()
}

/// An error from within a request handler, ready to be rendered as an HTTP
/// response and logged with a correlatable id.
#[derive(Debug)]
pub struct HandlerError {
    /// Generated; for identifying this error in logs.
    pub id: String,
    /// The HTTP status code to associate with this error.
    pub status: u16,
    /// `file:line` of the point of origin.
    pub trace: String,
    /// The underlying cause.
    pub cause: GatewayError,
}

impl HandlerError {
    /// Wraps `cause` with a generated id and the caller's location, keeping
    /// the status the cause maps to.
    #[track_caller]
    pub fn new(cause: GatewayError) -> Self {
        Self::with_status(cause.status(), cause)
    }

    /// Wraps `cause` under an explicit status code.
    #[track_caller]
    pub fn with_status(status: u16, cause: GatewayError) -> Self {
        let loc = std::panic::Location::caller();
        Self {
            id: error_id(),
            status,
            trace: format!("{}:{}", loc.file(), loc.line()),
            cause,
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{id={}}} {}: HTTP {}: {}",
            self.id, self.trace, self.status, self.cause
        )
    }
}

impl std::error::Error for HandlerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.cause)
    }
}

impl From<GatewayError> for HandlerError {
    #[track_caller]
    fn from(cause: GatewayError) -> Self {
        HandlerError::new(cause)
    }
}
