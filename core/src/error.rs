use std::io;

use thiserror::Error;

use conduit_protocol::ErrorObject;
use conduit_protocol::error_code;

pub type Result<T> = std::result::Result<T, ConduitErr>;

/// Error taxonomy for the substrate. Every variant maps onto one of the
/// stable wire codes; the mapping is part of the external contract.
#[derive(Error, Debug)]
pub enum ConduitErr {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Rate limit exceeded")]
    RateLimited,

    /// Backend-local saturation (e.g. the subprocess pool is full).
    #[error("Server busy: {0}")]
    ServerBusy(String),

    /// Concurrency-gate queue overflow. Distinct from [`ConduitErr::ServerBusy`]
    /// so call sites can tell gate rejection from backend saturation; both
    /// share the wire code.
    #[error("Server busy: request queue is full")]
    QueueFull,

    #[error("Request timed out after {0} ms")]
    RequestTimeout(u64),

    #[error("Upstream request timed out: {0}")]
    UpstreamTimeout(String),

    #[error("Memory limit of {0} MB exceeded")]
    MemoryLimitExceeded(u64),

    #[error("Output limit of {0} bytes exceeded")]
    OutputLimitExceeded(u64),

    #[error("Log entry limit of {0} exceeded")]
    LogLimitExceeded(u64),

    /// Network/process failure talking to an upstream. The connector never
    /// retries; the envelope is surfaced to the caller as-is.
    #[error("Upstream transport error: {0}")]
    Transport(String),

    #[error("internal error: {0}")]
    Internal(String),

    // -----------------------------------------------------------------
    // Automatic conversions for common external error types
    // -----------------------------------------------------------------
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl ConduitErr {
    /// The stable JSON-RPC error code for this error.
    pub fn code(&self) -> i64 {
        match self {
            ConduitErr::Parse(_) => error_code::PARSE_ERROR,
            ConduitErr::MethodNotFound(_) => error_code::METHOD_NOT_FOUND,
            ConduitErr::InvalidParams(_) => error_code::INVALID_PARAMS,
            ConduitErr::Forbidden(_) => error_code::FORBIDDEN,
            ConduitErr::RateLimited => error_code::RATE_LIMIT_EXCEEDED,
            ConduitErr::ServerBusy(_) | ConduitErr::QueueFull => error_code::SERVER_BUSY,
            ConduitErr::RequestTimeout(_) | ConduitErr::UpstreamTimeout(_) => {
                error_code::REQUEST_TIMEOUT
            }
            ConduitErr::MemoryLimitExceeded(_) => error_code::MEMORY_LIMIT_EXCEEDED,
            ConduitErr::OutputLimitExceeded(_) => error_code::OUTPUT_LIMIT_EXCEEDED,
            ConduitErr::LogLimitExceeded(_) => error_code::LOG_LIMIT_EXCEEDED,
            ConduitErr::Reqwest(e) if e.is_timeout() => error_code::REQUEST_TIMEOUT,
            ConduitErr::Transport(_)
            | ConduitErr::Internal(_)
            | ConduitErr::Io(_)
            | ConduitErr::Reqwest(_)
            | ConduitErr::Json(_) => error_code::INTERNAL_ERROR,
        }
    }

    pub fn to_error_object(&self) -> ErrorObject {
        ErrorObject::new(self.code(), self.to_string())
    }

    /// True when the upstream response indicates a transport timeout, i.e.
    /// the codes on which the gateway drops its cached schemas for that
    /// upstream.
    pub fn is_upstream_timeout(&self) -> bool {
        self.code() == error_code::REQUEST_TIMEOUT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn codes_match_the_wire_table() {
        assert_eq!(ConduitErr::Parse("x".into()).code(), -32700);
        assert_eq!(ConduitErr::MethodNotFound("m".into()).code(), -32601);
        assert_eq!(ConduitErr::InvalidParams("p".into()).code(), -32602);
        assert_eq!(ConduitErr::Internal("i".into()).code(), -32603);
        assert_eq!(ConduitErr::ServerBusy("b".into()).code(), -32000);
        assert_eq!(ConduitErr::QueueFull.code(), -32000);
        assert_eq!(ConduitErr::Forbidden("f".into()).code(), -32003);
        assert_eq!(ConduitErr::RateLimited.code(), -32005);
        assert_eq!(ConduitErr::RequestTimeout(100).code(), -32008);
        assert_eq!(ConduitErr::MemoryLimitExceeded(128).code(), -32009);
        assert_eq!(ConduitErr::OutputLimitExceeded(1024).code(), -32013);
        assert_eq!(ConduitErr::LogLimitExceeded(100).code(), -32014);
    }

    #[test]
    fn queue_full_is_not_internal() {
        let err = ConduitErr::QueueFull;
        assert_eq!(err.code(), -32000);
        assert!(err.to_string().contains("queue is full"));
    }
}
