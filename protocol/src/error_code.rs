//! Stable wire error codes. These values are part of the external contract
//! and must never be renumbered.

pub const PARSE_ERROR: i64 = -32700;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
pub const INVALID_REQUEST: i64 = -32600;

pub const SERVER_BUSY: i64 = -32000;
pub const FORBIDDEN: i64 = -32003;
pub const RATE_LIMIT_EXCEEDED: i64 = -32005;
pub const REQUEST_TIMEOUT: i64 = -32008;
pub const MEMORY_LIMIT_EXCEEDED: i64 = -32009;
pub const OUTPUT_LIMIT_EXCEEDED: i64 = -32013;
pub const LOG_LIMIT_EXCEEDED: i64 = -32014;
