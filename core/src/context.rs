use std::time::Instant;

use uuid::Uuid;

/// Who a request is acting as, decided by the authentication middleware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    /// The master bearer token, or an implicitly trusted local transport.
    Master,
    /// A per-execution session token minted for a running sandbox.
    Session { token: String },
}

/// Per-request context. Created on pipeline entry and dropped once the
/// response is emitted; never mutated by the sandbox. Reverse calls from a
/// sandbox get a derived context whose `allowed_tools` is frozen to the
/// value recorded on the session.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub correlation_id: String,
    pub started_at: Instant,
    pub principal: Principal,
    /// `None` means "no restriction"; an empty list means "nothing allowed".
    pub allowed_tools: Option<Vec<String>>,
    pub strict_validation: bool,
}

impl ExecutionContext {
    pub fn new(principal: Principal, strict_validation: bool) -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            started_at: Instant::now(),
            principal,
            allowed_tools: None,
            strict_validation,
        }
    }

    pub fn with_allowed_tools(mut self, allowed_tools: Option<Vec<String>>) -> Self {
        self.allowed_tools = allowed_tools;
        self
    }

    /// Context inherited by a sandbox's reverse calls: same correlation id,
    /// session principal, allowlist frozen to the session record.
    pub fn derived_for_session(&self, token: String, allowed_tools: Option<Vec<String>>) -> Self {
        Self {
            correlation_id: self.correlation_id.clone(),
            started_at: self.started_at,
            principal: Principal::Session { token },
            allowed_tools,
            strict_validation: self.strict_validation,
        }
    }
}
