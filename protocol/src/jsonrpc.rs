use serde::Deserialize;
use serde::Serialize;

pub const JSONRPC_VERSION: &str = "2.0";

/// Request id: a string or a number. A request without an id is a
/// notification and receives no response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    String(String),
    Integer(i64),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::String(s) => write!(f, "{s}"),
            RequestId::Integer(i) => write!(f, "{i}"),
        }
    }
}

/// Bearer-token extension carried alongside the standard envelope fields.
/// The agent channel uses the master token; sandbox callbacks carry the
/// per-execution session token.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthPayload {
    #[serde(rename = "bearerToken", skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    /// Absent for notifications. `null` on the wire is treated as absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthPayload>,
}

impl JsonRpcRequest {
    pub fn new(
        id: impl Into<Option<RequestId>>,
        method: impl Into<String>,
        params: Option<serde_json::Value>,
    ) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            method: method.into(),
            params,
            auth: None,
        }
    }

    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.auth = Some(AuthPayload {
            bearer_token: Some(token.into()),
        });
        self
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ErrorObject {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// A response envelope. Exactly one of `result` / `error` is populated.
/// `id` is serialized even when `None` so that parse errors with a
/// malformed id yield `"id": null` as required.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl JsonRpcResponse {
    pub fn ok(id: Option<RequestId>, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Option<RequestId>, error: ErrorObject) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn request_round_trips_with_auth() {
        let raw = r#"{"jsonrpc":"2.0","id":7,"method":"mcp.callTool","params":{"name":"a__b"},"auth":{"bearerToken":"tok"}}"#;
        let req: JsonRpcRequest = serde_json::from_str(raw).expect("parse");
        assert_eq!(req.id, Some(RequestId::Integer(7)));
        assert_eq!(req.method, "mcp.callTool");
        assert_eq!(
            req.auth,
            Some(AuthPayload {
                bearer_token: Some("tok".to_string())
            })
        );
        assert!(!req.is_notification());
    }

    #[test]
    fn notification_has_no_id() {
        let raw = r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#;
        let req: JsonRpcRequest = serde_json::from_str(raw).expect("parse");
        assert!(req.is_notification());
    }

    #[test]
    fn error_response_serializes_null_id() {
        let resp = JsonRpcResponse::err(None, ErrorObject::new(-32700, "Parse error"));
        let value = serde_json::to_value(&resp).expect("serialize");
        assert_eq!(
            value,
            json!({
                "jsonrpc": "2.0",
                "id": null,
                "error": { "code": -32700, "message": "Parse error" }
            })
        );
    }

    #[test]
    fn string_and_integer_ids_are_distinct() {
        let a: RequestId = serde_json::from_str("\"1\"").expect("parse");
        let b: RequestId = serde_json::from_str("1").expect("parse");
        assert_eq!(a, RequestId::String("1".to_string()));
        assert_eq!(b, RequestId::Integer(1));
        assert_ne!(a, b);
    }
}
