use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod codes {
    pub const UNKNOWN_COMMAND: &str = "UNKNOWN_COMMAND";
    pub const INVALID_PARAMS: &str = "INVALID_PARAMS";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const HANDLER_FAILED: &str = "HANDLER_FAILED";
    pub const STALE_ENDPOINT: &str = "STALE_ENDPOINT";
    pub const DISCONNECT: &str = "DISCONNECT";
    pub const UNKNOWN_TARGET: &str = "UNKNOWN_TARGET";
    pub const EVICTED: &str = "EVICTED";
    pub const RESTARTING: &str = "RESTARTING";
    pub const RELOAD_FAILED: &str = "RELOAD_FAILED";
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandResponse {
    pub success: bool,
    pub timestamp: String,
    #[serde(default)]
    pub error: Option<ErrorInfo>,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub metadata: ResponseMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorInfo {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub details: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseMetadata {
    pub command: String,
    pub execution_time: f64,
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

impl CommandResponse {
    pub fn success(command: &str, data: Value) -> Self {
        Self {
            success: true,
            timestamp: Utc::now().to_rfc3339(),
            error: None,
            data,
            message: None,
            metadata: ResponseMetadata {
                command: command.to_string(),
                execution_time: 0.0,
                extra: Map::new(),
            },
        }
    }

    pub fn error(command: &str, error: ErrorInfo) -> Self {
        Self {
            success: false,
            timestamp: Utc::now().to_rfc3339(),
            error: Some(error),
            data: Value::Null,
            message: None,
            metadata: ResponseMetadata {
                command: command.to_string(),
                execution_time: 0.0,
                extra: Map::new(),
            },
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_execution_time(mut self, seconds: f64) -> Self {
        self.metadata.execution_time = seconds;
        self
    }

    pub fn error_code(&self) -> Option<&str> {
        self.error.as_ref().map(|err| err.code.as_str())
    }
}

impl ErrorInfo {
    pub fn new(code: &str, kind: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: kind.to_string(),
            code: code.to_string(),
            details: Value::Null,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn unknown_command(command: &str) -> Self {
        Self::new(
            codes::UNKNOWN_COMMAND,
            "DispatchError",
            format!("no handler registered for '{command}'"),
        )
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_PARAMS, "DispatchError", message)
    }

    pub fn timeout(seconds: f64) -> Self {
        Self::new(
            codes::TIMEOUT,
            "ExecutionError",
            format!("command did not complete within {seconds}s"),
        )
    }

    pub fn handler_failed(message: impl Into<String>) -> Self {
        Self::new(codes::HANDLER_FAILED, "HandlerError", message)
    }

    pub fn unknown_target(identity: &str) -> Self {
        Self::new(
            codes::UNKNOWN_TARGET,
            "RoutingError",
            format!("no endpoint registered as '{identity}'"),
        )
    }

    pub fn disconnect(identity: &str) -> Self {
        Self::new(
            codes::DISCONNECT,
            "RoutingError",
            format!("endpoint '{identity}' disconnected before responding"),
        )
    }

    pub fn stale_endpoint(identity: &str) -> Self {
        Self::new(
            codes::STALE_ENDPOINT,
            "RoutingError",
            format!("endpoint '{identity}' stopped heartbeating"),
        )
    }

    pub fn reload_failed(message: impl Into<String>) -> Self {
        Self::new(codes::RELOAD_FAILED, "ReloadError", message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn success_shape_matches_contract() {
        let response = CommandResponse::success("echo", json!({"received": {"x": 1}}))
            .with_message("ok")
            .with_execution_time(0.25);
        let value = serde_json::to_value(&response).expect("serialize");
        assert_eq!(value["success"], true);
        assert_eq!(value["error"], Value::Null);
        assert_eq!(value["data"]["received"]["x"], 1);
        assert_eq!(value["message"], "ok");
        assert_eq!(value["metadata"]["command"], "echo");
        assert_eq!(value["metadata"]["execution_time"], 0.25);
        assert!(value["timestamp"].as_str().is_some());
    }

    #[test]
    fn error_shape_matches_contract() {
        let response = CommandResponse::error(
            "sleep10",
            ErrorInfo::timeout(1.0).with_details(json!({"deadline_s": 1.0})),
        );
        let value = serde_json::to_value(&response).expect("serialize");
        assert_eq!(value["success"], false);
        assert_eq!(value["data"], Value::Null);
        assert_eq!(value["error"]["code"], "TIMEOUT");
        assert_eq!(value["error"]["type"], "ExecutionError");
        assert_eq!(value["error"]["details"]["deadline_s"], 1.0);
    }

    #[test]
    fn round_trip_preserves_extra_metadata() {
        let mut response = CommandResponse::success("health_status", json!({"status": "healthy"}));
        response
            .metadata
            .extra
            .insert("queued".to_string(), json!(false));
        let encoded = serde_json::to_string(&response).expect("serialize");
        let decoded: CommandResponse = serde_json::from_str(&encoded).expect("deserialize");
        assert_eq!(decoded, response);
        assert_eq!(decoded.metadata.extra["queued"], json!(false));
    }

    #[test]
    fn error_code_accessor() {
        let ok = CommandResponse::success("echo", Value::Null);
        assert_eq!(ok.error_code(), None);
        let failed = CommandResponse::error("echo", ErrorInfo::handler_failed("boom"));
        assert_eq!(failed.error_code(), Some("HANDLER_FAILED"));
    }
}
