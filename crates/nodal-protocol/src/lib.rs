pub mod paths;

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Identifier of a node, unique within one user.
pub type NodeId = String;

/// Advisory minimum interval between run requests, advertised at login.
pub const DEFAULT_DEBOUNCE_MS: u64 = 300;
/// Interval at which streamed output lines are batched into one frame.
pub const DEFAULT_BATCH_INTERVAL_MS: u64 = 50;
/// Hard minimum inter-arrival time for runs of the same node.
pub const DEFAULT_FLOOD_THRESHOLD_MS: u64 = 10;
/// How long a fresh connection may take to send its login frame.
pub const DEFAULT_LOGIN_TIMEOUT_SECS: u64 = 30;

/// Client-to-server messages sent as JSON text frames.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientMessage {
    Login { identifier: String },
    Ping,
    RunNode(RunNodeRequest),
    GetVariable(GetVariableRequest),
}

/// Execute a node's script against a context built from `variables`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RunNodeRequest {
    pub node: NodeId,
    pub code: String,
    pub variables: Vec<VariableBinding>,
    /// Seconds to wait before reporting a timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<serde_json::Value>,
}

impl RunNodeRequest {
    pub fn new(node: impl Into<NodeId>, code: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            code: code.into(),
            variables: Vec::new(),
            timeout: None,
            inputs: None,
        }
    }

    pub fn with_binding(mut self, binding: VariableBinding) -> Self {
        self.variables.push(binding);
        self
    }

    pub fn with_timeout(mut self, secs: f64) -> Self {
        self.timeout = Some(secs);
        self
    }

    /// Timeout as a duration; negative or non-finite values mean "no timeout".
    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }
}

/// Imports `name` from the last saved context of `source`, bound as `target`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct VariableBinding {
    pub source: NodeId,
    pub name: String,
    pub target: String,
}

impl VariableBinding {
    pub fn new(
        source: impl Into<NodeId>,
        name: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            name: name.into(),
            target: target.into(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct GetVariableRequest {
    pub node: NodeId,
    pub name: String,
}

/// Lifecycle status of a single run.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Finished,
    Timeout,
    Error,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Finished => "finished",
            RunStatus::Timeout => "timeout",
            RunStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Throttling hints sent to the client at login, in milliseconds.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientConfig {
    pub debounce: u64,
    pub batch_interval: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE_MS,
            batch_interval: DEFAULT_BATCH_INTERVAL_MS,
        }
    }
}

/// Server-to-client messages sent as JSON text frames.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ServerMessage {
    Login {
        status: String,
        config: ClientConfig,
    },
    Pong,
    RunCode {
        status: RunStatus,
        node: NodeId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Batched output lines of a run that is still in flight.
    Output { node: NodeId, text: String },
    GetVariable {
        node: NodeId,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<serde_json::Value>,
        #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
        kind: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl ServerMessage {
    pub fn login_success(config: ClientConfig) -> Self {
        ServerMessage::Login {
            status: "success".to_string(),
            config,
        }
    }

    pub fn running(node: impl Into<NodeId>) -> Self {
        ServerMessage::RunCode {
            status: RunStatus::Running,
            node: node.into(),
            output: None,
            error: None,
        }
    }
}

/// Bare `{"error": ...}` reply for requests that could not be accepted.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorReply {
    pub error: String,
}

/// Anything the server writes to a session.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum ServerFrame {
    Message(ServerMessage),
    Error(ErrorReply),
}

impl From<ServerMessage> for ServerFrame {
    fn from(msg: ServerMessage) -> Self {
        ServerFrame::Message(msg)
    }
}

impl ServerFrame {
    pub fn error(message: impl Into<String>) -> Self {
        ServerFrame::Error(ErrorReply {
            error: message.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn run_node_parses_with_optional_fields_absent() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "action": "run_node",
            "node": "n2",
            "code": "y = x * 2",
            "variables": [{"source": "n1", "name": "result", "target": "x"}]
        }))
        .unwrap();

        let expected = RunNodeRequest::new("n2", "y = x * 2")
            .with_binding(VariableBinding::new("n1", "result", "x"));
        assert_eq!(msg, ClientMessage::RunNode(expected));
    }

    #[test]
    fn run_node_without_variables_is_rejected() {
        let parsed = serde_json::from_value::<ClientMessage>(json!({
            "action": "run_node",
            "node": "n1",
            "code": "x = 1"
        }));
        assert!(parsed.is_err());
    }

    #[test]
    fn timeout_duration_ignores_invalid_values() {
        let req = RunNodeRequest::new("n", "").with_timeout(0.25);
        assert_eq!(req.timeout_duration(), Some(Duration::from_millis(250)));
        assert_eq!(RunNodeRequest::new("n", "").with_timeout(-1.0).timeout_duration(), None);
        assert_eq!(RunNodeRequest::new("n", "").timeout_duration(), None);
    }

    #[test]
    fn ping_tag_format() {
        let json = serde_json::to_string(&ClientMessage::Ping).unwrap();
        assert_eq!(json, r#"{"action":"ping"}"#);
    }

    #[test]
    fn login_reply_carries_config() {
        let frame: ServerFrame = ServerMessage::login_success(ClientConfig::default()).into();
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            value,
            json!({
                "action": "login",
                "status": "success",
                "config": {
                    "debounce": DEFAULT_DEBOUNCE_MS,
                    "batch_interval": DEFAULT_BATCH_INTERVAL_MS
                }
            })
        );
    }

    #[test]
    fn running_reply_omits_output_and_error() {
        let value = serde_json::to_value(ServerFrame::from(ServerMessage::running("n1"))).unwrap();
        assert_eq!(value, json!({"action": "run_code", "status": "running", "node": "n1"}));
    }

    #[test]
    fn get_variable_reply_keeps_null_value() {
        let msg = ServerMessage::GetVariable {
            node: "n1".into(),
            name: "missing".into(),
            value: Some(serde_json::Value::Null),
            kind: Some("nil".into()),
            error: None,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "action": "get_variable",
                "node": "n1",
                "name": "missing",
                "value": null,
                "type": "nil"
            })
        );
    }

    #[test]
    fn error_frame_is_bare_object() {
        let json = serde_json::to_string(&ServerFrame::error("Rate limit exceeded")).unwrap();
        assert_eq!(json, r#"{"error":"Rate limit exceeded"}"#);

        let parsed: ServerFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, ServerFrame::error("Rate limit exceeded"));
    }

    #[test]
    fn server_frame_parses_tagged_messages_first() {
        let parsed: ServerFrame = serde_json::from_str(r#"{"action":"pong"}"#).unwrap();
        assert_eq!(parsed, ServerFrame::Message(ServerMessage::Pong));
    }
}
