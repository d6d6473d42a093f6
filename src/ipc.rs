//! Wire messages for the control socket and the master<->worker pipes.
//!
//! Everything is newline-delimited JSON. The control socket carries one
//! command per short-lived connection; worker pipes carry a stream of
//! lifecycle and metrics messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Operator command accepted on the control socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum ControlCommand {
    Reload,
    Stop,
    Status,
}

impl ControlCommand {
    /// Parse a raw control line. Unknown commands yield `None` and are
    /// silently ignored by the server.
    pub fn parse(line: &str) -> Option<Self> {
        serde_json::from_str(line).ok()
    }
}

/// Reply sent back on the control socket.
///
/// The wire shapes are deliberately unstructured: `true` for success,
/// `{"reloaded":false,"message":...}` for a rejected reload, and a bare
/// integer for the worker count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlReply {
    Ok,
    Rejected(String),
    WorkerCount(usize),
}

impl ControlReply {
    pub fn to_json(&self) -> String {
        match self {
            ControlReply::Ok => "true".to_string(),
            ControlReply::Rejected(message) => {
                serde_json::json!({ "reloaded": false, "message": message }).to_string()
            }
            ControlReply::WorkerCount(n) => n.to_string(),
        }
    }

    pub fn parse(line: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(line).ok()?;
        match value {
            Value::Bool(true) => Some(ControlReply::Ok),
            Value::Number(n) => n.as_u64().map(|n| ControlReply::WorkerCount(n as usize)),
            Value::Object(map) => {
                let message = map
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("reload rejected")
                    .to_string();
                Some(ControlReply::Rejected(message))
            }
            _ => None,
        }
    }
}

/// Message sent by a worker on its stdout pipe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkerMessage {
    /// Worker process is up and its event loop is running
    Online,
    /// Worker bound its listening socket
    Listening { address: String },
    /// Periodic metrics payload, routed to the master's aggregator
    MetricsData { data: Value },
}

impl WorkerMessage {
    /// Parse a worker stdout line. Lines that are not a recognized message
    /// are treated as log records by the supervisor.
    pub fn parse(line: &str) -> Option<Self> {
        serde_json::from_str(line).ok()
    }
}

/// Master -> worker drain request, sent over the worker's stdin pipe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisconnectRequest {
    pub request_disconnect: bool,
    pub channel: String,
}

impl DisconnectRequest {
    pub fn new() -> Self {
        Self {
            request_disconnect: true,
            channel: "memored".to_string(),
        }
    }
}

impl Default for DisconnectRequest {
    fn default() -> Self {
        Self::new()
    }
}

/// Write one JSON value followed by a newline
pub async fn write_json_line<W, T>(writer: &mut W, value: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(value).map_err(std::io::Error::other)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_command_wire_shape() {
        let cmd = ControlCommand::parse(r#"{"command":"reload"}"#).unwrap();
        assert_eq!(cmd, ControlCommand::Reload);
        let cmd = ControlCommand::parse(r#"{"command":"stop"}"#).unwrap();
        assert_eq!(cmd, ControlCommand::Stop);
        let cmd = ControlCommand::parse(r#"{"command":"status"}"#).unwrap();
        assert_eq!(cmd, ControlCommand::Status);
    }

    #[test]
    fn test_unknown_command_is_none() {
        assert!(ControlCommand::parse(r#"{"command":"dance"}"#).is_none());
        assert!(ControlCommand::parse("not json").is_none());
        assert!(ControlCommand::parse(r#"{"other":"field"}"#).is_none());
    }

    #[test]
    fn test_control_reply_round_trip() {
        assert_eq!(ControlReply::parse("true"), Some(ControlReply::Ok));
        assert_eq!(
            ControlReply::parse(&ControlReply::WorkerCount(4).to_json()),
            Some(ControlReply::WorkerCount(4))
        );
        let rejected = ControlReply::Rejected("busy reloading".to_string());
        assert_eq!(ControlReply::parse(&rejected.to_json()), Some(rejected));
    }

    #[test]
    fn test_rejected_reply_wire_shape() {
        let json = ControlReply::Rejected("no".to_string()).to_json();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["reloaded"], Value::Bool(false));
        assert_eq!(value["message"], Value::String("no".to_string()));
    }

    #[test]
    fn test_worker_message_tags() {
        assert_eq!(
            WorkerMessage::parse(r#"{"type":"online"}"#),
            Some(WorkerMessage::Online)
        );
        assert_eq!(
            WorkerMessage::parse(r#"{"type":"listening","address":"127.0.0.1:8800"}"#),
            Some(WorkerMessage::Listening {
                address: "127.0.0.1:8800".to_string()
            })
        );
        let metrics = WorkerMessage::parse(r#"{"type":"metricsData","data":{"requests":3}}"#);
        assert_eq!(
            metrics,
            Some(WorkerMessage::MetricsData {
                data: serde_json::json!({"requests": 3})
            })
        );
    }

    #[test]
    fn test_worker_message_unrecognized_is_none() {
        assert!(WorkerMessage::parse("plain log line").is_none());
        assert!(WorkerMessage::parse(r#"{"type":"heapdump"}"#).is_none());
    }

    #[test]
    fn test_disconnect_request_wire_shape() {
        let json = serde_json::to_value(DisconnectRequest::new()).unwrap();
        assert_eq!(json["request_disconnect"], Value::Bool(true));
        assert_eq!(json["channel"], Value::String("memored".to_string()));
    }
}
