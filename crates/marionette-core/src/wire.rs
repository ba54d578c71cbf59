use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::errors::BridgeError;
use crate::ids::{RequestId, SubscriptionId};
use crate::manifest::{ManifestEntry, Scope};

/// Outbound envelope kinds. `join` is the only command not gated on an
/// already-joined channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Join,
    Message,
}

/// Body of an outbound request: command name plus parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommandMessage {
    pub id: RequestId,
    pub command: String,
    #[serde(default)]
    pub params: Value,
}

/// One outbound request envelope on the persistent connection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: RequestId,
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub channel: String,
    pub message: CommandMessage,
}

impl RequestEnvelope {
    pub fn join(id: RequestId, channel: &str) -> Self {
        Self {
            id: id.clone(),
            kind: EnvelopeKind::Join,
            channel: channel.to_owned(),
            message: CommandMessage {
                id,
                command: "join".to_owned(),
                params: json!({ "channel": channel }),
            },
        }
    }

    pub fn message(id: RequestId, channel: &str, command: &str, params: Value) -> Self {
        Self {
            id: id.clone(),
            kind: EnvelopeKind::Message,
            channel: channel.to_owned(),
            message: CommandMessage {
                id,
                command: command.to_owned(),
                params,
            },
        }
    }
}

/// Command the host understands for manifest-driven invocation.
pub const INVOKE_MANIFEST: &str = "invoke_manifest";

/// Resolution hints accompanying an invocation: explicit entity id(s),
/// current-selection addressing, or a nested property path.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_selection: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_path: Option<Vec<String>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionAction {
    Subscribe,
    Unsubscribe,
}

/// Two-phase callback protocol: the client signals "bind a live callback at
/// parameter `callback_index`"; the host binds a real callback only after
/// receipt. No function value ever crosses the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionDirective {
    pub id: SubscriptionId,
    pub action: SubscriptionAction,
    pub callback_index: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationMetadata {
    pub manifest_entry: ManifestEntry,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_assignments: Option<Map<String, Value>>,
}

/// The `invoke_manifest` command parameters, fully resolved by the request
/// builder: one manifest entry, strictly positional arguments.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationPayload {
    pub path: String,
    pub method: String,
    pub scope: Scope,
    pub args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<InvocationContext>,
    pub overload_index: u32,
    pub metadata: InvocationMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<SubscriptionDirective>,
}

/// Host response body for one invocation.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseBody {
    pub ok: bool,
    pub scope: Scope,
    pub path: String,
    pub method: String,
    pub overload_index: u32,
    pub args: Vec<Value>,
    pub result: Value,
    pub return_type: Option<String>,
    pub interface: Option<String>,
    #[serde(rename = "async")]
    pub is_async: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<SubscriptionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_action: Option<SubscriptionAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_event_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_active: Option<bool>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Started,
    InProgress,
    Completed,
    Error,
}

/// Keep-alive notification for a long-running host-side operation. Never
/// resolves a correlation; only refreshes its timeout window.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandProgress {
    pub command_type: String,
    pub status: ProgressStatus,
    pub progress: u8,
    #[serde(default)]
    pub processed_items: u64,
    #[serde(default)]
    pub total_items: u64,
    pub message: String,
    pub timestamp: i64,
}

/// One host-emitted event pushed for an active subscription.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionEvent {
    pub subscription_id: SubscriptionId,
    pub path: String,
    pub method: String,
    pub scope: Scope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_name: Option<String>,
    pub payload: Value,
    pub timestamp: i64,
}

/// Classified inbound traffic on the persistent connection.
#[derive(Clone, Debug)]
pub enum Inbound {
    /// Progress keep-alive for a pending request.
    Progress {
        request_id: RequestId,
        update: CommandProgress,
    },
    /// Unsolicited subscription event, routed to the relay.
    Subscription { event: Value },
    /// Terminal result or error for a pending request.
    Terminal {
        request_id: RequestId,
        outcome: Result<Value, String>,
    },
    /// Envelope for a known id carrying neither result nor error; the
    /// correlation stays pending.
    Intermediate { request_id: RequestId },
    /// Anything else; logged and dropped.
    Broadcast { raw: Value },
}

/// Classify one raw inbound frame per the wire contract: progress updates,
/// subscription events, then terminal/intermediate by message id.
pub fn classify_inbound(raw: &str) -> Result<Inbound, BridgeError> {
    let envelope: Value =
        serde_json::from_str(raw).map_err(|e| BridgeError::InvalidEnvelope(e.to_string()))?;

    let kind = envelope.get("type").and_then(Value::as_str);
    let message = envelope.get("message");

    if kind == Some("progress_update") {
        let request_id = envelope
            .get("id")
            .or_else(|| message.and_then(|m| m.get("id")))
            .and_then(Value::as_str)
            .map(RequestId::from_raw);
        let update = message
            .and_then(|m| m.get("data"))
            .and_then(|d| serde_json::from_value::<CommandProgress>(d.clone()).ok());
        return match (request_id, update) {
            (Some(request_id), Some(update)) => Ok(Inbound::Progress { request_id, update }),
            _ => Ok(Inbound::Broadcast { raw: envelope }),
        };
    }

    let message_kind = message.and_then(|m| m.get("type")).and_then(Value::as_str);
    if kind == Some("subscription_event") || message_kind == Some("subscription_event") {
        let event = message
            .and_then(|m| m.get("event"))
            .or(message)
            .cloned()
            .unwrap_or(Value::Null);
        return Ok(Inbound::Subscription { event });
    }

    let body = message.unwrap_or(&envelope);
    let request_id = body.get("id").and_then(Value::as_str).map(RequestId::from_raw);

    let Some(request_id) = request_id else {
        return Ok(Inbound::Broadcast { raw: envelope });
    };

    if let Some(error) = body.get("error") {
        let text = match error {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        return Ok(Inbound::Terminal {
            request_id,
            outcome: Err(text),
        });
    }

    if let Some(result) = body.get("result") {
        return Ok(Inbound::Terminal {
            request_id,
            outcome: Ok(result.clone()),
        });
    }

    Ok(Inbound::Intermediate { request_id })
}

/// Terminal result frame sent by the host.
pub fn result_frame(id: &RequestId, result: &Value) -> Value {
    json!({ "message": { "id": id, "result": result } })
}

/// Terminal error frame sent by the host.
pub fn error_frame(id: &RequestId, error: &str) -> Value {
    json!({ "message": { "id": id, "error": error } })
}

/// Progress keep-alive frame sent by the host.
pub fn progress_frame(id: &RequestId, update: &CommandProgress) -> Value {
    json!({
        "type": "progress_update",
        "id": id,
        "message": { "id": id, "data": update },
    })
}

/// Unsolicited subscription-event frame sent by the host.
pub fn subscription_frame(event: &SubscriptionEvent) -> Value {
    json!({
        "type": "subscription_event",
        "message": { "event": event },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_envelope_shape() {
        let id = RequestId::from_raw("req_1");
        let env = RequestEnvelope::join(id, "alpha");
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["type"], json!("join"));
        assert_eq!(v["channel"], json!("alpha"));
        assert_eq!(v["message"]["command"], json!("join"));
        assert_eq!(v["message"]["params"]["channel"], json!("alpha"));
        assert_eq!(v["id"], v["message"]["id"]);
    }

    #[test]
    fn message_envelope_shape() {
        let id = RequestId::from_raw("req_2");
        let env = RequestEnvelope::message(id, "alpha", INVOKE_MANIFEST, json!({ "x": 1 }));
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["type"], json!("message"));
        assert_eq!(v["message"]["command"], json!("invoke_manifest"));
    }

    #[test]
    fn classify_terminal_result() {
        let raw = r#"{"message":{"id":"req_1","result":{"ok":true}}}"#;
        match classify_inbound(raw).unwrap() {
            Inbound::Terminal { request_id, outcome } => {
                assert_eq!(request_id.as_str(), "req_1");
                assert_eq!(outcome.unwrap()["ok"], json!(true));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn classify_terminal_error() {
        let raw = r#"{"message":{"id":"req_1","error":"boom"}}"#;
        match classify_inbound(raw).unwrap() {
            Inbound::Terminal { outcome, .. } => assert_eq!(outcome.unwrap_err(), "boom"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn classify_structured_error_renders_json() {
        let raw = r#"{"message":{"id":"req_1","error":{"code":5}}}"#;
        match classify_inbound(raw).unwrap() {
            Inbound::Terminal { outcome, .. } => {
                assert!(outcome.unwrap_err().contains("\"code\":5"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn classify_progress_update() {
        let id = RequestId::from_raw("req_9");
        let update = CommandProgress {
            command_type: "invoke_manifest".into(),
            status: ProgressStatus::InProgress,
            progress: 40,
            processed_items: 2,
            total_items: 5,
            message: "working".into(),
            timestamp: 1_700_000_000_000,
        };
        let raw = progress_frame(&id, &update).to_string();
        match classify_inbound(&raw).unwrap() {
            Inbound::Progress { request_id, update } => {
                assert_eq!(request_id, id);
                assert_eq!(update.progress, 40);
                assert_eq!(update.status, ProgressStatus::InProgress);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn classify_subscription_event() {
        let event = SubscriptionEvent {
            subscription_id: SubscriptionId::from_raw("sub_1"),
            path: "app".into(),
            method: "on".into(),
            scope: Scope::Primary,
            event_name: Some("selectionchange".into()),
            payload: json!({ "count": 1 }),
            timestamp: 1_700_000_000_000,
        };
        let raw = subscription_frame(&event).to_string();
        match classify_inbound(&raw).unwrap() {
            Inbound::Subscription { event } => {
                assert_eq!(event["subscriptionId"], json!("sub_1"));
                assert_eq!(event["eventName"], json!("selectionchange"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn envelope_without_result_or_error_is_intermediate() {
        let raw = r#"{"message":{"id":"req_1","status":"ack"}}"#;
        match classify_inbound(raw).unwrap() {
            Inbound::Intermediate { request_id } => assert_eq!(request_id.as_str(), "req_1"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn envelope_without_id_is_broadcast() {
        let raw = r#"{"hello":"world"}"#;
        assert!(matches!(
            classify_inbound(raw).unwrap(),
            Inbound::Broadcast { .. }
        ));
    }

    #[test]
    fn malformed_frame_is_an_envelope_error() {
        let err = classify_inbound("{nope").unwrap_err();
        assert_eq!(err.error_kind(), "invalid_envelope");
    }

    #[test]
    fn response_body_wire_names() {
        let body = ResponseBody {
            ok: true,
            scope: Scope::Node,
            path: "node".into(),
            method: "rename".into(),
            overload_index: 0,
            args: vec![json!("Title")],
            result: Value::Null,
            return_type: Some("void".into()),
            interface: Some("EntityNode".into()),
            is_async: false,
            subscription_id: None,
            subscription_action: None,
            subscription_event_name: None,
            subscription_active: None,
        };
        let v = serde_json::to_value(&body).unwrap();
        assert_eq!(v["overloadIndex"], json!(0));
        assert_eq!(v["returnType"], json!("void"));
        assert_eq!(v["async"], json!(false));
        assert!(v.get("subscriptionId").is_none());
    }

    #[test]
    fn subscription_directive_wire_names() {
        let d = SubscriptionDirective {
            id: SubscriptionId::from_raw("sub_2"),
            action: SubscriptionAction::Subscribe,
            callback_index: 1,
        };
        let v = serde_json::to_value(&d).unwrap();
        assert_eq!(v["action"], json!("subscribe"));
        assert_eq!(v["callbackIndex"], json!(1));
    }
}
