use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use marionette_core::errors::BridgeError;
use marionette_core::ids::RequestId;
use marionette_core::manifest::ASSIGN_PROPERTIES;
use marionette_core::value::{normalize, HostValue};
use marionette_core::wire::{
    CommandProgress, InvocationContext, InvocationPayload, ProgressStatus, ResponseBody,
    SubscriptionAction,
};

use crate::registry::{InvokerCtx, InvokerRegistry};
use crate::resolve::resolve_target;
use crate::scene::{HostSubscription, Scene};

/// Sink invokers use to emit progress keep-alives for the request being
/// executed. A disabled sink drops everything.
pub struct ProgressSink {
    inner: Option<ProgressInner>,
}

struct ProgressInner {
    request_id: RequestId,
    command_type: String,
    tx: mpsc::UnboundedSender<(RequestId, CommandProgress)>,
}

impl ProgressSink {
    pub fn new(
        request_id: RequestId,
        command_type: impl Into<String>,
        tx: mpsc::UnboundedSender<(RequestId, CommandProgress)>,
    ) -> Self {
        Self {
            inner: Some(ProgressInner {
                request_id,
                command_type: command_type.into(),
                tx,
            }),
        }
    }

    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub fn emit(&self, status: ProgressStatus, progress: u8, message: &str) {
        let Some(inner) = &self.inner else { return };
        let update = CommandProgress {
            command_type: inner.command_type.clone(),
            status,
            progress,
            processed_items: 0,
            total_items: 0,
            message: message.to_owned(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        let _ = inner.tx.send((inner.request_id.clone(), update));
    }
}

/// Host-side execution engine: resolves an abstract path into a live
/// object, performs the call through the invoker registry, manages
/// subscription bindings, and normalizes results.
pub struct Engine {
    scene: Arc<Scene>,
    registry: InvokerRegistry,
}

impl Engine {
    pub fn new(scene: Arc<Scene>, registry: InvokerRegistry) -> Self {
        Self { scene, registry }
    }

    pub fn scene(&self) -> &Arc<Scene> {
        &self.scene
    }

    pub fn registry(&self) -> &InvokerRegistry {
        &self.registry
    }

    /// Execute one manifest invocation to a terminal response body.
    pub async fn execute(
        &self,
        payload: &InvocationPayload,
        progress: &ProgressSink,
    ) -> Result<ResponseBody, BridgeError> {
        let context = payload.context.clone().unwrap_or_else(InvocationContext::default);
        let target = resolve_target(&self.scene, &payload.path, payload.scope, &context).await?;

        let mut args = payload.args.clone();
        let directive = payload.subscription.clone();

        let mut pending_bind: Option<HostSubscription> = None;
        let mut removing: Option<HostSubscription> = None;

        if let Some(d) = &directive {
            while args.len() <= d.callback_index {
                args.push(Value::Null);
            }
            match d.action {
                SubscriptionAction::Subscribe => {
                    pending_bind = Some(HostSubscription {
                        id: d.id.clone(),
                        path: payload.path.clone(),
                        method: payload.method.clone(),
                        scope: payload.scope,
                        event_name: args.first().and_then(Value::as_str).map(str::to_owned),
                        created_at: chrono::Utc::now().timestamp_millis(),
                    });
                }
                SubscriptionAction::Unsubscribe => {
                    let existing = self.scene.hub().get(&d.id).ok_or_else(|| {
                        BridgeError::UnknownSubscription { id: d.id.to_string() }
                    })?;
                    // The host API demands the original event name to
                    // deregister; default a missing first argument to it.
                    if args.first().map_or(true, Value::is_null) {
                        if let Some(name) = &existing.event_name {
                            args[0] = json!(name);
                        }
                    }
                    removing = Some(existing);
                }
            }
        }

        let result = if payload.method == ASSIGN_PROPERTIES {
            self.assign_properties(&target, payload)?
        } else {
            let ctx = InvokerCtx {
                scene: &self.scene,
                context: &context,
                progress,
            };
            self.registry.invoke(
                &payload.path,
                &payload.method,
                payload.overload_index,
                &ctx,
                &target,
                &args,
            )?
        };

        // Subscription state transitions commit only after the call succeeds.
        let event_name = pending_bind
            .as_ref()
            .or(removing.as_ref())
            .and_then(|r| r.event_name.clone())
            .or_else(|| args.first().and_then(Value::as_str).map(str::to_owned));

        if let Some(record) = pending_bind {
            tracing::info!(subscription_id = %record.id, event = ?record.event_name, "Subscription bound");
            self.scene.hub().bind(record);
        }
        if let (Some(d), Some(_)) = (&directive, &removing) {
            self.scene.hub().unbind(&d.id);
            tracing::info!(subscription_id = %d.id, "Subscription removed");
        }

        let mut args_echo: Vec<Value> = args
            .iter()
            .map(|v| normalize(&HostValue::from(v)))
            .collect();
        if let Some(d) = &directive {
            if d.callback_index < args_echo.len() {
                args_echo[d.callback_index] =
                    json!({ "__type": "callback", "subscriptionId": d.id });
            }
        }

        let entry = &payload.metadata.manifest_entry;
        Ok(ResponseBody {
            ok: true,
            scope: payload.scope,
            path: payload.path.clone(),
            method: payload.method.clone(),
            overload_index: payload.overload_index,
            args: args_echo,
            result: normalize(&result),
            return_type: Some(entry.returns.clone()),
            interface: Some(entry.interface.clone()),
            is_async: entry.is_async,
            subscription_id: directive.as_ref().map(|d| d.id.clone()),
            subscription_action: directive.as_ref().map(|d| d.action),
            subscription_event_name: directive.as_ref().and(event_name),
            subscription_active: directive
                .as_ref()
                .map(|d| self.scene.hub().contains(&d.id)),
        })
    }

    /// Built-in property assignment: apply a key/value map onto the
    /// resolved target's writable fields.
    fn assign_properties(
        &self,
        target: &crate::resolve::Target,
        payload: &InvocationPayload,
    ) -> Result<HostValue, BridgeError> {
        let obj = target
            .as_object()
            .ok_or_else(|| BridgeError::InvalidArgument {
                name: "target".to_owned(),
                reason: "property assignment requires an object target".to_owned(),
            })?;
        let Some(assignments) = &payload.metadata.property_assignments else {
            return Ok(HostValue::Null);
        };
        for (key, value) in assignments {
            obj.set(key.clone(), HostValue::from(value));
        }
        Ok(HostValue::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo;
    use crate::scene::EntityLookup;
    use marionette_core::ids::SubscriptionId;
    use marionette_core::manifest::Scope;
    use marionette_core::wire::{InvocationMetadata, SubscriptionDirective};

    fn payload_for(
        engine: &demo::DemoEngine,
        path: &str,
        method: &str,
        overload: u32,
        args: Vec<Value>,
    ) -> InvocationPayload {
        let entry = engine
            .manifest
            .entries_for(path, method)
            .into_iter()
            .find(|e| e.overload_index == overload)
            .expect("demo manifest entry")
            .clone();
        InvocationPayload {
            path: path.into(),
            method: method.into(),
            scope: entry.scope,
            args,
            context: None,
            overload_index: overload,
            metadata: InvocationMetadata {
                manifest_entry: entry,
                property_assignments: None,
            },
            subscription: None,
        }
    }

    #[tokio::test]
    async fn viewport_resize_returns_normalized_void() {
        let demo = demo::build();
        let payload = payload_for(&demo, "app.viewport", "resize", 0, vec![json!(800), json!(600)]);

        let body = demo
            .engine
            .execute(&payload, &ProgressSink::disabled())
            .await
            .unwrap();
        assert!(body.ok);
        assert_eq!(body.args, vec![json!(800), json!(600)]);
        assert_eq!(body.result, Value::Null);
        assert_eq!(body.return_type.as_deref(), Some("void"));

        let viewport = demo.engine.scene().root().get("viewport").unwrap();
        let HostValue::Object(viewport) = viewport else { panic!("viewport") };
        assert!(matches!(viewport.get("width"), Some(HostValue::Int(800))));
        assert!(matches!(viewport.get("height"), Some(HostValue::Int(600))));
    }

    #[tokio::test]
    async fn entity_lookup_falls_back_to_async_access() {
        let demo = demo::build();
        let mut payload = payload_for(&demo, "node", "getEntityByIdAsync", 0, vec![]);
        payload.context = Some(InvocationContext {
            node_id: Some("1:23".into()),
            ..Default::default()
        });

        let body = demo
            .engine
            .execute(&payload, &ProgressSink::disabled())
            .await
            .unwrap();
        assert_eq!(body.result["id"], json!("1:23"));
        assert_eq!(body.result["type"], json!("FRAME"));
        assert!(body.result.get("name").is_some());
    }

    #[tokio::test]
    async fn subscribe_then_unsubscribe_transitions_absent_active_absent() {
        let demo = demo::build();
        let sub_id = SubscriptionId::from_raw("sub_test");

        let mut subscribe = payload_for(
            &demo,
            "app",
            "on",
            0,
            vec![json!("selectionchange"), Value::Null],
        );
        subscribe.subscription = Some(SubscriptionDirective {
            id: sub_id.clone(),
            action: SubscriptionAction::Subscribe,
            callback_index: 1,
        });

        assert!(!demo.engine.scene().hub().contains(&sub_id));
        let body = demo
            .engine
            .execute(&subscribe, &ProgressSink::disabled())
            .await
            .unwrap();
        assert_eq!(body.subscription_active, Some(true));
        assert_eq!(body.subscription_event_name.as_deref(), Some("selectionchange"));
        assert_eq!(body.args[1]["__type"], json!("callback"));
        assert!(demo.engine.scene().hub().contains(&sub_id));

        // Unsubscribe with a missing first argument defaults to the
        // remembered event name.
        let mut unsubscribe = payload_for(&demo, "app", "off", 0, vec![]);
        unsubscribe.subscription = Some(SubscriptionDirective {
            id: sub_id.clone(),
            action: SubscriptionAction::Unsubscribe,
            callback_index: 1,
        });
        let body = demo
            .engine
            .execute(&unsubscribe, &ProgressSink::disabled())
            .await
            .unwrap();
        assert_eq!(body.subscription_active, Some(false));
        assert_eq!(body.subscription_event_name.as_deref(), Some("selectionchange"));
        assert!(!demo.engine.scene().hub().contains(&sub_id));
    }

    #[tokio::test]
    async fn unsubscribe_unknown_id_fails() {
        let demo = demo::build();
        let mut payload = payload_for(&demo, "app", "off", 0, vec![]);
        payload.subscription = Some(SubscriptionDirective {
            id: SubscriptionId::from_raw("sub_ghost"),
            action: SubscriptionAction::Unsubscribe,
            callback_index: 1,
        });

        let err = demo
            .engine
            .execute(&payload, &ProgressSink::disabled())
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::UnknownSubscription { id } if id == "sub_ghost"));
    }

    #[tokio::test]
    async fn failed_call_does_not_bind_subscription() {
        let demo = demo::build();
        let sub_id = SubscriptionId::from_raw("sub_fail");

        // "on" requires a string event name; null makes the invoker fail.
        let mut payload = payload_for(&demo, "app", "on", 0, vec![Value::Null, Value::Null]);
        payload.subscription = Some(SubscriptionDirective {
            id: sub_id.clone(),
            action: SubscriptionAction::Subscribe,
            callback_index: 1,
        });

        let err = demo
            .engine
            .execute(&payload, &ProgressSink::disabled())
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::MissingArgument { .. }));
        assert!(!demo.engine.scene().hub().contains(&sub_id));
    }

    #[tokio::test]
    async fn property_assignment_applies_to_target() {
        let demo = demo::build();
        let entry = marionette_core::manifest::ManifestEntry::property_assignment("node", Scope::Node);
        let mut assignments = serde_json::Map::new();
        assignments.insert("name".into(), json!("Renamed"));
        assignments.insert("visible".into(), json!(false));

        let payload = InvocationPayload {
            path: "node".into(),
            method: ASSIGN_PROPERTIES.into(),
            scope: Scope::Node,
            args: vec![],
            context: Some(InvocationContext {
                node_id: Some("1:1".into()),
                ..Default::default()
            }),
            overload_index: 0,
            metadata: InvocationMetadata {
                manifest_entry: entry,
                property_assignments: Some(assignments),
            },
            subscription: None,
        };

        let body = demo
            .engine
            .execute(&payload, &ProgressSink::disabled())
            .await
            .unwrap();
        assert!(body.ok);

        let entity = demo.engine.scene().entity_by_id("1:1").unwrap().unwrap();
        assert!(matches!(entity.get("name"), Some(HostValue::Text(n)) if n == "Renamed"));
        assert!(matches!(entity.get("visible"), Some(HostValue::Bool(false))));
    }

    #[tokio::test]
    async fn export_emits_progress() {
        let demo = demo::build();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let request_id = RequestId::from_raw("req_export");
        let sink = ProgressSink::new(request_id.clone(), "exportBytes", tx);

        let mut payload = payload_for(&demo, "node", "exportBytes", 0, vec![json!("PNG")]);
        payload.context = Some(InvocationContext {
            node_id: Some("1:1".into()),
            ..Default::default()
        });

        let body = demo.engine.execute(&payload, &sink).await.unwrap();
        assert_eq!(body.result["__type"], json!("bytes"));

        let (id, first) = rx.try_recv().unwrap();
        assert_eq!(id, request_id);
        assert_eq!(first.status, ProgressStatus::Started);
        let (_, last) = rx.try_recv().unwrap();
        assert_eq!(last.status, ProgressStatus::Completed);
    }
}
