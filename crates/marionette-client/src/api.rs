//! High-level call surface: one entry point that resolves a manifest
//! entry, marshals arguments, applies subscription directives, sends the
//! envelope, and interprets the host's response.

use serde_json::{Map, Value};

use marionette_core::errors::BridgeError;
use marionette_core::ids::SubscriptionId;
use marionette_core::manifest::{Manifest, ManifestEntry, Scope};
use marionette_core::wire::{
    InvocationContext, InvocationMetadata, InvocationPayload, ResponseBody, SubscriptionAction,
    SubscriptionDirective, INVOKE_MANIFEST,
};

use crate::builder::{build_argument_list, resolve_entries, select_overload, CallArgs};
use crate::subscriptions::{EventSelector, SubscriptionRecord, SubscriptionRelay};
use crate::transport::Transport;

/// Subscription and assignment switches for one call.
#[derive(Clone, Debug, Default)]
pub struct CallOptions {
    pub subscribe: bool,
    pub unsubscribe: bool,
    pub subscription_id: Option<SubscriptionId>,
    pub property_assignments: Option<Map<String, Value>>,
}

/// One invocation as the caller describes it.
#[derive(Clone, Debug, Default)]
pub struct CallRequest {
    pub method: String,
    pub path: Option<String>,
    pub args: CallArgs,
    pub context: Option<InvocationContext>,
    pub scope: Option<Scope>,
    pub overload_index: Option<u32>,
    pub options: CallOptions,
}

impl CallRequest {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            ..Default::default()
        }
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn args(mut self, args: CallArgs) -> Self {
        self.args = args;
        self
    }

    pub fn context(mut self, context: InvocationContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn overload(mut self, index: u32) -> Self {
        self.overload_index = Some(index);
        self
    }

    pub fn subscribe(mut self) -> Self {
        self.options.subscribe = true;
        self
    }

    pub fn unsubscribe(mut self, id: SubscriptionId) -> Self {
        self.options.unsubscribe = true;
        self.options.subscription_id = Some(id);
        self
    }

    pub fn assignments(mut self, assignments: Map<String, Value>) -> Self {
        self.options.property_assignments = Some(assignments);
        self
    }
}

/// Manifest-driven client for one host connection.
pub struct Bridge {
    manifest: Manifest,
    transport: Transport,
}

impl Bridge {
    pub fn new(manifest: Manifest, transport: Transport) -> Self {
        Self { manifest, transport }
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Resolve, marshal, send, and interpret one invocation.
    pub async fn invoke(&self, request: &CallRequest) -> Result<ResponseBody, BridgeError> {
        let options = &request.options;
        if options.subscribe && options.unsubscribe {
            return Err(BridgeError::ConflictingSubscription);
        }

        let entries = resolve_entries(
            &self.manifest,
            &request.method,
            request.path.as_deref(),
            scope_hint(request),
        )?;
        let entry = select_overload(&entries, request.overload_index)?;

        // Node-scoped members need an addressable entity before anything
        // goes on the wire.
        if entry.scope == Scope::Node && !has_node_context(request.context.as_ref()) {
            return Err(BridgeError::MissingNodeContext);
        }

        let directive = self.subscription_directive(&entry, options)?;
        let skip_index = directive.as_ref().map(|d| d.callback_index);

        // An unsubscribe without arguments falls back to the event name
        // remembered at subscribe time.
        let mut call_args = request.args.clone();
        if let Some(d) = &directive {
            if d.action == SubscriptionAction::Unsubscribe && matches!(call_args, CallArgs::None) {
                if let Some(name) = self.relay().get(&d.id).and_then(|r| r.event_name) {
                    call_args = CallArgs::Positional(vec![Value::String(name)]);
                }
            }
        }
        let args = build_argument_list(&entry, &call_args, skip_index)?;

        let payload = InvocationPayload {
            path: entry.path.clone(),
            method: entry.member.clone(),
            scope: entry.scope,
            args,
            context: request.context.clone(),
            overload_index: entry.overload_index,
            metadata: InvocationMetadata {
                manifest_entry: entry.clone(),
                property_assignments: options.property_assignments.clone(),
            },
            subscription: directive.clone(),
        };

        let timeout = if entry.is_async {
            self.transport.config().async_timeout
        } else {
            self.transport.config().sync_timeout
        };

        let params = serde_json::to_value(&payload)
            .map_err(|e| BridgeError::InvalidEnvelope(e.to_string()))?;
        let raw = self
            .transport
            .send_command(INVOKE_MANIFEST, params, timeout)
            .await?;
        let body: ResponseBody = serde_json::from_value(raw)
            .map_err(|e| BridgeError::InvalidEnvelope(e.to_string()))?;

        self.apply_subscription_outcome(&entry, directive, &body);
        Ok(body)
    }

    /// Remove and return queued events for active subscriptions.
    pub fn drain_events(&self, selector: &EventSelector) -> Vec<marionette_core::wire::SubscriptionEvent> {
        self.transport.relay().drain(selector)
    }

    /// Inspect queued events without removing them.
    pub fn peek_events(&self, selector: &EventSelector) -> Vec<marionette_core::wire::SubscriptionEvent> {
        self.transport.relay().peek(selector)
    }

    pub fn active_subscriptions(&self) -> Vec<SubscriptionRecord> {
        self.transport.relay().active()
    }

    fn subscription_directive(
        &self,
        entry: &ManifestEntry,
        options: &CallOptions,
    ) -> Result<Option<SubscriptionDirective>, BridgeError> {
        if !options.subscribe && !options.unsubscribe {
            return Ok(None);
        }

        let callback_index =
            entry
                .callback_parameter_index()
                .ok_or_else(|| BridgeError::NoCallbackParameter {
                    method: entry.member.clone(),
                })?;

        if options.subscribe {
            let id = options
                .subscription_id
                .clone()
                .unwrap_or_else(SubscriptionId::new);
            return Ok(Some(SubscriptionDirective {
                id,
                action: SubscriptionAction::Subscribe,
                callback_index,
            }));
        }

        let id = options
            .subscription_id
            .clone()
            .ok_or_else(|| BridgeError::UnknownSubscription {
                id: "<none provided>".to_owned(),
            })?;
        if !self.relay().contains(&id) {
            return Err(BridgeError::UnknownSubscription { id: id.to_string() });
        }
        Ok(Some(SubscriptionDirective {
            id,
            action: SubscriptionAction::Unsubscribe,
            callback_index,
        }))
    }

    /// Commit local registration state from the host's view of it. The
    /// host may correct the id and fill in the event name.
    fn apply_subscription_outcome(
        &self,
        entry: &ManifestEntry,
        directive: Option<SubscriptionDirective>,
        body: &ResponseBody,
    ) {
        let Some(directive) = directive else { return };
        let id = body.subscription_id.clone().unwrap_or(directive.id);

        match directive.action {
            SubscriptionAction::Subscribe => {
                self.relay().insert(SubscriptionRecord {
                    id,
                    path: entry.path.clone(),
                    method: entry.member.clone(),
                    scope: entry.scope,
                    event_name: body.subscription_event_name.clone(),
                    created_at: chrono::Utc::now().timestamp_millis(),
                });
            }
            SubscriptionAction::Unsubscribe => {
                self.relay().remove(&id);
            }
        }
    }

    fn relay(&self) -> &SubscriptionRelay {
        self.transport.relay()
    }
}

/// An explicit scope on the request wins; otherwise context presence
/// implies node scope.
fn scope_hint(request: &CallRequest) -> Scope {
    request.scope.unwrap_or(if request.context.is_some() {
        Scope::Node
    } else {
        Scope::Primary
    })
}

fn has_node_context(context: Option<&InvocationContext>) -> bool {
    let Some(context) = context else { return false };
    context.node_id.is_some()
        || context.node_ids.as_ref().map_or(false, |ids| !ids.is_empty())
        || context.use_selection == Some(true)
}
