use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use marionette_core::ids::SubscriptionId;
use marionette_core::manifest::Scope;
use marionette_core::value::{normalize, HostObject, HostValue};
use marionette_core::wire::SubscriptionEvent;

/// Failure raised by an entity lookup. The message decides whether the
/// resolver may fall back to the asynchronous lookup.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{message}")]
pub struct LookupError {
    pub message: String,
}

impl LookupError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

/// A raised lookup error that indicates the entity needs asynchronous
/// access, recognized by known message substrings.
pub fn is_dynamic_access_error(message: &str) -> bool {
    const INDICATORS: [&str; 3] = ["documentAccess", "dynamic-page", "ByIdAsync"];
    INDICATORS.iter().any(|s| message.contains(s))
}

/// Entity lookup seam used by target resolution: a primary synchronous
/// lookup plus an asynchronous fallback for entities the primary path
/// cannot reach.
#[async_trait]
pub trait EntityLookup: Send + Sync {
    fn entity_by_id(&self, id: &str) -> Result<Option<Arc<HostObject>>, LookupError>;
    async fn entity_by_id_async(&self, id: &str) -> Result<Option<Arc<HostObject>>, LookupError>;
}

/// A live, long-lived event registration bound on the host side. The
/// binding itself is the callback handle; no function value ever crossed
/// the wire to create it.
#[derive(Clone, Debug)]
pub struct HostSubscription {
    pub id: SubscriptionId,
    pub path: String,
    pub method: String,
    pub scope: Scope,
    pub event_name: Option<String>,
    pub created_at: i64,
}

/// Binds subscriptions to host events and forwards every matching emission
/// as an outbound subscription-event envelope.
pub struct EventHub {
    bindings: RwLock<HashMap<SubscriptionId, HostSubscription>>,
    events: broadcast::Sender<SubscriptionEvent>,
}

impl Default for EventHub {
    fn default() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            bindings: RwLock::new(HashMap::new()),
            events,
        }
    }
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receiver for the outbound event stream.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SubscriptionEvent> {
        self.events.subscribe()
    }

    pub fn bind(&self, subscription: HostSubscription) {
        self.bindings.write().insert(subscription.id.clone(), subscription);
    }

    pub fn unbind(&self, id: &SubscriptionId) -> Option<HostSubscription> {
        self.bindings.write().remove(id)
    }

    pub fn get(&self, id: &SubscriptionId) -> Option<HostSubscription> {
        self.bindings.read().get(id).cloned()
    }

    pub fn contains(&self, id: &SubscriptionId) -> bool {
        self.bindings.read().contains_key(id)
    }

    pub fn active_count(&self) -> usize {
        self.bindings.read().len()
    }

    /// Emit a named host event. Every binding whose event name matches (or
    /// that was bound without one) receives a normalized copy. Returns the
    /// number of envelopes produced.
    pub fn emit(&self, event_name: &str, payload: &HostValue) -> usize {
        let normalized = normalize(payload);
        let now = chrono::Utc::now().timestamp_millis();
        let mut delivered = 0;

        for binding in self.bindings.read().values() {
            let matches = binding
                .event_name
                .as_deref()
                .map(|n| n == event_name)
                .unwrap_or(true);
            if !matches {
                continue;
            }
            let event = SubscriptionEvent {
                subscription_id: binding.id.clone(),
                path: binding.path.clone(),
                method: binding.method.clone(),
                scope: binding.scope,
                event_name: Some(event_name.to_owned()),
                payload: normalized.clone(),
                timestamp: now,
            };
            if self.events.send(event).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

/// The live host object model the engine drives: a root object, an entity
/// store, the current selection, and the event hub.
pub struct Scene {
    root: Arc<HostObject>,
    entities: RwLock<HashMap<String, Arc<HostObject>>>,
    dynamic_ids: RwLock<HashSet<String>>,
    selection: RwLock<Vec<String>>,
    notices: RwLock<Vec<String>>,
    hub: EventHub,
}

impl Default for Scene {
    fn default() -> Self {
        Self {
            root: HostObject::new(),
            entities: RwLock::new(HashMap::new()),
            dynamic_ids: RwLock::new(HashSet::new()),
            selection: RwLock::new(Vec::new()),
            notices: RwLock::new(Vec::new()),
            hub: EventHub::new(),
        }
    }
}

impl Scene {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn root(&self) -> Arc<HostObject> {
        Arc::clone(&self.root)
    }

    pub fn hub(&self) -> &EventHub {
        &self.hub
    }

    /// Register an entity. Its `id` field is the store key.
    pub fn add_entity(&self, entity: Arc<HostObject>) {
        if let Some(HostValue::Text(id)) = entity.get("id") {
            self.entities.write().insert(id, entity);
        } else {
            tracing::warn!("Ignoring entity without a string id field");
        }
    }

    /// Mark an entity as reachable only through the asynchronous lookup.
    pub fn mark_dynamic(&self, id: &str) {
        self.dynamic_ids.write().insert(id.to_owned());
    }

    pub fn set_selection(&self, ids: Vec<String>) {
        *self.selection.write() = ids;
        self.hub.emit("selectionchange", &HostValue::List(vec![]));
    }

    /// Currently selected entities, skipping ids that no longer resolve.
    pub fn selection(&self) -> Vec<Arc<HostObject>> {
        let entities = self.entities.read();
        self.selection
            .read()
            .iter()
            .filter_map(|id| entities.get(id).cloned())
            .collect()
    }

    pub fn notify(&self, message: &str) {
        tracing::info!(message, "Host notification");
        self.notices.write().push(message.to_owned());
    }

    pub fn notices(&self) -> Vec<String> {
        self.notices.read().clone()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.read().len()
    }
}

#[async_trait]
impl EntityLookup for Scene {
    fn entity_by_id(&self, id: &str) -> Result<Option<Arc<HostObject>>, LookupError> {
        if self.dynamic_ids.read().contains(id) {
            return Err(LookupError::new(format!(
                "entity {id} lives on a dynamic-page and requires the async lookup"
            )));
        }
        Ok(self.entities.read().get(id).cloned())
    }

    async fn entity_by_id_async(&self, id: &str) -> Result<Option<Arc<HostObject>>, LookupError> {
        Ok(self.entities.read().get(id).cloned())
    }
}
