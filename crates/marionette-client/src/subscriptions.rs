//! Client-side subscription bookkeeping: active registrations and their
//! queued events, drained on demand by the caller.

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde_json::Value;

use marionette_core::ids::SubscriptionId;
use marionette_core::manifest::Scope;
use marionette_core::wire::SubscriptionEvent;

/// Events queue per subscription until the caller drains them; beyond this
/// the oldest are discarded.
const MAX_QUEUED_EVENTS: usize = 1024;

/// One active registration as the client remembers it.
#[derive(Clone, Debug)]
pub struct SubscriptionRecord {
    pub id: SubscriptionId,
    pub path: String,
    pub method: String,
    pub scope: Scope,
    pub event_name: Option<String>,
    pub created_at: i64,
}

/// Which subscriptions a drain call addresses.
#[derive(Clone, Debug)]
pub enum EventSelector {
    One(SubscriptionId),
    Many(Vec<SubscriptionId>),
    All,
}

struct RelayState {
    records: HashMap<SubscriptionId, SubscriptionRecord>,
    queues: HashMap<SubscriptionId, VecDeque<SubscriptionEvent>>,
}

/// Multiplexes unsolicited subscription-event frames into per-subscription
/// queues. Events for unknown subscriptions are logged and dropped.
pub struct SubscriptionRelay {
    state: RwLock<RelayState>,
}

impl Default for SubscriptionRelay {
    fn default() -> Self {
        Self {
            state: RwLock::new(RelayState {
                records: HashMap::new(),
                queues: HashMap::new(),
            }),
        }
    }
}

impl SubscriptionRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: SubscriptionRecord) {
        let mut state = self.state.write();
        state.queues.entry(record.id.clone()).or_default();
        state.records.insert(record.id.clone(), record);
    }

    /// Drop a registration along with any undrained events.
    pub fn remove(&self, id: &SubscriptionId) -> Option<SubscriptionRecord> {
        let mut state = self.state.write();
        state.queues.remove(id);
        state.records.remove(id)
    }

    pub fn contains(&self, id: &SubscriptionId) -> bool {
        self.state.read().records.contains_key(id)
    }

    pub fn get(&self, id: &SubscriptionId) -> Option<SubscriptionRecord> {
        self.state.read().records.get(id).cloned()
    }

    pub fn active(&self) -> Vec<SubscriptionRecord> {
        self.state.read().records.values().cloned().collect()
    }

    /// Ingest one raw event payload from the wire. Missing event name and
    /// timestamp fall back to the registration's name and the current time.
    pub fn handle_event(&self, raw: &Value) {
        let mut event: SubscriptionEvent = match serde_json::from_value(raw.clone()) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed subscription event");
                return;
            }
        };

        let mut state = self.state.write();
        let Some(record) = state.records.get(&event.subscription_id) else {
            tracing::warn!(
                subscription_id = %event.subscription_id,
                "Dropping event for unknown subscription"
            );
            return;
        };

        if event.event_name.is_none() {
            event.event_name = record.event_name.clone();
        }
        if event.timestamp == 0 {
            event.timestamp = chrono::Utc::now().timestamp_millis();
        }

        let queue = state.queues.entry(event.subscription_id.clone()).or_default();
        if queue.len() >= MAX_QUEUED_EVENTS {
            queue.pop_front();
        }
        queue.push_back(event);
    }

    /// Number of queued events for one subscription.
    pub fn queued(&self, id: &SubscriptionId) -> usize {
        self.state.read().queues.get(id).map_or(0, VecDeque::len)
    }

    /// Return queued events for the selected subscriptions without
    /// removing them.
    pub fn peek(&self, selector: &EventSelector) -> Vec<SubscriptionEvent> {
        let state = self.state.read();
        match selector {
            EventSelector::One(id) => state
                .queues
                .get(id)
                .map(|q| q.iter().cloned().collect())
                .unwrap_or_default(),
            EventSelector::Many(ids) => {
                let mut events: Vec<SubscriptionEvent> = ids
                    .iter()
                    .filter_map(|id| state.queues.get(id))
                    .flat_map(|q| q.iter().cloned())
                    .collect();
                events.sort_by_key(|e| e.timestamp);
                events
            }
            EventSelector::All => {
                let mut events: Vec<SubscriptionEvent> = state
                    .queues
                    .values()
                    .flat_map(|q| q.iter().cloned())
                    .collect();
                events.sort_by_key(|e| e.timestamp);
                events
            }
        }
    }

    /// Remove and return queued events for the selected subscriptions, in
    /// arrival order.
    pub fn drain(&self, selector: &EventSelector) -> Vec<SubscriptionEvent> {
        let mut state = self.state.write();
        match selector {
            EventSelector::One(id) => state
                .queues
                .get_mut(id)
                .map(|q| q.drain(..).collect())
                .unwrap_or_default(),
            EventSelector::Many(ids) => {
                let mut events: Vec<SubscriptionEvent> = Vec::new();
                for id in ids {
                    if let Some(queue) = state.queues.get_mut(id) {
                        events.extend(queue.drain(..));
                    }
                }
                events.sort_by_key(|e| e.timestamp);
                events
            }
            EventSelector::All => {
                let mut events: Vec<SubscriptionEvent> = state
                    .queues
                    .values_mut()
                    .flat_map(|q| q.drain(..))
                    .collect();
                events.sort_by_key(|e| e.timestamp);
                events
            }
        }
    }
}
