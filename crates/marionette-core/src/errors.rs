/// Typed error hierarchy for the invocation bridge.
/// Resolution and subscription errors surface before any network call;
/// transport errors come from the correlation layer; remote errors carry
/// the message returned by the host.
#[derive(Clone, Debug, thiserror::Error)]
pub enum BridgeError {
    // Resolution — always carries the offending name or path
    #[error("no manifest entry found for {path}.{method}")]
    UnknownEntry { path: String, method: String },
    #[error("method {method} not found in manifest")]
    UnknownMethod { method: String },
    #[error("method {method} exists on multiple paths ({paths}); specify a target path")]
    AmbiguousMethod { method: String, paths: String },
    #[error("no overload {overload} for {method}")]
    UnknownOverload { method: String, overload: u32 },
    #[error("missing required argument: {name}")]
    MissingArgument { name: String },
    #[error("property {segment} does not exist on target {path_so_far}")]
    UnresolvedSegment { segment: String, path_so_far: String },
    #[error("unable to resolve segment {segment} on null target")]
    NullSegment { segment: String },
    #[error("entity not found: {id}")]
    UnresolvedEntity { id: String },
    #[error("unable to resolve any entities for the provided ids")]
    NoEntitiesResolved,
    #[error("selection is empty; cannot resolve an entity from selection")]
    EmptySelection,
    #[error("node-scoped invocation requires either context.nodeId or context.useSelection")]
    MissingNodeContext,
    #[error("property assignments require an explicit target path")]
    MissingAssignmentPath,
    #[error("no invoker registered for {path}.{method} (overload {overload})")]
    UnknownInvoker {
        path: String,
        method: String,
        overload: u32,
    },
    #[error("invalid argument {name}: {reason}")]
    InvalidArgument { name: String, reason: String },

    // Transport
    #[error("not connected to host")]
    NotConnected,
    #[error("must join a channel before sending commands")]
    ChannelNotJoined,
    #[error("request timed out")]
    Timeout,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("{0}")]
    Remote(String),

    // Subscription
    #[error("cannot subscribe and unsubscribe in the same request")]
    ConflictingSubscription,
    #[error("method {method} does not expose a callback parameter and cannot be used for subscriptions")]
    NoCallbackParameter { method: String },
    #[error("unknown subscription: {id}")]
    UnknownSubscription { id: String },

    // Wire
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),
}

impl BridgeError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::UnknownEntry { .. } => "unknown_entry",
            Self::UnknownMethod { .. } => "unknown_method",
            Self::AmbiguousMethod { .. } => "ambiguous_method",
            Self::UnknownOverload { .. } => "unknown_overload",
            Self::MissingArgument { .. } => "missing_argument",
            Self::UnresolvedSegment { .. } => "unresolved_segment",
            Self::NullSegment { .. } => "null_segment",
            Self::UnresolvedEntity { .. } => "unresolved_entity",
            Self::NoEntitiesResolved => "no_entities_resolved",
            Self::EmptySelection => "empty_selection",
            Self::MissingNodeContext => "missing_node_context",
            Self::MissingAssignmentPath => "missing_assignment_path",
            Self::UnknownInvoker { .. } => "unknown_invoker",
            Self::InvalidArgument { .. } => "invalid_argument",
            Self::NotConnected => "not_connected",
            Self::ChannelNotJoined => "channel_not_joined",
            Self::Timeout => "timeout",
            Self::ConnectionClosed => "connection_closed",
            Self::Remote(_) => "remote",
            Self::ConflictingSubscription => "conflicting_subscription",
            Self::NoCallbackParameter { .. } => "no_callback_parameter",
            Self::UnknownSubscription { .. } => "unknown_subscription",
            Self::InvalidManifest(_) => "invalid_manifest",
            Self::InvalidEnvelope(_) => "invalid_envelope",
        }
    }

    /// True for errors raised locally before any envelope is sent.
    pub fn is_local(&self) -> bool {
        !matches!(
            self,
            Self::Remote(_) | Self::Timeout | Self::ConnectionClosed
        )
    }
}
