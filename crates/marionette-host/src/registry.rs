use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use marionette_core::errors::BridgeError;
use marionette_core::manifest::{Manifest, ManifestEntry, ASSIGN_PROPERTIES};
use marionette_core::value::HostValue;
use marionette_core::wire::InvocationContext;

use crate::engine::ProgressSink;
use crate::resolve::Target;
use crate::scene::Scene;

/// Everything an invoker may touch besides its target and arguments.
pub struct InvokerCtx<'a> {
    pub scene: &'a Scene,
    pub context: &'a InvocationContext,
    pub progress: &'a ProgressSink,
}

pub type InvokerFn =
    dyn Fn(&InvokerCtx<'_>, &Target, &[Value]) -> Result<HostValue, BridgeError> + Send + Sync;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct InvokerKey {
    path: String,
    member: String,
    overload: u32,
}

/// Closed dispatch table mapping (path, member, overloadIndex) to a
/// strongly-typed invoker. Built ahead of time from the manifest; unknown
/// keys are a descriptive error, never a reflective call.
#[derive(Default)]
pub struct InvokerRegistry {
    invokers: HashMap<InvokerKey, Arc<InvokerFn>>,
}

impl InvokerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, path: &str, member: &str, overload: u32, invoker: F)
    where
        F: Fn(&InvokerCtx<'_>, &Target, &[Value]) -> Result<HostValue, BridgeError>
            + Send
            + Sync
            + 'static,
    {
        let key = InvokerKey {
            path: path.to_owned(),
            member: member.to_owned(),
            overload,
        };
        self.invokers.insert(key, Arc::new(invoker));
    }

    pub fn contains(&self, path: &str, member: &str, overload: u32) -> bool {
        self.invokers.contains_key(&InvokerKey {
            path: path.to_owned(),
            member: member.to_owned(),
            overload,
        })
    }

    pub fn invoke(
        &self,
        path: &str,
        member: &str,
        overload: u32,
        ctx: &InvokerCtx<'_>,
        target: &Target,
        args: &[Value],
    ) -> Result<HostValue, BridgeError> {
        let key = InvokerKey {
            path: path.to_owned(),
            member: member.to_owned(),
            overload,
        };
        let invoker = self
            .invokers
            .get(&key)
            .ok_or_else(|| BridgeError::UnknownInvoker {
                path: path.to_owned(),
                method: member.to_owned(),
                overload,
            })?;
        invoker(ctx, target, args)
    }

    pub fn len(&self) -> usize {
        self.invokers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.invokers.is_empty()
    }

    /// Manifest entries without a registered invoker. Property assignment is
    /// handled by the engine and never needs one.
    pub fn coverage_gaps<'m>(&self, manifest: &'m Manifest) -> Vec<&'m ManifestEntry> {
        manifest
            .entries()
            .iter()
            .filter(|e| {
                e.member != ASSIGN_PROPERTIES
                    && !self.contains(&e.path, &e.member, e.overload_index)
            })
            .collect()
    }
}

/// Positional argument accessors shared by invokers. Missing or mistyped
/// arguments fail with the declared parameter name.
pub fn require_arg<'a>(args: &'a [Value], index: usize, name: &str) -> Result<&'a Value, BridgeError> {
    match args.get(index) {
        Some(v) if !v.is_null() => Ok(v),
        _ => Err(BridgeError::MissingArgument { name: name.to_owned() }),
    }
}

pub fn require_str<'a>(args: &'a [Value], index: usize, name: &str) -> Result<&'a str, BridgeError> {
    require_arg(args, index, name)?
        .as_str()
        .ok_or_else(|| BridgeError::InvalidArgument {
            name: name.to_owned(),
            reason: "expected a string".to_owned(),
        })
}

pub fn require_f64(args: &[Value], index: usize, name: &str) -> Result<f64, BridgeError> {
    require_arg(args, index, name)?
        .as_f64()
        .ok_or_else(|| BridgeError::InvalidArgument {
            name: name.to_owned(),
            reason: "expected a number".to_owned(),
        })
}

pub fn require_bool(args: &[Value], index: usize, name: &str) -> Result<bool, BridgeError> {
    require_arg(args, index, name)?
        .as_bool()
        .ok_or_else(|| BridgeError::InvalidArgument {
            name: name.to_owned(),
            reason: "expected a boolean".to_owned(),
        })
}

pub fn optional_str<'a>(args: &'a [Value], index: usize) -> Option<&'a str> {
    args.get(index).and_then(Value::as_str)
}
