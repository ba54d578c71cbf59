use std::sync::Arc;

use marionette_core::errors::BridgeError;
use marionette_core::manifest::Scope;
use marionette_core::value::{HostObject, HostValue};
use marionette_core::wire::InvocationContext;

use crate::scene::{is_dynamic_access_error, EntityLookup, Scene};

/// Logical root of the primary scope.
pub const ROOT_PATH: &str = "app";

/// Result of target resolution: the live object (or objects, or plain
/// value) a manifest member will be invoked against.
#[derive(Clone, Debug)]
pub enum Target {
    Object(Arc<HostObject>),
    Objects(Vec<Arc<HostObject>>),
    Value(HostValue),
}

impl Target {
    pub fn as_object(&self) -> Option<&Arc<HostObject>> {
        match self {
            Target::Object(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn to_value(&self) -> HostValue {
        match self {
            Target::Object(obj) => HostValue::Object(Arc::clone(obj)),
            Target::Objects(objs) => {
                HostValue::List(objs.iter().cloned().map(HostValue::Object).collect())
            }
            Target::Value(v) => v.clone(),
        }
    }

    fn from_value(value: HostValue) -> Self {
        match value {
            HostValue::Object(obj) => Target::Object(obj),
            other => Target::Value(other),
        }
    }
}

/// Translate a logical path plus scope/context hints into a live target.
/// Every failure is descriptive and segment-specific, never a silent null.
pub async fn resolve_target(
    scene: &Scene,
    path: &str,
    scope: Scope,
    ctx: &InvocationContext,
) -> Result<Target, BridgeError> {
    if path.is_empty() || path == ROOT_PATH {
        let base = Target::Object(scene.root());
        return continue_property_path(base, ctx);
    }

    if path == "nodes" {
        return resolve_entity_set(scene, ctx).await;
    }

    if path == "node" || scope == Scope::Node {
        let base = resolve_entity(scene, ctx).await?;
        return continue_property_path(base, ctx);
    }

    let base = walk_path(scene, path)?;
    continue_property_path(base, ctx)
}

/// Resolve one addressable entity: explicit id (primary lookup with an
/// async fallback on a recognized needs-async error) or the current
/// selection, optionally indexed.
async fn resolve_entity(scene: &Scene, ctx: &InvocationContext) -> Result<Target, BridgeError> {
    if ctx.use_selection.unwrap_or(false) {
        let selection = scene.selection();
        if selection.is_empty() {
            return Err(BridgeError::EmptySelection);
        }
        let index = ctx.selection_index.unwrap_or(0);
        let picked = selection.get(index).or_else(|| selection.first());
        return match picked {
            Some(entity) => Ok(Target::Object(Arc::clone(entity))),
            None => Err(BridgeError::EmptySelection),
        };
    }

    if let Some(id) = &ctx.node_id {
        let entity = entity_with_fallback(scene, id).await?;
        return entity
            .map(Target::Object)
            .ok_or_else(|| BridgeError::UnresolvedEntity { id: id.clone() });
    }

    Err(BridgeError::MissingNodeContext)
}

/// Resolve each id independently, skipping unresolved ones; fail only when
/// none resolve.
async fn resolve_entity_set(scene: &Scene, ctx: &InvocationContext) -> Result<Target, BridgeError> {
    let ids = ctx.node_ids.clone().unwrap_or_default();
    if ids.is_empty() {
        return Err(BridgeError::MissingNodeContext);
    }

    let mut resolved = Vec::new();
    for id in &ids {
        if let Some(entity) = entity_with_fallback(scene, id).await? {
            resolved.push(entity);
        } else {
            tracing::debug!(id, "Skipping unresolved entity");
        }
    }

    if resolved.is_empty() {
        return Err(BridgeError::NoEntitiesResolved);
    }
    Ok(Target::Objects(resolved))
}

/// Primary lookup, falling back to the asynchronous lookup only when the
/// primary raises a recognized needs-async error.
async fn entity_with_fallback(
    scene: &Scene,
    id: &str,
) -> Result<Option<Arc<HostObject>>, BridgeError> {
    match scene.entity_by_id(id) {
        Ok(found @ Some(_)) => Ok(found),
        Ok(None) => scene
            .entity_by_id_async(id)
            .await
            .map_err(|e| BridgeError::Remote(e.to_string())),
        Err(err) if is_dynamic_access_error(&err.to_string()) => {
            tracing::debug!(id, error = %err, "Primary lookup needs async access; falling back");
            scene
                .entity_by_id_async(id)
                .await
                .map_err(|e| BridgeError::Remote(e.to_string()))
        }
        Err(err) => Err(BridgeError::Remote(err.to_string())),
    }
}

/// Walk a dotted path from the root, reading each named property off the
/// previous result.
fn walk_path(scene: &Scene, path: &str) -> Result<Target, BridgeError> {
    let segments: Vec<&str> = path.split('.').collect();
    let mut current: Option<HostValue> = None;

    for (i, segment) in segments.iter().enumerate() {
        if i == 0 && *segment == ROOT_PATH {
            current = Some(HostValue::Object(scene.root()));
            continue;
        }

        let path_so_far = segments[..i].join(".");
        let next = match &current {
            None | Some(HostValue::Null) => {
                return Err(BridgeError::NullSegment {
                    segment: (*segment).to_owned(),
                })
            }
            Some(HostValue::Object(obj)) => obj.get(segment),
            Some(_) => None,
        };

        match next {
            Some(value) => current = Some(value),
            None => {
                return Err(BridgeError::UnresolvedSegment {
                    segment: (*segment).to_owned(),
                    path_so_far,
                })
            }
        }
    }

    Ok(Target::from_value(current.unwrap_or(HostValue::Null)))
}

/// An optional trailing property path continues the walk after
/// manifest-based resolution.
fn continue_property_path(base: Target, ctx: &InvocationContext) -> Result<Target, BridgeError> {
    let Some(properties) = &ctx.property_path else {
        return Ok(base);
    };

    let mut current = base.to_value();
    for property in properties {
        current = match current {
            HostValue::Null => {
                return Err(BridgeError::NullSegment {
                    segment: property.clone(),
                })
            }
            HostValue::Object(obj) => obj.get(property).ok_or_else(|| {
                BridgeError::UnresolvedSegment {
                    segment: property.clone(),
                    path_so_far: "<resolved target>".to_owned(),
                }
            })?,
            _ => {
                return Err(BridgeError::UnresolvedSegment {
                    segment: property.clone(),
                    path_so_far: "<resolved target>".to_owned(),
                })
            }
        };
    }
    Ok(Target::from_value(current))
}
