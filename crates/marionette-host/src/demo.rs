//! Demo scene, manifest, and invoker wiring used by the binary and the
//! end-to-end tests. Stands in for a real host application surface.

use std::sync::Arc;

use serde_json::Value;

use marionette_core::errors::BridgeError;
use marionette_core::manifest::{Manifest, ManifestEntry, Parameter, Scope};
use marionette_core::value::{HostObject, HostValue};
use marionette_core::wire::ProgressStatus;

use crate::engine::Engine;
use crate::registry::{optional_str, require_bool, require_f64, require_str, InvokerRegistry};
use crate::resolve::Target;
use crate::scene::{EntityLookup, Scene};

pub struct DemoEngine {
    pub manifest: Manifest,
    pub engine: Arc<Engine>,
}

pub fn build() -> DemoEngine {
    let scene = build_scene();
    let manifest = build_manifest();
    let registry = build_registry();

    for entry in registry.coverage_gaps(&manifest) {
        tracing::warn!(id = %entry.id, "Manifest entry has no registered invoker");
    }

    DemoEngine {
        manifest,
        engine: Arc::new(Engine::new(scene, registry)),
    }
}

fn entity(id: &str, ty: &str, name: &str) -> Arc<HostObject> {
    HostObject::with_fields([
        ("id", HostValue::Text(id.into())),
        ("type", HostValue::Text(ty.into())),
        ("name", HostValue::Text(name.into())),
        ("visible", HostValue::Bool(true)),
    ])
}

fn build_scene() -> Arc<Scene> {
    let scene = Scene::new();

    let hero = entity("1:1", "FRAME", "Hero");
    let title = entity("1:2", "TEXT", "Title");
    title.set("parent", HostValue::Object(Arc::clone(&hero)));
    hero.set("children", HostValue::List(vec![HostValue::Object(Arc::clone(&title))]));

    let deferred = entity("1:23", "FRAME", "Deferred");

    scene.add_entity(Arc::clone(&hero));
    scene.add_entity(title);
    scene.add_entity(deferred);
    scene.mark_dynamic("1:23");
    scene.set_selection(vec!["1:1".into()]);

    let viewport = HostObject::with_fields([
        ("width", HostValue::Int(1200)),
        ("height", HostValue::Int(800)),
        ("zoom", HostValue::Float(1.0)),
    ]);
    viewport.set_method("resize");

    let page = HostObject::with_fields([
        ("id", HostValue::Text("0:1".into())),
        ("type", HostValue::Text("PAGE".into())),
        ("name", HostValue::Text("Page 1".into())),
        ("children", HostValue::List(vec![HostValue::Object(hero)])),
    ]);

    let root = scene.root();
    root.set("viewport", HostValue::Object(viewport));
    root.set("currentPage", HostValue::Object(page));
    scene
}

fn param(name: &str, ty: &str) -> Parameter {
    Parameter {
        name: name.into(),
        ty: ty.into(),
        optional: false,
        rest: false,
    }
}

fn optional_param(name: &str, ty: &str) -> Parameter {
    Parameter {
        name: name.into(),
        ty: ty.into(),
        optional: true,
        rest: false,
    }
}

fn entry(
    scope: Scope,
    path: &str,
    interface: &str,
    member: &str,
    overload: u32,
    parameters: Vec<Parameter>,
    returns: &str,
    is_async: bool,
) -> ManifestEntry {
    ManifestEntry {
        id: format!("{path}.{member}#{overload}"),
        scope,
        path: path.into(),
        interface: interface.into(),
        member: member.into(),
        overload_index: overload,
        parameters,
        returns: returns.into(),
        is_async,
        deprecated: false,
        docs: None,
    }
}

fn build_manifest() -> Manifest {
    let handler = param("handler", "(event: EntityEvent) => void");
    Manifest::new(vec![
        entry(
            Scope::Primary,
            "app.viewport",
            "ViewportAPI",
            "resize",
            0,
            vec![param("width", "number"), param("height", "number")],
            "void",
            false,
        ),
        entry(
            Scope::Primary,
            "app.viewport",
            "ViewportAPI",
            "resize",
            1,
            vec![param("size", "Size")],
            "void",
            false,
        ),
        entry(
            Scope::Primary,
            "app.viewport",
            "ViewportAPI",
            "scrollIntoView",
            0,
            vec![Parameter {
                name: "ids".into(),
                ty: "string[]".into(),
                optional: false,
                rest: true,
            }],
            "void",
            false,
        ),
        entry(
            Scope::Primary,
            "app",
            "RootAPI",
            "getEntityById",
            0,
            vec![param("id", "string")],
            "Entity | null",
            false,
        ),
        entry(
            Scope::Node,
            "node",
            "EntityNode",
            "getEntityByIdAsync",
            0,
            vec![optional_param("id", "string")],
            "Promise<Entity | null>",
            true,
        ),
        entry(
            Scope::Primary,
            "app",
            "RootAPI",
            "on",
            0,
            vec![param("event", "string"), handler.clone()],
            "void",
            false,
        ),
        entry(
            Scope::Primary,
            "app",
            "RootAPI",
            "off",
            0,
            vec![param("event", "string"), handler],
            "void",
            false,
        ),
        entry(
            Scope::Primary,
            "app",
            "RootAPI",
            "notify",
            0,
            vec![param("message", "string")],
            "void",
            false,
        ),
        entry(
            Scope::Node,
            "node",
            "EntityNode",
            "rename",
            0,
            vec![param("name", "string")],
            "void",
            false,
        ),
        entry(
            Scope::Node,
            "node",
            "EntityNode",
            "setVisible",
            0,
            vec![param("visible", "boolean")],
            "void",
            false,
        ),
        entry(
            Scope::Node,
            "node",
            "EntityNode",
            "exportBytes",
            0,
            vec![optional_param("format", "string")],
            "Promise<Bytes>",
            true,
        ),
    ])
}

fn numeric(value: f64) -> HostValue {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        HostValue::Int(value as i64)
    } else {
        HostValue::Float(value)
    }
}

fn target_object(target: &Target, path: &str) -> Result<Arc<HostObject>, BridgeError> {
    target
        .as_object()
        .cloned()
        .ok_or_else(|| BridgeError::InvalidArgument {
            name: "target".to_owned(),
            reason: format!("{path} did not resolve to an object"),
        })
}

fn build_registry() -> InvokerRegistry {
    let mut registry = InvokerRegistry::new();

    registry.register("app.viewport", "resize", 0, |_, target, args| {
        let viewport = target_object(target, "app.viewport")?;
        let width = require_f64(args, 0, "width")?;
        let height = require_f64(args, 1, "height")?;
        viewport.set("width", numeric(width));
        viewport.set("height", numeric(height));
        Ok(HostValue::Null)
    });

    registry.register("app.viewport", "resize", 1, |_, target, args| {
        let viewport = target_object(target, "app.viewport")?;
        let size = args.first().ok_or_else(|| BridgeError::MissingArgument {
            name: "size".to_owned(),
        })?;
        let width = size.get("width").and_then(Value::as_f64).ok_or_else(|| {
            BridgeError::InvalidArgument {
                name: "size".to_owned(),
                reason: "expected { width, height }".to_owned(),
            }
        })?;
        let height = size.get("height").and_then(Value::as_f64).ok_or_else(|| {
            BridgeError::InvalidArgument {
                name: "size".to_owned(),
                reason: "expected { width, height }".to_owned(),
            }
        })?;
        viewport.set("width", numeric(width));
        viewport.set("height", numeric(height));
        Ok(HostValue::Null)
    });

    registry.register("app.viewport", "scrollIntoView", 0, |_, target, args| {
        let viewport = target_object(target, "app.viewport")?;
        let ids: Vec<HostValue> = args
            .iter()
            .filter_map(Value::as_str)
            .map(|s| HostValue::Text(s.to_owned()))
            .collect();
        viewport.set("focus", HostValue::List(ids));
        Ok(HostValue::Null)
    });

    registry.register("app", "getEntityById", 0, |ctx, _, args| {
        let id = require_str(args, 0, "id")?;
        match ctx.scene.entity_by_id(id) {
            Ok(Some(entity)) => Ok(HostValue::Object(entity)),
            Ok(None) => Ok(HostValue::Null),
            Err(err) => Err(BridgeError::Remote(err.to_string())),
        }
    });

    // Target resolution already performed the primary/async lookup via the
    // invocation context; the member returns the resolved entity.
    registry.register("node", "getEntityByIdAsync", 0, |_, target, _| {
        Ok(target.to_value())
    });

    registry.register("app", "on", 0, |_, _, args| {
        require_str(args, 0, "event")?;
        Ok(HostValue::Null)
    });

    registry.register("app", "off", 0, |_, _, args| {
        require_str(args, 0, "event")?;
        Ok(HostValue::Null)
    });

    registry.register("app", "notify", 0, |ctx, _, args| {
        let message = require_str(args, 0, "message")?;
        ctx.scene.notify(message);
        Ok(HostValue::Null)
    });

    registry.register("node", "rename", 0, |_, target, args| {
        let node = target_object(target, "node")?;
        let name = require_str(args, 0, "name")?;
        node.set("name", HostValue::Text(name.to_owned()));
        Ok(HostValue::Null)
    });

    registry.register("node", "setVisible", 0, |_, target, args| {
        let node = target_object(target, "node")?;
        let visible = require_bool(args, 0, "visible")?;
        node.set("visible", HostValue::Bool(visible));
        Ok(HostValue::Null)
    });

    registry.register("node", "exportBytes", 0, |ctx, target, args| {
        let node = target_object(target, "node")?;
        let format = optional_str(args, 0).unwrap_or("PNG");
        ctx.progress.emit(ProgressStatus::Started, 0, "export started");

        // Placeholder payload; a real host would rasterize the entity.
        let mut bytes = vec![0x89, 0x50, 0x4e, 0x47];
        if let Some(HostValue::Text(id)) = node.get("id") {
            bytes.extend_from_slice(id.as_bytes());
        }
        bytes.extend_from_slice(format.as_bytes());

        ctx.progress.emit(ProgressStatus::Completed, 100, "export finished");
        Ok(HostValue::Bytes(bytes))
    });

    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demo_manifest_is_fully_covered() {
        let demo = build();
        let gaps = build_registry().coverage_gaps(&demo.manifest);
        assert!(gaps.is_empty(), "uncovered entries: {gaps:?}");
    }

    #[test]
    fn demo_scene_has_entities_and_selection() {
        let demo = build();
        let scene = demo.engine.scene();
        assert_eq!(scene.entity_count(), 3);
        assert_eq!(scene.selection().len(), 1);
        assert!(scene.root().get("viewport").is_some());
    }

    #[test]
    fn resize_overloads_have_unique_indices() {
        let manifest = build_manifest();
        let entries = manifest.entries_for("app.viewport", "resize");
        assert_eq!(entries.len(), 2);
        assert_ne!(entries[0].overload_index, entries[1].overload_index);
    }

    #[test]
    fn subscription_members_expose_callback_slots() {
        let manifest = build_manifest();
        let on = &manifest.entries_for("app", "on")[0];
        assert_eq!(on.callback_parameter_index(), Some(1));
        let notify = &manifest.entries_for("app", "notify")[0];
        assert_eq!(notify.callback_parameter_index(), None);
    }
}
