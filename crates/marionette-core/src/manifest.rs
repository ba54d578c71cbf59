use serde::{Deserialize, Serialize};

use crate::errors::BridgeError;

/// Namespace a path lives in: the global root object or an addressable entity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    #[default]
    Primary,
    Node,
}

/// Declared parameter of an invocable member.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub rest: bool,
}

impl Parameter {
    /// A parameter is callback-shaped when its declared type renders as a
    /// function-arrow signature, or its name/type textually indicates
    /// handler/callback/listener semantics. Callback slots are the injection
    /// point for subscription machinery.
    pub fn is_callback(&self) -> bool {
        if is_callback_type(&self.ty) {
            return true;
        }
        let name = self.name.to_lowercase();
        CALLBACK_INDICATORS.iter().any(|i| name.ends_with(i) || name.contains(i))
    }
}

const CALLBACK_INDICATORS: [&str; 3] = ["handler", "callback", "listener"];

/// Whether a rendered type string describes a function value.
pub fn is_callback_type(ty: &str) -> bool {
    let trimmed = ty.trim();
    if trimmed.is_empty() {
        return false;
    }
    if trimmed.contains("=>") {
        return true;
    }
    let lowered = trimmed.to_lowercase();
    CALLBACK_INDICATORS
        .iter()
        .any(|i| lowered.ends_with(i) || lowered.contains(i))
}

/// One invocable member of the host API surface, recorded offline by the
/// reflection pass. Multiple entries may share (path, member), one per
/// overload.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub id: String,
    pub scope: Scope,
    pub path: String,
    pub interface: String,
    pub member: String,
    #[serde(default)]
    pub overload_index: u32,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    pub returns: String,
    #[serde(rename = "async", default)]
    pub is_async: bool,
    #[serde(default)]
    pub deprecated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docs: Option<String>,
}

/// Pseudo-method that bypasses manifest lookup and assigns writable
/// properties on the resolved target.
pub const ASSIGN_PROPERTIES: &str = "__assignProperties__";

impl ManifestEntry {
    /// Index of the first callback-shaped parameter, if any.
    pub fn callback_parameter_index(&self) -> Option<usize> {
        self.parameters.iter().position(Parameter::is_callback)
    }

    /// Synthetic entry backing the property-assignment pseudo-method.
    pub fn property_assignment(path: &str, scope: Scope) -> Self {
        Self {
            id: format!("{path}.{ASSIGN_PROPERTIES}"),
            scope,
            path: path.to_owned(),
            interface: match scope {
                Scope::Primary => "RootAPI".to_owned(),
                Scope::Node => "PropertyAssignment".to_owned(),
            },
            member: ASSIGN_PROPERTIES.to_owned(),
            overload_index: 0,
            parameters: Vec::new(),
            returns: "void".to_owned(),
            is_async: false,
            deprecated: false,
            docs: Some("Synthetic entry used to assign writable properties on the resolved target.".to_owned()),
        }
    }
}

/// Versioned catalog of invocable members. Read-only at runtime.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn new(entries: Vec<ManifestEntry>) -> Self {
        Self { entries }
    }

    pub fn from_json(raw: &str) -> Result<Self, BridgeError> {
        serde_json::from_str(raw).map_err(|e| BridgeError::InvalidManifest(e.to_string()))
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All overloads recorded for (path, member).
    pub fn entries_for(&self, path: &str, member: &str) -> Vec<&ManifestEntry> {
        self.entries
            .iter()
            .filter(|e| e.path == path && e.member == member)
            .collect()
    }

    /// All entries with the given member name, across every path.
    pub fn entries_by_member(&self, member: &str) -> Vec<&ManifestEntry> {
        self.entries.iter().filter(|e| e.member == member).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, member: &str, overload: u32) -> ManifestEntry {
        ManifestEntry {
            id: format!("{path}.{member}#{overload}"),
            scope: Scope::Primary,
            path: path.into(),
            interface: "RootAPI".into(),
            member: member.into(),
            overload_index: overload,
            parameters: vec![],
            returns: "void".into(),
            is_async: false,
            deprecated: false,
            docs: None,
        }
    }

    #[test]
    fn callback_type_detection() {
        assert!(is_callback_type("(event: EntityEvent) => void"));
        assert!(is_callback_type("SelectionChangeHandler"));
        assert!(is_callback_type("EventListener"));
        assert!(!is_callback_type("string"));
        assert!(!is_callback_type("number[]"));
        assert!(!is_callback_type(""));
    }

    #[test]
    fn callback_parameter_by_name() {
        let p = Parameter {
            name: "callback".into(),
            ty: "unknown".into(),
            optional: false,
            rest: false,
        };
        assert!(p.is_callback());

        let p = Parameter {
            name: "width".into(),
            ty: "number".into(),
            optional: false,
            rest: false,
        };
        assert!(!p.is_callback());
    }

    #[test]
    fn callback_parameter_index_finds_first() {
        let mut e = entry("app", "on", 0);
        e.parameters = vec![
            Parameter {
                name: "event".into(),
                ty: "string".into(),
                optional: false,
                rest: false,
            },
            Parameter {
                name: "handler".into(),
                ty: "(event: EntityEvent) => void".into(),
                optional: false,
                rest: false,
            },
        ];
        assert_eq!(e.callback_parameter_index(), Some(1));
    }

    #[test]
    fn lookup_by_path_and_member() {
        let manifest = Manifest::new(vec![
            entry("app.viewport", "resize", 0),
            entry("app.viewport", "resize", 1),
            entry("node", "rename", 0),
        ]);

        let found = manifest.entries_for("app.viewport", "resize");
        assert_eq!(found.len(), 2);
        assert!(manifest.entries_for("app", "resize").is_empty());
    }

    #[test]
    fn overload_indices_unique_per_path_member() {
        let manifest = Manifest::new(vec![
            entry("app.viewport", "resize", 0),
            entry("app.viewport", "resize", 1),
        ]);
        let found = manifest.entries_for("app.viewport", "resize");
        let mut indices: Vec<u32> = found.iter().map(|e| e.overload_index).collect();
        indices.sort_unstable();
        indices.dedup();
        assert_eq!(indices.len(), found.len());
    }

    #[test]
    fn from_json_parses_wire_shape() {
        let raw = r#"[{
            "id": "app.viewport.resize#0",
            "scope": "primary",
            "path": "app.viewport",
            "interface": "ViewportAPI",
            "member": "resize",
            "overloadIndex": 0,
            "parameters": [
                {"name": "width", "type": "number", "optional": false, "rest": false},
                {"name": "height", "type": "number", "optional": false, "rest": false}
            ],
            "returns": "void",
            "async": false,
            "deprecated": false
        }]"#;
        let manifest = Manifest::from_json(raw).unwrap();
        assert_eq!(manifest.len(), 1);
        let e = &manifest.entries()[0];
        assert_eq!(e.scope, Scope::Primary);
        assert_eq!(e.parameters[0].name, "width");
        assert!(!e.is_async);
    }

    #[test]
    fn from_json_rejects_garbage() {
        let err = Manifest::from_json("{not json").unwrap_err();
        assert_eq!(err.error_kind(), "invalid_manifest");
    }

    #[test]
    fn property_assignment_entry_is_synthetic() {
        let e = ManifestEntry::property_assignment("node", Scope::Node);
        assert_eq!(e.member, ASSIGN_PROPERTIES);
        assert_eq!(e.path, "node");
        assert!(e.parameters.is_empty());
    }
}
