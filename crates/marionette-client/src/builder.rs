//! Request building: manifest entry resolution, overload selection, and
//! named-to-positional argument marshaling.

use serde_json::{Map, Value};

use marionette_core::errors::BridgeError;
use marionette_core::manifest::{Manifest, ManifestEntry, Scope, ASSIGN_PROPERTIES};

/// Caller-supplied arguments in whichever shape the caller has them.
#[derive(Clone, Debug, Default)]
pub enum CallArgs {
    #[default]
    None,
    /// Already-ordered positional values, passed through untouched.
    Positional(Vec<Value>),
    /// Named map, marshaled against the declared parameter list.
    Named(Map<String, Value>),
    /// A single bare value for single-parameter members.
    Scalar(Value),
}

/// Fallback keys tried for a single-parameter member when the named map
/// does not carry the declared parameter name.
const SINGLE_PARAM_ALIASES: [&str; 4] = ["value", "values", "payload", "data"];

/// Candidate entries for a method, resolved by explicit path or inferred
/// across the whole manifest. Property assignment always requires an
/// explicit path and yields its synthetic entry.
pub fn resolve_entries(
    manifest: &Manifest,
    method: &str,
    path: Option<&str>,
    scope: Scope,
) -> Result<Vec<ManifestEntry>, BridgeError> {
    if method == ASSIGN_PROPERTIES {
        let path = path.ok_or(BridgeError::MissingAssignmentPath)?;
        return Ok(vec![ManifestEntry::property_assignment(path, scope)]);
    }

    if let Some(path) = path {
        let entries = manifest.entries_for(path, method);
        if entries.is_empty() {
            return Err(BridgeError::UnknownEntry {
                path: path.to_owned(),
                method: method.to_owned(),
            });
        }
        return Ok(entries.into_iter().cloned().collect());
    }

    let mut entries = manifest.entries_by_member(method);
    if entries.is_empty() {
        return Err(BridgeError::UnknownMethod {
            method: method.to_owned(),
        });
    }

    // Same-scope candidates win before ambiguity is declared.
    if entries.iter().any(|e| e.scope == scope) {
        entries.retain(|e| e.scope == scope);
    }

    let mut paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
    paths.sort_unstable();
    paths.dedup();
    if paths.len() > 1 {
        return Err(BridgeError::AmbiguousMethod {
            method: method.to_owned(),
            paths: paths.join(", "),
        });
    }

    Ok(entries.into_iter().cloned().collect())
}

/// Pick one overload. An explicit index must exist; without one the
/// lowest-indexed entry is taken, and any arity mismatch surfaces later in
/// marshaling.
pub fn select_overload(
    entries: &[ManifestEntry],
    explicit: Option<u32>,
) -> Result<ManifestEntry, BridgeError> {
    let mut sorted: Vec<&ManifestEntry> = entries.iter().collect();
    sorted.sort_by_key(|e| e.overload_index);

    if let Some(index) = explicit {
        return sorted
            .iter()
            .find(|e| e.overload_index == index)
            .map(|e| (*e).clone())
            .ok_or_else(|| BridgeError::UnknownOverload {
                method: entries
                    .first()
                    .map(|e| e.member.clone())
                    .unwrap_or_default(),
                overload: index,
            });
    }

    sorted
        .first()
        .map(|e| (*e).clone())
        .ok_or_else(|| BridgeError::UnknownMethod {
            method: String::new(),
        })
}

/// Marshal caller arguments into the strictly positional list the host
/// expects, walking the entry's declared parameters in order.
///
/// Slots are tracked as `Option<Value>` so an explicit `null` stays
/// distinguishable from an unset parameter; unset trailing slots are
/// trimmed, interior ones become `null`. `skip_index` exempts one slot
/// from the required-argument check (the callback slot of a subscription,
/// which the host fills in itself).
pub fn build_argument_list(
    entry: &ManifestEntry,
    args: &CallArgs,
    skip_index: Option<usize>,
) -> Result<Vec<Value>, BridgeError> {
    let mut slots: Vec<Option<Value>> = match args {
        CallArgs::Positional(values) => values.iter().cloned().map(Some).collect(),
        CallArgs::None => Vec::new(),
        CallArgs::Scalar(value) => {
            if entry.parameters.is_empty() {
                Vec::new()
            } else {
                vec![Some(value.clone())]
            }
        }
        CallArgs::Named(map) => marshal_named(entry, map)?,
    };

    // Required parameters missing a value fail before anything is sent.
    for (index, parameter) in entry.parameters.iter().enumerate() {
        if parameter.optional || parameter.rest || skip_index == Some(index) {
            continue;
        }
        let provided = slots.get(index).map_or(false, Option::is_some);
        if !provided && !matches!(args, CallArgs::Positional(_)) {
            return Err(BridgeError::MissingArgument {
                name: parameter.name.clone(),
            });
        }
    }

    while slots.last().map_or(false, Option::is_none) {
        slots.pop();
    }
    Ok(slots.into_iter().map(|s| s.unwrap_or(Value::Null)).collect())
}

fn marshal_named(
    entry: &ManifestEntry,
    map: &Map<String, Value>,
) -> Result<Vec<Option<Value>>, BridgeError> {
    let mut slots: Vec<Option<Value>> = Vec::new();

    for parameter in &entry.parameters {
        if parameter.rest {
            // A rest parameter spreads an array value into the tail.
            match map.get(&parameter.name) {
                Some(Value::Array(items)) => {
                    slots.extend(items.iter().cloned().map(Some));
                }
                Some(other) => slots.push(Some(other.clone())),
                None => {}
            }
            continue;
        }

        let mut value = map.get(&parameter.name).cloned();

        // Single-parameter members accept conventional wrapper keys, and
        // as a last resort a lone key of any name.
        if value.is_none() && entry.parameters.len() == 1 {
            value = SINGLE_PARAM_ALIASES
                .iter()
                .find_map(|alias| map.get(*alias).cloned());
            if value.is_none() && map.len() == 1 {
                value = map.values().next().cloned();
            }
        }

        slots.push(value);
    }

    Ok(slots)
}
