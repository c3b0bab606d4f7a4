//! Assign-style actions.
//!
//! An action is a pure function of `(context, event, params)` returning a
//! patch. Patches are shallow-merged into a fresh copy of the context; the
//! input context is never mutated.

use crate::error::BoxError;
use crate::event::Event;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Name of the built-in action that merges its params into context.
pub const ASSIGN: &str = "assign";

/// Name of the built-in action that merges the event payload into context.
pub const ASSIGN_EVENT: &str = "assignEvent";

/// Action reference as written in a machine definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActionRef {
    /// `"actions": "name"`
    Name(String),
    /// `"actions": {"type": "name", "params": ...}`
    Named {
        #[serde(rename = "type")]
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<Value>,
    },
}

impl ActionRef {
    pub fn name(&self) -> &str {
        match self {
            ActionRef::Name(name) => name,
            ActionRef::Named { name, .. } => name,
        }
    }

    pub fn params(&self) -> Option<&Value> {
        match self {
            ActionRef::Name(_) => None,
            ActionRef::Named { params, .. } => params.as_ref(),
        }
    }
}

/// Arguments passed to an action.
#[derive(Debug, Clone, Copy)]
pub struct ActionArgs<'a> {
    /// Context as produced by the previous action of the same rule.
    pub context: &'a Value,
    pub event: &'a Event,
    pub params: Option<&'a Value>,
}

/// An action implementation. Returns a patch for the context.
pub type ActionFn = dyn Fn(&ActionArgs<'_>) -> Result<Value, BoxError> + Send + Sync;

/// Shallow-merges `patch` into `ctx`.
///
/// Keys in the patch override, other keys persist. A `null` patch leaves the
/// context as is. A non-object context is replaced by an object patch.
pub fn merge_ctx(ctx: Value, patch: Value) -> Result<Value, BoxError> {
    match (ctx, patch) {
        (ctx, Value::Null) => Ok(ctx),
        (Value::Object(mut ctx_map), Value::Object(patch_map)) => {
            for (k, v) in patch_map {
                ctx_map.insert(k, v);
            }
            Ok(Value::Object(ctx_map))
        }
        (_, Value::Object(patch_map)) => Ok(Value::Object(patch_map)),
        (_, other) => Err(format!("action must return an object patch, got {}", other).into()),
    }
}

pub(crate) fn assign(args: &ActionArgs<'_>) -> Result<Value, BoxError> {
    match args.params {
        Some(Value::Object(map)) => Ok(Value::Object(map.clone())),
        Some(other) => Err(format!("assign params must be an object, got {}", other).into()),
        None => Ok(Value::Null),
    }
}

pub(crate) fn assign_event(args: &ActionArgs<'_>) -> Result<Value, BoxError> {
    Ok(args.event.payload_value())
}
