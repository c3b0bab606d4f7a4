//! Named guard and action implementations.
//!
//! Definitions stay data-only: they reference guards and actions by name,
//! and a machine resolves those names against an [`Implementations`]
//! registry when it is built.
//!
//! ```
//! use statechart_core::Implementations;
//! use serde_json::json;
//!
//! let setup = Implementations::new()
//!     .guard("hasItems", |args| Ok(args.context["items"].as_array().is_some_and(|a| !a.is_empty())))
//!     .action("clear", |_| Ok(json!({"items": []})));
//!
//! assert!(setup.has_guard("hasItems"));
//! assert!(setup.has_action("clear"));
//! assert!(setup.has_action("assign"));
//! ```

use crate::action::{self, ActionArgs, ActionFn};
use crate::error::BoxError;
use crate::guard::{GuardArgs, GuardFn};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Registry of named guards and actions.
#[derive(Clone)]
pub struct Implementations {
    guards: HashMap<String, Arc<GuardFn>>,
    actions: HashMap<String, Arc<ActionFn>>,
}

impl Implementations {
    /// Creates a registry holding the built-in actions (`assign`, `assignEvent`).
    pub fn new() -> Self {
        Self::empty()
            .action(action::ASSIGN, action::assign)
            .action(action::ASSIGN_EVENT, action::assign_event)
    }

    /// Creates a registry without built-ins.
    pub fn empty() -> Self {
        Self {
            guards: HashMap::new(),
            actions: HashMap::new(),
        }
    }

    /// Registers a guard. A later registration under the same name replaces it.
    pub fn guard<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&GuardArgs<'_>) -> Result<bool, BoxError> + Send + Sync + 'static,
    {
        self.guards.insert(name.into(), Arc::new(f));
        self
    }

    /// Registers an action. A later registration under the same name replaces it.
    pub fn action<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&ActionArgs<'_>) -> Result<Value, BoxError> + Send + Sync + 'static,
    {
        self.actions.insert(name.into(), Arc::new(f));
        self
    }

    pub fn get_guard(&self, name: &str) -> Option<&Arc<GuardFn>> {
        self.guards.get(name)
    }

    pub fn get_action(&self, name: &str) -> Option<&Arc<ActionFn>> {
        self.actions.get(name)
    }

    pub fn has_guard(&self, name: &str) -> bool {
        self.guards.contains_key(name)
    }

    pub fn has_action(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }
}

impl Default for Implementations {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Implementations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut guards: Vec<_> = self.guards.keys().collect();
        let mut actions: Vec<_> = self.actions.keys().collect();
        guards.sort();
        actions.sort();
        f.debug_struct("Implementations")
            .field("guards", &guards)
            .field("actions", &actions)
            .finish()
    }
}
