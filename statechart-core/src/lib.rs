//! # statechart-core
//!
//! Statechart evaluation core.
//!
//! This crate provides:
//! - Machine definition parsing and validation (JSON or YAML)
//! - Guarded transitions with first-match-wins rule selection
//! - Guard expression evaluation and named guard/action registries
//! - Assign-style context updates that never mutate prior snapshots
//! - Running instances with ordered snapshot subscriptions
//!
//! ```
//! use statechart_core::{Implementations, Machine};
//! use serde_json::json;
//!
//! let machine = Machine::from_json(
//!     &json!({
//!         "initial": "A",
//!         "states": {"A": {"on": {"next": "B"}}, "B": {"on": {"next": "A"}}}
//!     }),
//!     Implementations::new(),
//! )
//! .unwrap();
//!
//! let mut instance = machine.start();
//! assert_eq!(instance.send("next").unwrap().value(), "B");
//! assert_eq!(instance.send("next").unwrap().value(), "A");
//! ```

pub mod action;
pub mod definition;
pub mod error;
pub mod event;
pub mod guard;
pub mod instance;
pub mod machine;
pub mod registry;
pub mod setup;
mod subscription;

pub use action::{ActionArgs, ActionRef};
pub use definition::{Lint, MachineConfig, MachineDefinition, State, TransitionRule};
pub use error::{BoxError, CoreError};
pub use event::Event;
pub use guard::{GuardArgs, GuardExpr, GuardRef};
pub use instance::{EventSender, Instance, InstanceState, Snapshot};
pub use machine::Machine;
pub use registry::{MachineRegistry, PutResult};
pub use setup::Implementations;
pub use subscription::Subscription;
