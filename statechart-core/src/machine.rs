//! Machines: a validated definition bound to its guard and action implementations.

use crate::action::{merge_ctx, ActionArgs};
use crate::definition::{MachineDefinition, TransitionRule};
use crate::error::CoreError;
use crate::event::Event;
use crate::guard::{Guard, GuardArgs};
use crate::instance::{Instance, Snapshot};
use crate::setup::Implementations;
use serde_json::Value;
use std::sync::Arc;

/// A runnable machine. Cheap to clone; clones share the same definition.
#[derive(Debug, Clone)]
pub struct Machine {
    definition: Arc<MachineDefinition>,
    implementations: Arc<Implementations>,
}

impl Machine {
    /// Binds a definition to its implementations.
    ///
    /// Fails if the definition references a guard or action that is not
    /// registered.
    pub fn new(
        definition: MachineDefinition,
        implementations: Implementations,
    ) -> Result<Self, CoreError> {
        for (state, event, _, rule) in definition.rules() {
            if let Some(name) = rule.guard.as_ref().and_then(Guard::name) {
                if !implementations.has_guard(name) {
                    return Err(CoreError::InvalidDefinition {
                        reason: format!(
                            "unknown guard '{}' (state '{}', event '{}')",
                            name, state, event
                        ),
                    });
                }
            }
            for action in &rule.actions {
                if !implementations.has_action(action.name()) {
                    return Err(CoreError::InvalidDefinition {
                        reason: format!(
                            "unknown action '{}' (state '{}', event '{}')",
                            action.name(),
                            state,
                            event
                        ),
                    });
                }
            }
        }

        for lint in definition.lints() {
            tracing::warn!(machine = %definition.id, "{}", lint);
        }

        Ok(Self {
            definition: Arc::new(definition),
            implementations: Arc::new(implementations),
        })
    }

    /// Parses, validates and binds a JSON definition.
    pub fn from_json(json: &Value, implementations: Implementations) -> Result<Self, CoreError> {
        Self::new(MachineDefinition::from_json(json)?, implementations)
    }

    pub fn definition(&self) -> &MachineDefinition {
        &self.definition
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    /// Snapshot a fresh instance starts from.
    pub fn initial_snapshot(&self) -> Snapshot {
        Snapshot::new(
            self.definition.initial.clone(),
            Arc::new(self.definition.context.clone()),
        )
    }

    /// Starts an instance from the initial state and context.
    pub fn start(&self) -> Instance {
        Instance::new(self.clone(), self.initial_snapshot())
    }

    /// Starts an instance from the initial state with a caller-supplied context.
    pub fn start_with_context(&self, context: Value) -> Instance {
        let snapshot = Snapshot::new(self.definition.initial.clone(), Arc::new(context));
        Instance::new(self.clone(), snapshot)
    }

    /// Starts an instance from a previously taken snapshot.
    pub fn restore(&self, snapshot: Snapshot) -> Result<Instance, CoreError> {
        if !self.definition.has_state(snapshot.value()) {
            return Err(CoreError::UnknownState {
                state: snapshot.value().to_string(),
            });
        }
        Ok(Instance::new(self.clone(), snapshot))
    }

    /// Computes the snapshot that `event` leads to, without touching any instance.
    ///
    /// Returns `None` when no rule matches (the event is ignored). Guard or
    /// action failures are returned as errors; nothing is applied.
    pub fn transition(
        &self,
        snapshot: &Snapshot,
        event: &Event,
    ) -> Result<Option<Snapshot>, CoreError> {
        let Some(rule) = self.select_rule(snapshot, event)? else {
            return Ok(None);
        };

        let context = if rule.actions.is_empty() {
            snapshot.context_arc().clone()
        } else {
            Arc::new(self.run_actions(rule, snapshot, event)?)
        };

        let state = rule
            .target
            .clone()
            .unwrap_or_else(|| snapshot.state().clone());

        Ok(Some(Snapshot::new(state, context)))
    }

    /// Returns true if some rule would be selected for `event`.
    pub fn can(&self, snapshot: &Snapshot, event: &Event) -> Result<bool, CoreError> {
        Ok(self.select_rule(snapshot, event)?.is_some())
    }

    fn candidate_rules(
        &self,
        snapshot: &Snapshot,
        event: &Event,
    ) -> Result<&[TransitionRule], CoreError> {
        let node = self
            .definition
            .state(snapshot.value())
            .ok_or_else(|| CoreError::UnknownState {
                state: snapshot.value().to_string(),
            })?;
        Ok(node.rules(event.event_type()))
    }

    fn select_rule(
        &self,
        snapshot: &Snapshot,
        event: &Event,
    ) -> Result<Option<&TransitionRule>, CoreError> {
        for rule in self.candidate_rules(snapshot, event)? {
            if self.check_guard(rule, snapshot, event)? {
                return Ok(Some(rule));
            }
        }
        Ok(None)
    }

    fn check_guard(
        &self,
        rule: &TransitionRule,
        snapshot: &Snapshot,
        event: &Event,
    ) -> Result<bool, CoreError> {
        match &rule.guard {
            None => Ok(true),
            Some(Guard::Expr { expr, .. }) => Ok(expr.evaluate(snapshot.context(), event)),
            Some(Guard::Named { name, params }) => {
                let guard = self.implementations.get_guard(name).ok_or_else(|| {
                    CoreError::InvalidDefinition {
                        reason: format!("unknown guard '{}'", name),
                    }
                })?;
                let args = GuardArgs {
                    context: snapshot.context(),
                    event,
                    params: params.as_ref(),
                };
                guard(&args).map_err(|source| CoreError::Guard {
                    state: snapshot.value().to_string(),
                    event: event.event_type().to_string(),
                    guard: name.clone(),
                    source,
                })
            }
        }
    }

    fn run_actions(
        &self,
        rule: &TransitionRule,
        snapshot: &Snapshot,
        event: &Event,
    ) -> Result<Value, CoreError> {
        let mut context = snapshot.context().clone();

        for action in &rule.actions {
            let action_err = |source| CoreError::Action {
                state: snapshot.value().to_string(),
                event: event.event_type().to_string(),
                action: action.name().to_string(),
                source,
            };

            let f = self.implementations.get_action(action.name()).ok_or_else(|| {
                CoreError::InvalidDefinition {
                    reason: format!("unknown action '{}'", action.name()),
                }
            })?;
            let patch = f(&ActionArgs {
                context: &context,
                event,
                params: action.params(),
            })
            .map_err(action_err)?;

            context = merge_ctx(context, patch).map_err(action_err)?;
        }

        Ok(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::State;
    use serde_json::json;

    fn counter_machine() -> Machine {
        let setup = Implementations::new()
            .guard("belowMax", |args| {
                let max = args.params.and_then(|p| p["max"].as_i64()).unwrap_or(i64::MAX);
                Ok(args.context["count"].as_i64().unwrap_or(0) < max)
            })
            .action("increment", |args| {
                let count = args.context["count"].as_i64().unwrap_or(0);
                Ok(json!({"count": count + 1}))
            })
            .action("fail", |_| Err("boom".into()));

        Machine::from_json(
            &json!({
                "id": "counter",
                "initial": "counting",
                "context": {"count": 0, "label": "c"},
                "states": {
                    "counting": {"on": {
                        "inc": [
                            {"guard": {"type": "belowMax", "params": {"max": 2}}, "actions": "increment"},
                            {"target": "full"}
                        ],
                        "twice": {"actions": ["increment", "increment"]},
                        "broken": {"target": "full", "actions": ["increment", "fail"]}
                    }},
                    "full": {"on": {"reset": {"target": "counting", "actions": {"type": "assign", "params": {"count": 0}}}}}
                }
            }),
            setup,
        )
        .unwrap()
    }

    #[test]
    fn test_unknown_guard_rejected() {
        let result = Machine::from_json(
            &json!({"initial": "a", "states": {"a": {"on": {"go": {"guard": "nope"}}}}}),
            Implementations::new(),
        );
        let err = result.unwrap_err();
        assert!(err.is_configuration_error());
        assert!(err.to_string().contains("unknown guard 'nope'"));
    }

    #[test]
    fn test_unknown_action_rejected() {
        let result = Machine::from_json(
            &json!({"initial": "a", "states": {"a": {"on": {"go": {"actions": ["assign", "nope"]}}}}}),
            Implementations::new(),
        );
        assert!(matches!(result, Err(CoreError::InvalidDefinition { .. })));
    }

    #[test]
    fn test_first_unknown_name_in_state_order() {
        let definition = json!({
            "initial": "a",
            "states": {
                "d": {"on": {"go": {"actions": "missingD"}}},
                "c": {"on": {"go": {"guard": "missingC"}}},
                "b": {"on": {"z": {"actions": "missingBz"}, "a": {"actions": "missingBa"}}},
                "a": {"on": {"go": {"target": "b"}}}
            }
        });

        for _ in 0..20 {
            let err = Machine::from_json(&definition, Implementations::new()).unwrap_err();
            assert_eq!(
                err.to_string(),
                "invalid machine definition: unknown action 'missingBa' (state 'b', event 'a')"
            );
        }
    }

    #[test]
    fn test_pure_transition() {
        let machine = counter_machine();
        let s0 = machine.initial_snapshot();

        let s1 = machine.transition(&s0, &Event::new("inc")).unwrap().unwrap();
        assert_eq!(s1.value(), "counting");
        assert_eq!(s1.context()["count"], 1);
        assert_eq!(s1.context()["label"], "c");

        // The input snapshot is untouched.
        assert_eq!(s0.context()["count"], 0);
    }

    #[test]
    fn test_guard_fallback() {
        let machine = counter_machine();
        let mut s = machine.initial_snapshot();
        for _ in 0..2 {
            s = machine.transition(&s, &Event::new("inc")).unwrap().unwrap();
        }
        assert_eq!(s.value(), "counting");

        let s = machine.transition(&s, &Event::new("inc")).unwrap().unwrap();
        assert_eq!(s.value(), "full");
        assert_eq!(s.context()["count"], 2);
    }

    #[test]
    fn test_actions_chain_in_order() {
        let machine = counter_machine();
        let s = machine
            .transition(&machine.initial_snapshot(), &Event::new("twice"))
            .unwrap()
            .unwrap();
        assert_eq!(s.context()["count"], 2);
    }

    #[test]
    fn test_failed_action_applies_nothing() {
        let machine = counter_machine();
        let err = machine
            .transition(&machine.initial_snapshot(), &Event::new("broken"))
            .unwrap_err();
        assert!(err.is_action_error());
        assert!(matches!(err, CoreError::Action { ref action, .. } if action == "fail"));
    }

    #[test]
    fn test_ignored_event() {
        let machine = counter_machine();
        let s0 = machine.initial_snapshot();
        assert!(machine.transition(&s0, &Event::new("reset")).unwrap().is_none());
        assert!(!machine.can(&s0, &Event::new("reset")).unwrap());
        assert!(machine.can(&s0, &Event::new("inc")).unwrap());
    }

    #[test]
    fn test_transition_without_actions_shares_context() {
        let machine = counter_machine();
        let mut s = machine.initial_snapshot();
        for _ in 0..2 {
            s = machine.transition(&s, &Event::new("inc")).unwrap().unwrap();
        }
        let full = machine.transition(&s, &Event::new("inc")).unwrap().unwrap();
        assert!(full.same_context(&s));
    }

    #[test]
    fn test_builtin_assign_action() {
        let machine = counter_machine();
        let full = machine
            .restore(Snapshot::new(State::from("full"), Arc::new(json!({"count": 9}))))
            .unwrap();
        let s = machine
            .transition(&full.snapshot().unwrap(), &Event::new("reset"))
            .unwrap()
            .unwrap();
        assert_eq!(s.value(), "counting");
        assert_eq!(s.context()["count"], 0);
    }

    #[test]
    fn test_restore_unknown_state() {
        let machine = counter_machine();
        let result = machine.restore(Snapshot::new(State::from("gone"), Arc::new(json!({}))));
        assert!(matches!(result, Err(CoreError::UnknownState { .. })));
    }
}
