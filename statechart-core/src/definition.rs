//! Machine definition types.
//!
//! Machine definitions are plain data, written as JSON or YAML:
//!
//! ```json
//! {
//!   "id": "toggle",
//!   "initial": "inactive",
//!   "context": {"count": 0},
//!   "states": {
//!     "inactive": {"on": {"TOGGLE": "active"}},
//!     "active": {
//!       "on": {
//!         "TOGGLE": [
//!           {"target": "inactive", "guard": {"expr": "ctx.count >= 3"}},
//!           {"actions": {"type": "assign", "params": {"note": "keep going"}}}
//!         ]
//!       }
//!     }
//!   }
//! }
//! ```
//!
//! A transition entry is either a target name, a single rule object, or an
//! ordered list of rules. Rules are tried in order; the first one whose guard
//! passes (or that has no guard) is taken.

use crate::action::ActionRef;
use crate::error::CoreError;
use crate::guard::{Guard, GuardRef};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Borrow;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// A state name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct State(pub String);

impl State {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for State {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for State {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Borrow<str> for State {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Raw transition rule as stored/transmitted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Target state. Absent means an internal transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    /// Optional guard.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<GuardRef>,

    /// Actions, run in order.
    #[serde(
        default,
        alias = "action",
        deserialize_with = "deserialize_actions",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub actions: Vec<ActionRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Ordered rules for one event type.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct RuleList(pub Vec<RuleConfig>);

impl<'de> Deserialize<'de> for RuleList {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::{self, value::MapAccessDeserializer, Visitor};

        struct RuleListVisitor;

        impl<'de> Visitor<'de> for RuleListVisitor {
            type Value = RuleList;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a target name, a transition rule, or an array of rules")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(RuleList(vec![RuleConfig {
                    target: Some(v.to_string()),
                    ..RuleConfig::default()
                }]))
            }

            fn visit_map<A>(self, map: A) -> Result<Self::Value, A::Error>
            where
                A: de::MapAccess<'de>,
            {
                let rule = RuleConfig::deserialize(MapAccessDeserializer::new(map))?;
                Ok(RuleList(vec![rule]))
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: de::SeqAccess<'de>,
            {
                let mut rules = Vec::new();
                while let Some(rule) = seq.next_element::<RuleConfig>()? {
                    rules.push(rule);
                }
                Ok(RuleList(rules))
            }
        }

        deserializer.deserialize_any(RuleListVisitor)
    }
}

fn deserialize_actions<'de, D>(deserializer: D) -> Result<Vec<ActionRef>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::{self, value::MapAccessDeserializer, Visitor};

    struct ActionsVisitor;

    impl<'de> Visitor<'de> for ActionsVisitor {
        type Value = Vec<ActionRef>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("an action name, an action object, or an array of actions")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(vec![ActionRef::Name(v.to_string())])
        }

        fn visit_map<A>(self, map: A) -> Result<Self::Value, A::Error>
        where
            A: de::MapAccess<'de>,
        {
            Ok(vec![ActionRef::deserialize(MapAccessDeserializer::new(map))?])
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            let mut actions = Vec::new();
            while let Some(action) = seq.next_element::<ActionRef>()? {
                actions.push(action);
            }
            Ok(actions)
        }
    }

    deserializer.deserialize_any(ActionsVisitor)
}

/// Raw state node as stored/transmitted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateConfig {
    /// Transitions keyed by event type.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub on: BTreeMap<String, RuleList>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Raw machine definition as stored/transmitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Machine identifier.
    #[serde(default = "default_machine_id")]
    pub id: String,

    /// Initial state for new instances.
    pub initial: String,

    /// Initial context for new instances.
    #[serde(default = "empty_context")]
    pub context: Value,

    /// All states, keyed by name.
    pub states: BTreeMap<String, StateConfig>,

    /// Optional metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

fn default_machine_id() -> String {
    "machine".to_string()
}

fn empty_context() -> Value {
    Value::Object(serde_json::Map::new())
}

/// A validated transition rule.
#[derive(Debug, Clone)]
pub struct TransitionRule {
    pub target: Option<State>,
    pub guard: Option<Guard>,
    pub actions: Vec<ActionRef>,
}

impl TransitionRule {
    /// Returns true if the rule changes the active state.
    pub fn is_external(&self) -> bool {
        self.target.is_some()
    }
}

/// A validated state node.
#[derive(Debug, Clone, Default)]
pub struct StateNode {
    transitions: HashMap<String, Vec<TransitionRule>>,
}

impl StateNode {
    /// Returns the ordered rules for an event type (empty if none).
    pub fn rules(&self, event: &str) -> &[TransitionRule] {
        self.transitions
            .get(event)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Authoring-time warning: a rule that can never be selected because an
/// earlier rule for the same state and event has no guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lint {
    pub state: String,
    pub event: String,
    pub rule_index: usize,
    pub shadowed_by: usize,
}

impl fmt::Display for Lint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "state '{}', event '{}': rule #{} is unreachable, rule #{} has no guard",
            self.state, self.event, self.rule_index, self.shadowed_by
        )
    }
}

/// Validated and indexed machine definition.
#[derive(Debug, Clone)]
pub struct MachineDefinition {
    /// Machine identifier.
    pub id: String,

    /// Initial state for new instances.
    pub initial: State,

    /// Initial context for new instances.
    pub context: Value,

    /// State nodes indexed by name.
    states: HashMap<State, StateNode>,

    /// Original raw definition for storage.
    pub raw: MachineConfig,

    /// Hash of the definition for integrity checks.
    pub checksum: String,
}

impl MachineDefinition {
    /// Parses and validates a machine definition from JSON.
    pub fn from_json(json: &Value) -> Result<Self, CoreError> {
        let raw: MachineConfig = serde_json::from_value(json.clone())?;
        Self::from_raw(raw)
    }

    /// Parses and validates a machine definition from YAML text.
    pub fn from_yaml(yaml: &str) -> Result<Self, CoreError> {
        let raw: MachineConfig = serde_yaml::from_str(yaml)?;
        Self::from_raw(raw)
    }

    /// Validates and indexes a raw definition.
    pub fn from_raw(raw: MachineConfig) -> Result<Self, CoreError> {
        let initial = State(raw.initial.clone());
        if !raw.states.contains_key(initial.as_str()) {
            return Err(CoreError::InvalidDefinition {
                reason: format!("initial state '{}' not in states", initial),
            });
        }

        let mut states = HashMap::with_capacity(raw.states.len());
        for (name, node) in &raw.states {
            let mut transitions = HashMap::with_capacity(node.on.len());

            for (event, rules) in &node.on {
                let mut compiled = Vec::with_capacity(rules.0.len());
                for rule in &rules.0 {
                    if let Some(target) = &rule.target {
                        if !raw.states.contains_key(target) {
                            return Err(CoreError::InvalidDefinition {
                                reason: format!(
                                    "transition target '{}' (state '{}', event '{}') not in states",
                                    target, name, event
                                ),
                            });
                        }
                    }

                    let guard = match &rule.guard {
                        Some(guard) => Some(Guard::compile(guard)?),
                        None => None,
                    };

                    compiled.push(TransitionRule {
                        target: rule.target.clone().map(State),
                        guard,
                        actions: rule.actions.clone(),
                    });
                }
                transitions.insert(event.clone(), compiled);
            }

            states.insert(State(name.clone()), StateNode { transitions });
        }

        let json_bytes = serde_json::to_vec(&raw)?;
        let checksum = format!("{:08x}", crc32c::crc32c(&json_bytes));

        Ok(Self {
            id: raw.id.clone(),
            initial,
            context: raw.context.clone(),
            states,
            raw,
            checksum,
        })
    }

    /// Returns the state node with the given name.
    pub fn state(&self, state: &str) -> Option<&StateNode> {
        self.states.get(state)
    }

    /// Returns the ordered rules for a state and event type.
    pub fn rules_for(&self, state: &str, event: &str) -> &[TransitionRule] {
        self.state(state).map(|node| node.rules(event)).unwrap_or(&[])
    }

    /// Returns true if the given state is valid for this machine.
    pub fn has_state(&self, state: &str) -> bool {
        self.states.contains_key(state)
    }

    /// Returns all state names, sorted.
    pub fn state_names(&self) -> Vec<&str> {
        self.raw.states.keys().map(String::as_str).collect()
    }

    /// Returns the event types handled in the given state, sorted.
    pub fn events_from(&self, state: &str) -> Vec<&str> {
        self.raw
            .states
            .get(state)
            .map(|node| node.on.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Iterates over every rule as `(state, event, index, rule)`, sorted by
    /// state then event, with rules in declaration order.
    pub fn rules(&self) -> impl Iterator<Item = (&str, &str, usize, &TransitionRule)> {
        self.raw.states.iter().flat_map(move |(state, node)| {
            node.on.keys().flat_map(move |event| {
                self.rules_for(state, event)
                    .iter()
                    .enumerate()
                    .map(move |(idx, rule)| (state.as_str(), event.as_str(), idx, rule))
            })
        })
    }

    /// Returns rules that can never be selected, sorted by state and event.
    pub fn lints(&self) -> Vec<Lint> {
        let mut lints = Vec::new();
        for (state, node) in &self.raw.states {
            for (event, rules) in &node.on {
                let Some(first_unguarded) = rules.0.iter().position(|r| r.guard.is_none()) else {
                    continue;
                };
                for idx in first_unguarded + 1..rules.0.len() {
                    lints.push(Lint {
                        state: state.clone(),
                        event: event.clone(),
                        rule_index: idx,
                        shadowed_by: first_unguarded,
                    });
                }
            }
        }
        lints
    }

    /// Returns the raw definition as JSON.
    pub fn to_json(&self) -> Result<Value, CoreError> {
        Ok(serde_json::to_value(&self.raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_definition() -> Value {
        json!({
            "id": "circles",
            "initial": "ready",
            "context": {"circles": [], "selectedCircleId": null},
            "states": {
                "ready": {
                    "on": {
                        "stage.touched": [
                            {"guard": "isCircleUnderPointer", "actions": "selectCircle"},
                            {"actions": ["addCircle", {"type": "assign", "params": {"dirty": true}}]}
                        ],
                        "lock": "locked"
                    }
                },
                "locked": {
                    "on": {"unlock": {"target": "ready", "guard": {"expr": "ctx.circles"}}}
                }
            }
        })
    }

    #[test]
    fn test_parse_definition() {
        let def = MachineDefinition::from_json(&sample_definition()).unwrap();

        assert_eq!(def.id, "circles");
        assert_eq!(def.initial.as_str(), "ready");
        assert_eq!(def.state_names(), vec!["locked", "ready"]);
        assert_eq!(def.context, json!({"circles": [], "selectedCircleId": null}));
        assert_eq!(def.checksum.len(), 8);
    }

    #[test]
    fn test_rule_shorthands() {
        let def = MachineDefinition::from_json(&sample_definition()).unwrap();

        let rules = def.rules_for("ready", "stage.touched");
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].guard.as_ref().and_then(Guard::name), Some("isCircleUnderPointer"));
        assert_eq!(rules[0].actions[0].name(), "selectCircle");
        assert!(rules[0].target.is_none());
        assert!(rules[1].guard.is_none());
        assert_eq!(rules[1].actions.len(), 2);
        assert_eq!(rules[1].actions[1].name(), "assign");

        let rules = def.rules_for("ready", "lock");
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].target, Some(State::from("locked")));
        assert!(rules[0].is_external());

        let rules = def.rules_for("locked", "unlock");
        assert!(matches!(rules[0].guard, Some(Guard::Expr { .. })));
    }

    #[test]
    fn test_missing_rules_are_empty() {
        let def = MachineDefinition::from_json(&sample_definition()).unwrap();
        assert!(def.rules_for("locked", "stage.touched").is_empty());
        assert!(def.rules_for("nowhere", "lock").is_empty());
    }

    #[test]
    fn test_events_from() {
        let def = MachineDefinition::from_json(&sample_definition()).unwrap();
        assert_eq!(def.events_from("ready"), vec!["lock", "stage.touched"]);
        assert_eq!(def.events_from("locked"), vec!["unlock"]);
        assert!(def.events_from("nowhere").is_empty());
    }

    #[test]
    fn test_default_id_and_context() {
        let def = MachineDefinition::from_json(&json!({
            "initial": "a",
            "states": {"a": {}}
        }))
        .unwrap();
        assert_eq!(def.id, "machine");
        assert_eq!(def.context, json!({}));
    }

    #[test]
    fn test_action_alias() {
        let def = MachineDefinition::from_json(&json!({
            "initial": "a",
            "states": {"a": {"on": {"go": {"action": "assignEvent"}}}}
        }))
        .unwrap();
        assert_eq!(def.rules_for("a", "go")[0].actions[0].name(), "assignEvent");
    }

    #[test]
    fn test_invalid_initial_state() {
        let json = json!({
            "initial": "c",
            "states": {"a": {}, "b": {}}
        });

        let result = MachineDefinition::from_json(&json);
        assert!(matches!(result, Err(CoreError::InvalidDefinition { .. })));
    }

    #[test]
    fn test_invalid_transition_target() {
        let json = json!({
            "initial": "a",
            "states": {"a": {"on": {"GO": [{"guard": {"expr": "ctx.x"}}, {"target": "c"}]}}}
        });

        let err = MachineDefinition::from_json(&json).unwrap_err();
        assert!(err.is_configuration_error());
        assert!(err.to_string().contains("'c'"));
    }

    #[test]
    fn test_invalid_guard_expression() {
        let json = json!({
            "initial": "a",
            "states": {"a": {"on": {"GO": {"target": "a", "guard": {"expr": "x >"}}}}}
        });

        let result = MachineDefinition::from_json(&json);
        assert!(matches!(result, Err(CoreError::InvalidGuard { .. })));
    }

    #[test]
    fn test_deeply_nested_guard_rejected() {
        let expr = format!("{}ctx.a", "!".repeat(5000));
        let json = json!({
            "initial": "a",
            "states": {"a": {"on": {"GO": {"guard": {"expr": expr}}}}}
        });

        // Parsed on a small stack so unbounded recursion would abort the test.
        let result = std::thread::Builder::new()
            .stack_size(1024 * 1024)
            .spawn(move || MachineDefinition::from_json(&json).map(|_| ()))
            .unwrap()
            .join()
            .unwrap();
        let err = result.unwrap_err();
        assert!(err.is_configuration_error());
        assert!(err.to_string().contains("nested too deeply"));
    }

    #[test]
    fn test_malformed_json() {
        let result = MachineDefinition::from_json(&json!({"states": {}}));
        assert!(matches!(result, Err(CoreError::Json(_))));

        let result = MachineDefinition::from_json(&json!({
            "initial": "a",
            "states": {"a": {"on": {"GO": 5}}}
        }));
        assert!(matches!(result, Err(CoreError::Json(_))));
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
id: toggle
initial: A
states:
  A:
    on:
      next: B
  B:
    on:
      next:
        - target: A
"#;
        let def = MachineDefinition::from_yaml(yaml).unwrap();
        assert_eq!(def.id, "toggle");
        assert_eq!(def.rules_for("A", "next")[0].target, Some(State::from("B")));
        assert_eq!(def.rules_for("B", "next")[0].target, Some(State::from("A")));
    }

    #[test]
    fn test_checksum_stable_across_formats() {
        let a = MachineDefinition::from_json(&json!({
            "initial": "A",
            "states": {"A": {"on": {"next": "B"}}, "B": {"on": {"next": [{"target": "A"}]}}}
        }))
        .unwrap();
        let b = MachineDefinition::from_json(&json!({
            "initial": "A",
            "states": {"B": {"on": {"next": {"target": "A"}}}, "A": {"on": {"next": [{"target": "B"}]}}}
        }))
        .unwrap();
        assert_eq!(a.checksum, b.checksum);

        let c = MachineDefinition::from_json(&json!({
            "initial": "B",
            "states": {"A": {"on": {"next": "B"}}, "B": {"on": {"next": "A"}}}
        }))
        .unwrap();
        assert_ne!(a.checksum, c.checksum);
    }

    #[test]
    fn test_lints_flag_shadowed_rules() {
        let def = MachineDefinition::from_json(&json!({
            "initial": "a",
            "states": {
                "a": {"on": {
                    "go": [{"target": "b"}, {"target": "a"}],
                    "ok": [{"guard": "g", "target": "b"}, {"target": "a"}]
                }},
                "b": {}
            }
        }))
        .unwrap();

        let lints = def.lints();
        assert_eq!(
            lints,
            vec![Lint {
                state: "a".to_string(),
                event: "go".to_string(),
                rule_index: 1,
                shadowed_by: 0,
            }]
        );
        assert!(lints[0].to_string().contains("unreachable"));
    }

    #[test]
    fn test_to_json_roundtrip() {
        let def = MachineDefinition::from_json(&sample_definition()).unwrap();
        let again = MachineDefinition::from_json(&def.to_json().unwrap()).unwrap();
        assert_eq!(def.checksum, again.checksum);
    }

    #[test]
    fn test_rules_iterator() {
        let def = MachineDefinition::from_json(&sample_definition()).unwrap();
        assert_eq!(def.rules().count(), 4);

        let order: Vec<(&str, &str, usize)> = def
            .rules()
            .map(|(state, event, idx, _)| (state, event, idx))
            .collect();
        assert_eq!(
            order,
            vec![
                ("locked", "unlock", 0),
                ("ready", "lock", 0),
                ("ready", "stage.touched", 0),
                ("ready", "stage.touched", 1),
            ]
        );
    }
}
