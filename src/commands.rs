//! Command execution.

use crate::config::OutputFormat;
use colored::Colorize;
use serde_json::{json, Value};
use statechart_core::{CoreError, Event, Implementations, Machine, MachineDefinition};
use std::collections::BTreeSet;
use std::io::{BufRead, Write};
use std::path::Path;

type CommandResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Counters reported at the end of a `run`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub processed: usize,
    pub transitions: u64,
    pub failed: usize,
}

/// Loads a definition file. `.yaml`/`.yml` files are parsed as YAML,
/// anything else as JSON.
pub fn load_definition(path: &Path) -> CommandResult<MachineDefinition> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read '{}': {}", path.display(), e))?;
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    let definition = if is_yaml {
        MachineDefinition::from_yaml(&content)?
    } else {
        let json: Value = serde_json::from_str(&content).map_err(CoreError::from)?;
        MachineDefinition::from_json(&json)?
    };
    Ok(definition)
}

/// Names of guards and actions the definition expects the host to provide.
fn host_implementations(definition: &MachineDefinition) -> (BTreeSet<&str>, BTreeSet<&str>) {
    let builtins = Implementations::new();
    let mut guards = BTreeSet::new();
    let mut actions = BTreeSet::new();
    for (_, _, _, rule) in definition.rules() {
        if let Some(name) = rule.guard.as_ref().and_then(|g| g.name()) {
            if !builtins.has_guard(name) {
                guards.insert(name);
            }
        }
        for action in &rule.actions {
            if !builtins.has_action(action.name()) {
                actions.insert(action.name());
            }
        }
    }
    (guards, actions)
}

/// Validates a definition and reports lints. In strict mode any lint fails.
pub fn validate(path: &Path, strict: bool) -> CommandResult<String> {
    let definition = load_definition(path)?;
    let lints = definition.lints();

    let mut output = format!(
        "{} machine {} (checksum: {})",
        "Valid".green(),
        definition.id.cyan(),
        definition.checksum
    );
    for lint in &lints {
        output.push_str(&format!("\n  {}: {}", "Warning".yellow(), lint));
    }

    let (guards, actions) = host_implementations(&definition);
    if !guards.is_empty() {
        output.push_str(&format!("\n  Host guards: {}", join(&guards)));
    }
    if !actions.is_empty() {
        output.push_str(&format!("\n  Host actions: {}", join(&actions)));
    }

    if strict && !lints.is_empty() {
        return Err(format!(
            "{} lint(s) in strict mode\n{}",
            lints.len(),
            output
        )
        .into());
    }
    Ok(output)
}

/// Describes states, events and rules of a definition.
pub fn inspect(path: &Path) -> CommandResult<String> {
    let definition = load_definition(path)?;

    let mut output = format!(
        "{}\n  Initial: {}\n  Checksum: {}\n  Context: {}\n  States:",
        format!("Machine {}", definition.id.cyan()).bold(),
        definition.initial.as_str().yellow(),
        definition.checksum,
        format_json(&definition.context)
    );

    for state in definition.state_names() {
        let marker = if state == definition.initial.as_str() {
            " (initial)"
        } else {
            ""
        };
        output.push_str(&format!("\n    {}{}", state.yellow(), marker));

        for event in definition.events_from(state) {
            for (index, rule) in definition.rules_for(state, event).iter().enumerate() {
                let target = rule
                    .target
                    .as_ref()
                    .map(|t| t.as_str().to_string())
                    .unwrap_or_else(|| "(internal)".to_string());
                let mut line = format!("\n      {} #{} -> {}", event.cyan(), index, target);
                if let Some(guard) = &rule.guard {
                    line.push_str(&format!(" [guard: {}]", guard.label()));
                }
                if !rule.actions.is_empty() {
                    let names: Vec<&str> = rule.actions.iter().map(|a| a.name()).collect();
                    line.push_str(&format!(" [actions: {}]", names.join(", ")));
                }
                output.push_str(&line);
            }
        }
    }

    for lint in definition.lints() {
        output.push_str(&format!("\n  {}: {}", "Warning".yellow(), lint));
    }
    Ok(output)
}

/// Options for [`run`].
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub context: Option<Value>,
    pub format: OutputFormat,
    pub stop_on_error: bool,
}

/// Starts an instance and feeds it one event per non-empty input line.
///
/// Each line is a JSON event object or a bare event type string. One output
/// line is written per processed event.
pub fn run(
    path: &Path,
    events: impl BufRead,
    options: &RunOptions,
    out: &mut impl Write,
) -> CommandResult<RunSummary> {
    let machine = Machine::new(load_definition(path)?, Implementations::new()).map_err(|e| {
        format!(
            "{}; run only provides the builtin actions 'assign' and 'assignEvent', \
             use {{\"expr\": ...}} guards instead of named ones",
            e
        )
    })?;
    let mut instance = match &options.context {
        Some(context) => machine.start_with_context(context.clone()),
        None => machine.start(),
    };

    let _trace = instance.subscribe(|snapshot| {
        tracing::debug!(state = snapshot.value(), "snapshot emitted");
    })?;

    let start = instance.snapshot()?;
    write_line(out, options.format, 0, "start", Ok(&start), true)?;

    let mut summary = RunSummary::default();
    for (index, line) in events.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let line_no = index + 1;

        let event = match parse_event_line(trimmed) {
            Ok(event) => event,
            Err(e) => {
                summary.failed += 1;
                if options.stop_on_error {
                    return Err(format!("line {}: {}", line_no, e).into());
                }
                write_error(out, options.format, line_no, trimmed, &e.to_string())?;
                continue;
            }
        };

        let before = instance.sequence();
        let result = instance.send(event.clone());
        summary.processed += 1;

        match result {
            Ok(snapshot) => {
                let changed = instance.sequence() != before;
                write_line(out, options.format, line_no, event.event_type(), Ok(&snapshot), changed)?;
            }
            Err(e) => {
                summary.failed += 1;
                tracing::warn!(line = line_no, event = event.event_type(), error = %e, "event failed");
                if options.stop_on_error {
                    return Err(format!("line {}: {}", line_no, e).into());
                }
                write_line(out, options.format, line_no, event.event_type(), Err(&e), false)?;
            }
        }
    }

    summary.transitions = instance.sequence();
    instance.dispose();
    Ok(summary)
}

fn parse_event_line(line: &str) -> Result<Event, CoreError> {
    let json: Value = serde_json::from_str(line)?;
    Event::from_json(&json)
}

fn write_line(
    out: &mut impl Write,
    format: OutputFormat,
    line: usize,
    event: &str,
    result: Result<&statechart_core::Snapshot, &CoreError>,
    changed: bool,
) -> CommandResult<()> {
    match (format, result) {
        (OutputFormat::Json, Ok(snapshot)) => {
            let record = json!({
                "line": line,
                "event": event,
                "changed": changed,
                "state": snapshot.value(),
                "context": snapshot.context(),
            });
            writeln!(out, "{}", record)?;
        }
        (OutputFormat::Json, Err(e)) => {
            let record = json!({
                "line": line,
                "event": event,
                "error": {"code": e.error_code(), "message": e.to_string()},
            });
            writeln!(out, "{}", record)?;
        }
        (OutputFormat::Pretty, Ok(snapshot)) => {
            let status = if changed {
                "->".green()
            } else {
                "ignored".dimmed()
            };
            writeln!(
                out,
                "{:>4} {} {} {} {}",
                line,
                event.cyan(),
                status,
                snapshot.value().yellow(),
                snapshot.context()
            )?;
        }
        (OutputFormat::Pretty, Err(e)) => {
            writeln!(
                out,
                "{:>4} {} {}: {}",
                line,
                event.cyan(),
                "Error".red(),
                e
            )?;
        }
    }
    Ok(())
}

fn write_error(
    out: &mut impl Write,
    format: OutputFormat,
    line: usize,
    input: &str,
    message: &str,
) -> CommandResult<()> {
    match format {
        OutputFormat::Json => {
            let record = json!({
                "line": line,
                "input": input,
                "error": {"code": "CONFIGURATION_ERROR", "message": message},
            });
            writeln!(out, "{}", record)?;
        }
        OutputFormat::Pretty => {
            writeln!(out, "{:>4} {}: {} ({})", line, "Error".red(), message, input)?;
        }
    }
    Ok(())
}

fn join(names: &BTreeSet<&str>) -> String {
    names.iter().copied().collect::<Vec<_>>().join(", ")
}

/// Formats JSON for display.
fn format_json(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    const TOGGLE: &str = r#"{
        "id": "toggle",
        "initial": "inactive",
        "context": {"count": 0},
        "states": {
            "inactive": {"on": {"TOGGLE": {"target": "active", "actions": {"type": "assign", "params": {"on": true}}}}},
            "active": {"on": {"TOGGLE": "inactive"}}
        }
    }"#;

    fn write_file(dir: &TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    fn json_options() -> RunOptions {
        RunOptions {
            context: None,
            format: OutputFormat::Json,
            stop_on_error: true,
        }
    }

    fn records(out: &[u8]) -> Vec<Value> {
        String::from_utf8(out.to_vec())
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_load_yaml_and_json() {
        let dir = TempDir::new().unwrap();
        let json_path = write_file(&dir, "toggle.json", TOGGLE);
        let yaml_path = write_file(
            &dir,
            "toggle.yaml",
            "id: toggle\ninitial: a\nstates:\n  a:\n    on:\n      GO: b\n  b: {}\n",
        );

        assert_eq!(load_definition(&json_path).unwrap().id, "toggle");
        assert_eq!(load_definition(&yaml_path).unwrap().initial.as_str(), "a");
    }

    #[test]
    fn test_load_invalid_definition() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "bad.json", r#"{"initial": "missing", "states": {"a": {}}}"#);
        assert!(load_definition(&path).is_err());
        assert!(load_definition(&dir.path().join("absent.json")).is_err());
    }

    #[test]
    fn test_validate_strict_fails_on_lint() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "shadow.json",
            r#"{"initial": "a", "states": {"a": {"on": {"GO": ["b", "c"]}}, "b": {}, "c": {}}}"#,
        );

        let output = validate(&path, false).unwrap();
        assert!(output.contains("unreachable"));
        assert!(validate(&path, true).is_err());
    }

    #[test]
    fn test_validate_lists_host_implementations() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "host.json",
            r#"{"initial": "a", "states": {"a": {"on": {"GO": {"target": "a", "guard": "isReady", "actions": ["log", "assign"]}}}}}"#,
        );

        let output = validate(&path, true).unwrap();
        assert!(output.contains("isReady"));
        assert!(output.contains("log"));
        assert!(!output.contains("Host actions: assign"));
    }

    #[test]
    fn test_inspect_lists_rules() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "toggle.json", TOGGLE);

        let output = inspect(&path).unwrap();
        assert!(output.contains("inactive"));
        assert!(output.contains("TOGGLE"));
        assert!(output.contains("actions: assign"));
    }

    #[test]
    fn test_run_json_output() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "toggle.json", TOGGLE);
        let input = Cursor::new("\"TOGGLE\"\n\n{\"type\": \"NOPE\"}\n{\"type\": \"TOGGLE\"}\n");

        let mut out = Vec::new();
        let summary = run(&path, input, &json_options(), &mut out).unwrap();

        assert_eq!(
            summary,
            RunSummary {
                processed: 3,
                transitions: 2,
                failed: 0
            }
        );

        let records = records(&out);
        assert_eq!(records.len(), 4);
        assert_eq!(records[0]["state"], "inactive");
        assert_eq!(records[1]["state"], "active");
        assert_eq!(records[1]["context"]["on"], true);
        assert_eq!(records[2]["changed"], false);
        assert_eq!(records[3]["state"], "inactive");
        assert_eq!(records[3]["line"], 4);
    }

    #[test]
    fn test_run_with_initial_context() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "toggle.json", TOGGLE);

        let options = RunOptions {
            context: Some(json!({"count": 7})),
            ..json_options()
        };
        let mut out = Vec::new();
        run(&path, Cursor::new(""), &options, &mut out).unwrap();

        let records = records(&out);
        assert_eq!(records[0]["context"]["count"], 7);
    }

    #[test]
    fn test_run_stop_on_error() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "toggle.json", TOGGLE);

        let mut out = Vec::new();
        let err = run(&path, Cursor::new("not json\n\"TOGGLE\"\n"), &json_options(), &mut out)
            .unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn test_run_continue_on_error() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "toggle.json", TOGGLE);

        let options = RunOptions {
            stop_on_error: false,
            ..json_options()
        };
        let mut out = Vec::new();
        let summary = run(&path, Cursor::new("not json\n\"TOGGLE\"\n"), &options, &mut out).unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.processed, 1);
        let records = records(&out);
        assert_eq!(records[1]["error"]["code"], "CONFIGURATION_ERROR");
        assert_eq!(records[2]["state"], "active");
    }

    #[test]
    fn test_run_rejects_unknown_host_action() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "host.json",
            r#"{"initial": "a", "states": {"a": {"on": {"GO": {"actions": "sendEmail"}}}}}"#,
        );

        let mut out = Vec::new();
        let err = run(&path, Cursor::new(""), &json_options(), &mut out).unwrap_err();
        assert!(err.to_string().contains("sendEmail"));
        assert!(err.to_string().contains("builtin actions 'assign' and 'assignEvent'"));
        assert!(out.is_empty());
    }

    #[test]
    fn test_run_rejects_named_guard_with_hint() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "guarded.yaml",
            "initial: a\nstates:\n  a:\n    on:\n      GO: {target: a, guard: isReady}\n",
        );

        let mut out = Vec::new();
        let err = run(&path, Cursor::new(""), &json_options(), &mut out).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("unknown guard 'isReady'"));
        assert!(message.contains(r#"{"expr": ...}"#));
    }

    #[test]
    fn test_run_pretty_output() {
        colored::control::set_override(false);
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "toggle.json", TOGGLE);

        let options = RunOptions {
            format: OutputFormat::Pretty,
            ..json_options()
        };
        let mut out = Vec::new();
        run(&path, Cursor::new("\"TOGGLE\"\n\"NOPE\"\n"), &options, &mut out).unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("TOGGLE -> active"));
        assert!(text.contains("NOPE ignored active"));
    }
}
