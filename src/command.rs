//! # Out-of-band control commands.
//!
//! Commands travel as JSON objects `{"command": <name>, "parameters": {…}}`
//! and are delivered per node through the coordinator. The consumer
//! recognizes [`FREEZE`], [`UNFREEZE`], [`RUN_BALANCE`], and [`STOP_TASK`];
//! unknown names and malformed parameters are logged and dropped, never
//! fatal. Unknown parameter keys are tolerated so newer clients can talk to
//! older nodes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Stop claiming tasks and stop balancing; running tasks continue.
pub const FREEZE: &str = "freeze";

/// Resume claiming and balancing.
pub const UNFREEZE: &str = "unfreeze";

/// Run a balance pass immediately.
pub const RUN_BALANCE: &str = "run_balance";

/// Stop a single running task; requires a string `task` parameter.
pub const STOP_TASK: &str = "stop_task";

/// A named command with an arbitrary JSON parameter object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Command {
    command: String,
    #[serde(default)]
    parameters: Map<String, Value>,
}

impl Command {
    /// Creates a command with no parameters.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            command: name.into(),
            parameters: Map::new(),
        }
    }

    /// The [`FREEZE`] command.
    pub fn freeze() -> Self {
        Self::new(FREEZE)
    }

    /// The [`UNFREEZE`] command.
    pub fn unfreeze() -> Self {
        Self::new(UNFREEZE)
    }

    /// The [`RUN_BALANCE`] command.
    pub fn balance() -> Self {
        Self::new(RUN_BALANCE)
    }

    /// The [`STOP_TASK`] command targeting `task_id`.
    pub fn stop_task(task_id: impl Into<String>) -> Self {
        let mut parameters = Map::new();
        parameters.insert("task".to_string(), Value::String(task_id.into()));
        Self {
            command: STOP_TASK.to_string(),
            parameters,
        }
    }

    /// Command name.
    pub fn name(&self) -> &str {
        &self.command
    }

    /// Raw parameter object.
    pub fn parameters(&self) -> &Map<String, Value> {
        &self.parameters
    }

    /// The validated `task` parameter of a [`STOP_TASK`] command, or `None`
    /// when the parameter is missing or not a string.
    pub fn stop_task_target(&self) -> Option<&str> {
        self.parameters.get("task").and_then(Value::as_str)
    }

    /// Serializes the command to its wire form.
    pub fn to_json(&self) -> String {
        // A string map with JSON values cannot fail to serialize.
        serde_json::to_string(self).expect("command serialization")
    }

    /// Parses a command from its wire form.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_on_the_wire() {
        let cmd = Command::stop_task("t1");
        let parsed = Command::from_json(&cmd.to_json()).expect("parse");
        assert_eq!(parsed, cmd);
        assert_eq!(parsed.name(), STOP_TASK);
        assert_eq!(parsed.stop_task_target(), Some("t1"));
    }

    #[test]
    fn tolerates_unknown_parameters() {
        let raw = r#"{"command":"freeze","parameters":{"reason":"maintenance","depth":3}}"#;
        let cmd = Command::from_json(raw).expect("parse");
        assert_eq!(cmd.name(), FREEZE);
        assert_eq!(cmd.parameters().len(), 2);
    }

    #[test]
    fn missing_parameters_default_to_empty() {
        let cmd = Command::from_json(r#"{"command":"unfreeze"}"#).expect("parse");
        assert_eq!(cmd.name(), UNFREEZE);
        assert!(cmd.parameters().is_empty());
    }

    #[test]
    fn stop_task_target_rejects_non_strings() {
        let raw = r#"{"command":"stop_task","parameters":{"task":42}}"#;
        let cmd = Command::from_json(raw).expect("parse");
        assert_eq!(cmd.stop_task_target(), None);
    }
}
