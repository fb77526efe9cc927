//! External Command Lifecycle
//!
//! Some platform objects (the Unity catalog integration) have no declarative
//! API yet and are managed through a create/update/delete triple of external
//! executables instead. This module is the narrow boundary around them:
//!
//! - inputs travel as environment variables, secrets included, so nothing
//!   sensitive is written to disk or placed on a command line
//! - create and update must print a JSON object with a non-empty `id`
//! - delete may print nothing
//!
//! Swapping the scripts for a native client means replacing the
//! [`ScriptInvoker`] implementation; callers do not change.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Mutex;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// Create/update/delete commands for one externally managed object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandTriple {
    pub create_command: String,
    pub update_command: String,
    pub delete_command: String,
}

impl CommandTriple {
    pub fn command(&self, op: CommandOp) -> &str {
        match op {
            CommandOp::Create => &self.create_command,
            CommandOp::Update => &self.update_command,
            CommandOp::Delete => &self.delete_command,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandOp {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for CommandOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandOp::Create => write!(f, "create"),
            CommandOp::Update => write!(f, "update"),
            CommandOp::Delete => write!(f, "delete"),
        }
    }
}

/// Parsed command output
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutput {
    /// Identifier of the managed object (empty for a silent delete)
    pub id: String,
    /// Full JSON object printed by the command
    pub body: Value,
    /// Raw stdout, trimmed
    pub raw: String,
}

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("failed to start {op} command '{command}': {source}")]
    Spawn {
        op: CommandOp,
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{op} command '{command}' exited with {status}: {stderr}")]
    Failed {
        op: CommandOp,
        command: String,
        status: String,
        stderr: String,
    },

    #[error("{op} command '{command}' produced malformed output: {reason}")]
    Malformed {
        op: CommandOp,
        command: String,
        reason: String,
    },
}

/// Runs one leg of a command triple
#[async_trait]
pub trait ScriptInvoker: Send + Sync {
    async fn invoke(
        &self,
        commands: &CommandTriple,
        op: CommandOp,
        env: &BTreeMap<String, String>,
    ) -> Result<CommandOutput, ScriptError>;
}

/// Validate what a command printed
pub fn parse_command_output(
    op: CommandOp,
    command: &str,
    stdout: &str,
) -> Result<CommandOutput, ScriptError> {
    let raw = stdout.trim();
    let malformed = |reason: String| ScriptError::Malformed {
        op,
        command: command.to_string(),
        reason,
    };

    if raw.is_empty() {
        return match op {
            CommandOp::Delete => Ok(CommandOutput {
                id: String::new(),
                body: Value::Null,
                raw: String::new(),
            }),
            _ => Err(malformed("no output".to_string())),
        };
    }

    let body: Value =
        serde_json::from_str(raw).map_err(|e| malformed(format!("not JSON ({})", e)))?;
    if !body.is_object() {
        return Err(malformed("expected a JSON object".to_string()));
    }

    let id = body
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string);

    match (id, op) {
        (Some(id), _) => Ok(CommandOutput {
            id,
            body,
            raw: raw.to_string(),
        }),
        (None, CommandOp::Delete) => Ok(CommandOutput {
            id: String::new(),
            body,
            raw: raw.to_string(),
        }),
        (None, _) => Err(malformed("missing string field 'id'".to_string())),
    }
}

/// Runs commands through `sh -c` with secrets passed in the environment
#[derive(Debug, Default)]
pub struct ProcessInvoker;

#[async_trait]
impl ScriptInvoker for ProcessInvoker {
    async fn invoke(
        &self,
        commands: &CommandTriple,
        op: CommandOp,
        env: &BTreeMap<String, String>,
    ) -> Result<CommandOutput, ScriptError> {
        let command = commands.command(op);
        info!(op = %op, command = %command, "Running external command");
        debug!(variables = ?env.keys().collect::<Vec<_>>(), "External command environment");

        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .envs(env)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| ScriptError::Spawn {
                op,
                command: command.to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(ScriptError::Failed {
                op,
                command: command.to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        parse_command_output(op, command, &String::from_utf8_lossy(&output.stdout))
    }
}

/// A recorded call to [`SimulatedInvoker`]
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub op: CommandOp,
    pub command: String,
    pub env: BTreeMap<String, String>,
}

/// Invoker that never spawns anything; used by `--simulate` and tests
#[derive(Debug, Default)]
pub struct SimulatedInvoker {
    calls: Mutex<Vec<RecordedCall>>,
    responses: Mutex<BTreeMap<String, String>>,
}

impl SimulatedInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Print `stdout` for every call of `op` instead of a generated object
    pub fn respond(&self, op: CommandOp, stdout: &str) {
        self.responses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(op.to_string(), stdout.to_string());
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl ScriptInvoker for SimulatedInvoker {
    async fn invoke(
        &self,
        commands: &CommandTriple,
        op: CommandOp,
        env: &BTreeMap<String, String>,
    ) -> Result<CommandOutput, ScriptError> {
        let command = commands.command(op).to_string();
        let call_number = {
            let mut calls = self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            calls.push(RecordedCall {
                op,
                command: command.clone(),
                env: env.clone(),
            });
            calls.len()
        };

        let canned = self
            .responses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&op.to_string())
            .cloned();
        let stdout = canned.unwrap_or_else(|| match op {
            CommandOp::Delete => String::new(),
            CommandOp::Update => match env.get("INTEGRATION_ID").filter(|id| !id.is_empty()) {
                Some(id) => serde_json::json!({ "id": id }).to_string(),
                None => serde_json::json!({ "id": format!("tci-sim{:04}", call_number) }).to_string(),
            },
            CommandOp::Create => serde_json::json!({ "id": format!("tci-sim{:04}", call_number) }).to_string(),
        });

        parse_command_output(op, &command, &stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triple(create: &str) -> CommandTriple {
        CommandTriple {
            create_command: create.to_string(),
            update_command: "exit 0".to_string(),
            delete_command: "true".to_string(),
        }
    }

    #[test]
    fn test_parse_requires_id() {
        let ok = parse_command_output(CommandOp::Create, "c", r#"{"id":"tci-1","spec":{}}"#).unwrap();
        assert_eq!(ok.id, "tci-1");

        let missing = parse_command_output(CommandOp::Create, "c", r#"{"spec":{}}"#);
        assert!(matches!(missing, Err(ScriptError::Malformed { .. })));

        let empty_id = parse_command_output(CommandOp::Update, "u", r#"{"id":""}"#);
        assert!(matches!(empty_id, Err(ScriptError::Malformed { .. })));
    }

    #[test]
    fn test_parse_rejects_non_json() {
        let err = parse_command_output(CommandOp::Create, "c", "Created!").unwrap_err();
        assert!(err.to_string().contains("malformed output"));

        let array = parse_command_output(CommandOp::Create, "c", r#"[{"id":"x"}]"#);
        assert!(array.is_err());
    }

    #[test]
    fn test_delete_may_be_silent() {
        let out = parse_command_output(CommandOp::Delete, "d", "  \n").unwrap();
        assert!(out.id.is_empty());
        assert!(parse_command_output(CommandOp::Create, "c", "").is_err());
    }

    #[tokio::test]
    async fn test_process_invoker_passes_environment() {
        let commands = triple(r#"printf '{"id":"%s"}' "$ENV_ID""#);
        let env = BTreeMap::from([("ENV_ID".to_string(), "env-abc123".to_string())]);

        let out = ProcessInvoker.invoke(&commands, CommandOp::Create, &env).await.unwrap();

        assert_eq!(out.id, "env-abc123");
    }

    #[tokio::test]
    async fn test_process_invoker_reports_failure() {
        let commands = triple("echo boom >&2; exit 3");
        let err = ProcessInvoker
            .invoke(&commands, CommandOp::Create, &BTreeMap::new())
            .await
            .unwrap_err();

        match err {
            ScriptError::Failed { stderr, .. } => assert_eq!(stderr, "boom"),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_simulated_invoker_records_calls() {
        let invoker = SimulatedInvoker::new();
        let env = BTreeMap::from([("KAFKA_ID".to_string(), "lkc-1".to_string())]);

        let created = invoker.invoke(&triple("create.sh"), CommandOp::Create, &env).await.unwrap();
        invoker.respond(CommandOp::Update, "not json");
        let updated = invoker.invoke(&triple("create.sh"), CommandOp::Update, &env).await;

        assert!(!created.id.is_empty());
        assert!(updated.is_err());
        let calls = invoker.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].env["KAFKA_ID"], "lkc-1");
    }
}
