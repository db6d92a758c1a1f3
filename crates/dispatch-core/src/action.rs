//! Action records and execution outcomes.
//!
//! An `ActionRecord` is one row of the remote `actions` collection: an opaque
//! store-assigned id, a shell command, and a `result` that stays null until
//! this system writes the outcome back. An `ExecutionOutcome` is what the
//! container backend reports for one command; `to_result_text()` renders it
//! into the block that is stored in `result`.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

use crate::error::{DispatchError, Result};

/// Exit code reserved for "the command never ran" (container missing,
/// adapter failure). Never produced by a real process exit.
pub const NOT_RUN_EXIT_CODE: i32 = -1;

// ---------------------------------------------------------------------------
// ActionId
// ---------------------------------------------------------------------------

/// Store-assigned identifier. Stores hand out either integer keys or
/// string keys (uuids); both are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ActionId {
    Int(i64),
    Text(String),
}

impl ActionId {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(ActionId::Int),
            Value::String(s) if !s.is_empty() => Some(ActionId::Text(s.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionId::Int(n) => write!(f, "{n}"),
            ActionId::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for ActionId {
    fn from(n: i64) -> Self {
        ActionId::Int(n)
    }
}

impl From<&str> for ActionId {
    fn from(s: &str) -> Self {
        ActionId::Text(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// ActionRecord
// ---------------------------------------------------------------------------

/// One row of the actions collection.
///
/// Fields are optional because rows are produced by an external writer; a
/// row without a usable `id` or `command` is still returned by the store
/// client and rejected per record by the driver.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionRecord {
    pub id: Option<ActionId>,
    pub command: Option<String>,
    pub result: Option<Value>,
}

impl ActionRecord {
    /// A well-formed pending record.
    pub fn pending(id: impl Into<ActionId>, command: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            command: Some(command.into()),
            result: None,
        }
    }

    /// Build a record from a raw JSON row without failing on odd shapes.
    pub fn from_row(row: &Value) -> Self {
        Self {
            id: row.get("id").and_then(ActionId::from_value),
            command: row
                .get("command")
                .and_then(Value::as_str)
                .map(str::to_string),
            result: row.get("result").filter(|v| !v.is_null()).cloned(),
        }
    }

    /// `true` while no result has been written.
    pub fn is_pending(&self) -> bool {
        self.result.is_none()
    }

    /// The id rendered for log lines, or `"unknown"`.
    pub fn id_label(&self) -> String {
        self.id
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "unknown".to_string())
    }

    pub fn require_id(&self) -> Result<&ActionId> {
        self.id.as_ref().ok_or_else(|| DispatchError::MalformedRecord {
            id: self.id_label(),
            reason: "missing 'id'".into(),
        })
    }

    pub fn require_command(&self) -> Result<&str> {
        self.command
            .as_deref()
            .ok_or_else(|| DispatchError::MalformedRecord {
                id: self.id_label(),
                reason: "missing 'command'".into(),
            })
    }
}

// ---------------------------------------------------------------------------
// ExecutionOutcome
// ---------------------------------------------------------------------------

/// What happened when a command was handed to the container backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    /// Combined stdout/stderr of the command.
    pub stdout: String,
    /// Adapter-level failure text only; empty whenever the command ran.
    pub stderr: String,
    pub exit_code: i32,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionOutcome {
    /// The command ran and exited with `exit_code`.
    pub fn completed(stdout: impl Into<String>, exit_code: i32) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code,
            timestamp: Utc::now(),
        }
    }

    /// The command never ran; `reason` ends up in the `Errors:` section.
    pub fn not_run(reason: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: reason.into(),
            exit_code: NOT_RUN_EXIT_CODE,
            timestamp: Utc::now(),
        }
    }

    pub fn ran(&self) -> bool {
        self.exit_code != NOT_RUN_EXIT_CODE
    }

    /// Render the text block written to the record's `result` column.
    ///
    /// ```text
    /// Exit Code: <int>
    /// Timestamp: <rfc3339>
    /// Output:
    /// <stdout>
    /// Errors:          (only when stderr is non-empty)
    /// <stderr>
    /// ```
    pub fn to_result_text(&self) -> String {
        let mut text = format!(
            "Exit Code: {}\nTimestamp: {}\nOutput:\n{}",
            self.exit_code,
            self.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
            self.stdout
        );
        if !self.stderr.is_empty() {
            text.push_str("\nErrors:\n");
            text.push_str(&self.stderr);
        }
        text
    }
}
