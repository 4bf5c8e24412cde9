//! A [`TaskRunner`] that runs each task as a shell command.
//!
//! The command comes from the `command` key of the task input. The whole
//! input is handed to the child as JSON in `CONDUCTOR_INPUT`. Stdout that
//! parses as a JSON object becomes the task result; anything else is
//! returned as `{"stdout": "..."}`. A non-zero exit is retryable.

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use crate::clog_debug;
use crate::core::{ContextMap, TaskError};
use crate::orchestration::{TaskInvocation, TaskRunner};

pub const COMMAND_KEY: &str = "command";
pub const INPUT_ENV: &str = "CONDUCTOR_INPUT";

#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: String,
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }
}

impl ShellRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use another POSIX shell (must accept `-c`).
    pub fn with_shell(mut self, shell: &str) -> Self {
        self.shell = shell.to_string();
        self
    }
}

#[async_trait]
impl TaskRunner for ShellRunner {
    async fn execute(&self, invocation: TaskInvocation) -> Result<ContextMap, TaskError> {
        let command = invocation
            .input
            .get(COMMAND_KEY)
            .and_then(Value::as_str)
            .ok_or_else(|| TaskError::fatal(format!("task {} has no command", invocation.name)))?
            .to_string();
        let input = serde_json::to_string(&invocation.input)
            .map_err(|e| TaskError::fatal(format!("cannot encode input: {}", e)))?;

        clog_debug!(
            "ShellRunner task={} attempt={} cmd={}",
            invocation.task_id,
            invocation.attempt,
            command
        );
        let output = Command::new(&self.shell)
            .arg("-c")
            .arg(&command)
            .env(INPUT_ENV, input)
            .env("CONDUCTOR_TASK_ID", invocation.task_id.as_str())
            .env("CONDUCTOR_ATTEMPT", invocation.attempt.to_string())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| TaskError::fatal(format!("failed to spawn {}: {}", self.shell, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return Err(TaskError::retryable(format!(
                "exit {}: {}",
                code,
                stderr.trim()
            )));
        }

        Ok(parse_stdout(&String::from_utf8_lossy(&output.stdout)))
    }
}

fn parse_stdout(stdout: &str) -> ContextMap {
    match serde_json::from_str::<Value>(stdout.trim()) {
        Ok(Value::Object(map)) => map.into_iter().collect(),
        _ => ContextMap::from([(
            "stdout".to_string(),
            Value::String(stdout.trim_end().to_string()),
        )]),
    }
}
