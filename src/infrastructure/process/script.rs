//! Script execution in a separate OS process
//!
//! The node's code is appended to the configured program arguments
//! (`sh -c <code>`, `python3 -c <code>`, ...). The request is written to the
//! child's stdin as JSON; the child answers on stdout with
//! `{"decision": "...", "variables": {...}}`.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::domain::process::{EngineError, ScriptExecutor, ScriptOutput, ScriptRequest};

#[derive(Debug, Clone)]
pub struct CommandScriptExecutor {
    program: String,
    args: Vec<String>,
}

impl Default for CommandScriptExecutor {
    fn default() -> Self {
        Self::new("sh", vec!["-c".to_string()])
    }
}

impl CommandScriptExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    async fn run(&self, request: &ScriptRequest) -> Result<ScriptOutput, EngineError> {
        let input = serde_json::to_vec(request)
            .map_err(|e| EngineError::script(format!("Failed to serialize request: {}", e)))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(&request.code)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::script(format!("Failed to spawn '{}': {}", self.program, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A script that ignores its input may close stdin early
            let _ = stdin.write_all(&input).await;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| EngineError::script(format!("Failed to wait for script: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::script(format!(
                "Script exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        if stdout.is_empty() {
            return Ok(ScriptOutput::default());
        }

        serde_json::from_str(stdout)
            .map_err(|e| EngineError::script(format!("Invalid script output: {}", e)))
    }
}

#[async_trait]
impl ScriptExecutor for CommandScriptExecutor {
    async fn execute(&self, request: ScriptRequest) -> Result<ScriptOutput, EngineError> {
        debug!(
            instance_id = %request.instance_id,
            node_id = %request.node_id,
            timeout_ms = request.timeout.as_millis() as u64,
            "Running script"
        );

        match tokio::time::timeout(request.timeout, self.run(&request)).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::script(format!(
                "Script timed out after {}ms",
                request.timeout.as_millis()
            ))),
        }
    }
}
