//! Process adapter
//!
//! Runs a local command (llama.cpp, an ollama CLI, any stdin/stdout tool) as
//! the backend: write the formatted request to stdin, close it, read stdout
//! to EOF, kill the child if the deadline passes.
//!
//! Input shaping (`config.input_format`): `json` sends the whole request,
//! `prompt` a `System:/User:/Assistant:` transcript, `openai` just
//! `{"messages": ...}`, anything else the last user text. Output parsing
//! (`config.output_format = "json"`) recognises a full OpenAI response, a
//! bare `{"content": ...}` object, or falls back to raw text.
//!
//! `command` and each `args` element take `ENV:VAR_NAME` placeholders, so
//! tool paths and token-bearing flags can stay out of models.json.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::{resolve_env, ModelBinding};
use crate::error::GatewayError;
use crate::wire::{now_unix, ChatRequest, ChatResponse};

use super::{effective_timeout, replay_as_stream, ChatAdapter, ChunkStream};

/// Grace period between the kill signal and reaping a timed-out child.
const KILL_GRACE: Duration = Duration::from_secs(2);

pub struct ProcessAdapter {
    binding: ModelBinding,
}

impl ProcessAdapter {
    pub fn new(binding: ModelBinding) -> Self {
        Self { binding }
    }

    /// The executable, with `ENV:VAR` placeholders resolved; an unset
    /// variable leaves the command unconfigured.
    fn command(&self) -> Option<String> {
        let command = resolve_env(self.binding.config.command.as_deref()?);
        (!command.is_empty()).then_some(command)
    }

    /// Arguments with per-element `ENV:VAR` resolution; an unset variable
    /// keeps the literal argument.
    fn resolved_args(&self) -> Vec<String> {
        self.binding
            .config
            .args
            .iter()
            .map(|arg| match arg.strip_prefix("ENV:") {
                Some(var) => std::env::var(var).unwrap_or_else(|_| arg.clone()),
                None => arg.clone(),
            })
            .collect()
    }

    fn format_input(&self, req: &ChatRequest) -> Result<String, GatewayError> {
        let format = self
            .binding
            .config
            .input_format
            .as_deref()
            .unwrap_or("json");
        match format {
            "json" => serde_json::to_string(req)
                .map_err(|e| GatewayError::Internal(format!("request serialization: {e}"))),
            "prompt" => Ok(req.transcript()),
            "openai" => Ok(json!({"messages": req.messages}).to_string()),
            _ => Ok(req.last_user_text().unwrap_or_default()),
        }
    }

    fn parse_output(&self, stdout: &str) -> ChatResponse {
        let stdout = stdout.trim();
        let fallback_id = format!("process-{}", now_unix());
        let model = self.binding.upstream_model();

        if self.binding.config.output_format.as_deref() == Some("json") {
            if let Ok(value) = serde_json::from_str::<Value>(stdout) {
                // A full OpenAI-shaped response passes through as-is
                if value.get("choices").is_some() {
                    if let Ok(resp) = serde_json::from_value::<ChatResponse>(value.clone()) {
                        return resp;
                    }
                }
                // A bare {content} object
                if let Some(content) = value.get("content").and_then(Value::as_str) {
                    return ChatResponse::assistant(fallback_id, model, content, "stop", None);
                }
                // Anything else: the JSON text itself is the reply
                return ChatResponse::assistant(fallback_id, model, value.to_string(), "stop", None);
            }
        }

        ChatResponse::assistant(fallback_id, model, stdout, "stop", None)
    }
}

/// Resolve a bare command name against PATH; paths are checked directly.
fn command_exists(command: &str) -> bool {
    if command.contains('/') || command.contains('\\') {
        return Path::new(command).is_file();
    }
    std::env::var_os("PATH")
        .map(|paths| {
            std::env::split_paths(&paths).any(|dir| dir.join(command).is_file())
        })
        .unwrap_or(false)
}

#[async_trait]
impl ChatAdapter for ProcessAdapter {
    fn family(&self) -> &'static str {
        "process"
    }

    fn binding(&self) -> &ModelBinding {
        &self.binding
    }

    fn is_available(&self) -> Result<(), GatewayError> {
        let Some(command) = self.command() else {
            return Err(GatewayError::Config("missing command".to_string()));
        };
        if !command_exists(&command) {
            return Err(GatewayError::Config(format!("command not found: {command}")));
        }
        Ok(())
    }

    async fn chat(
        &self,
        req: &ChatRequest,
        timeout: Option<Duration>,
    ) -> Result<ChatResponse, GatewayError> {
        let command = self
            .command()
            .ok_or_else(|| GatewayError::Config("missing command".to_string()))?;
        let timeout = effective_timeout(&self.binding, timeout);
        let input = self.format_input(req)?;

        let mut cmd = Command::new(&command);
        cmd.args(self.resolved_args())
            .envs(&self.binding.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.binding.config.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| GatewayError::Internal(format!("failed to spawn {command}: {e}")))?;

        // Close stdin after writing so the child sees EOF and can't block us
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(input.as_bytes())
                .await
                .map_err(|e| GatewayError::Internal(format!("stdin write failed: {e}")))?;
        }

        let mut stdout_pipe = child
            .stdout
            .take()
            .ok_or_else(|| GatewayError::Internal("child stdout not captured".to_string()))?;
        let mut stderr_pipe = child.stderr.take();

        let mut stdout = Vec::new();
        match tokio::time::timeout(timeout, stdout_pipe.read_to_end(&mut stdout)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                let _ = child.kill().await;
                return Err(GatewayError::Internal(format!("stdout read failed: {e}")));
            }
            Err(_) => {
                // Deadline passed: signal, give it a moment, then reap
                let _ = child.start_kill();
                let _ = tokio::time::timeout(KILL_GRACE, child.wait()).await;
                let _ = child.kill().await;
                return Err(GatewayError::Timeout(timeout));
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| GatewayError::Internal(format!("wait failed: {e}")))?;

        if !status.success() {
            let mut stderr = String::new();
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = tokio::time::timeout(
                    Duration::from_secs(1),
                    pipe.read_to_string(&mut stderr),
                )
                .await;
            }
            let detail = stderr.lines().next().unwrap_or("").trim();
            return Err(GatewayError::UpstreamProtocol(format!(
                "process exited with {status}: {detail}"
            )));
        }

        Ok(self.parse_output(&String::from_utf8_lossy(&stdout)))
    }

    async fn chat_stream(
        &self,
        req: &ChatRequest,
        timeout: Option<Duration>,
    ) -> Result<ChunkStream, GatewayError> {
        let resp = self.chat(req, timeout).await?;
        Ok(replay_as_stream(resp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn adapter(config: Value) -> ProcessAdapter {
        let binding: ModelBinding = serde_json::from_value(json!({
            "id": "local", "adapter": "process", "model": "local-cli",
            "timeout": 5,
            "config": config
        }))
        .unwrap();
        ProcessAdapter::new(binding)
    }

    fn request() -> ChatRequest {
        serde_json::from_value(json!({
            "model": "local",
            "messages": [
                {"role": "system", "content": "be terse"},
                {"role": "user", "content": "hi"}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_availability() {
        assert!(adapter(json!({"command": "cat"})).is_available().is_ok());
        assert!(adapter(json!({})).is_available().is_err());
        assert!(adapter(json!({"command": "/no/such/bin"}))
            .is_available()
            .is_err());
    }

    #[test]
    fn test_env_placeholder_command() {
        std::env::set_var("OMNIGATE_TEST_PROCESS_CMD", "cat");
        let a = adapter(json!({"command": "ENV:OMNIGATE_TEST_PROCESS_CMD"}));
        assert_eq!(a.command().as_deref(), Some("cat"));
        assert!(a.is_available().is_ok());

        // Unset variable means unconfigured, not a literal "ENV:..." command
        let a = adapter(json!({"command": "ENV:OMNIGATE_TEST_UNSET_CMD"}));
        assert!(a.command().is_none());
        assert!(a.is_available().is_err());
    }

    #[test]
    fn test_env_placeholder_args_keep_literal_when_unset() {
        let a = adapter(json!({
            "command": "cat",
            "args": ["ENV:OMNIGATE_TEST_UNSET_ARG", "plain"]
        }));
        assert_eq!(
            a.resolved_args(),
            vec!["ENV:OMNIGATE_TEST_UNSET_ARG".to_string(), "plain".to_string()]
        );

        std::env::set_var("OMNIGATE_TEST_PROCESS_ARG", "--fast");
        let a = adapter(json!({
            "command": "cat",
            "args": ["ENV:OMNIGATE_TEST_PROCESS_ARG", "plain"]
        }));
        assert_eq!(
            a.resolved_args(),
            vec!["--fast".to_string(), "plain".to_string()]
        );
    }

    #[test]
    fn test_input_formats() {
        let a = adapter(json!({"command": "cat", "input_format": "prompt"}));
        assert_eq!(a.format_input(&request()).unwrap(), "System: be terse\nUser: hi");

        let a = adapter(json!({"command": "cat", "input_format": "openai"}));
        let v: Value = serde_json::from_str(&a.format_input(&request()).unwrap()).unwrap();
        assert_eq!(v["messages"].as_array().unwrap().len(), 2);
        assert!(v.get("model").is_none());

        let a = adapter(json!({"command": "cat", "input_format": "last"}));
        assert_eq!(a.format_input(&request()).unwrap(), "hi");

        let a = adapter(json!({"command": "cat"}));
        let v: Value = serde_json::from_str(&a.format_input(&request()).unwrap()).unwrap();
        assert_eq!(v["model"], "local");
    }

    #[tokio::test]
    async fn test_cat_echo_roundtrip() {
        // `cat` echoes stdin; with prompt input the reply is the transcript
        let a = adapter(json!({"command": "cat", "input_format": "prompt"}));
        let resp = a.chat(&request(), None).await.unwrap();
        assert_eq!(
            resp.choices[0].message.content.as_deref(),
            Some("System: be terse\nUser: hi")
        );
        assert_eq!(resp.choices[0].finish_reason.as_deref(), Some("stop"));
    }

    #[tokio::test]
    async fn test_json_output_ladder() {
        // Full OpenAI shape passes through
        let a = adapter(json!({"command": "cat", "output_format": "json"}));
        let openai = json!({
            "id": "x", "object": "chat.completion", "created": 1, "model": "m",
            "choices": [{"index": 0,
                "message": {"role": "assistant", "content": "full"},
                "finish_reason": "stop"}]
        });
        let resp = a.parse_output(&openai.to_string());
        assert_eq!(resp.id, "x");
        assert_eq!(resp.choices[0].message.content.as_deref(), Some("full"));

        // Bare {content}
        let resp = a.parse_output(r#"{"content": "bare"}"#);
        assert_eq!(resp.choices[0].message.content.as_deref(), Some("bare"));

        // Non-object JSON becomes text
        let resp = a.parse_output("[1,2]");
        assert_eq!(resp.choices[0].message.content.as_deref(), Some("[1,2]"));
    }

    #[tokio::test]
    async fn test_timeout_kills_child() {
        let binding: ModelBinding = serde_json::from_value(json!({
            "id": "slow", "adapter": "process", "timeout": 1,
            "config": {"command": "sleep", "args": ["30"], "input_format": "last"}
        }))
        .unwrap();
        let a = ProcessAdapter::new(binding);

        let started = std::time::Instant::now();
        let err = a.chat(&request(), None).await.unwrap_err();
        assert!(matches!(err, GatewayError::Timeout(_)));
        // Killed promptly, not after the child's 30s sleep
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_error() {
        let binding: ModelBinding = serde_json::from_value(json!({
            "id": "fail", "adapter": "process", "timeout": 5,
            "config": {"command": "false", "input_format": "last"}
        }))
        .unwrap();
        let err = ProcessAdapter::new(binding)
            .chat(&request(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamProtocol(_)));
    }

    #[tokio::test]
    async fn test_stream_replays_unary() {
        let a = adapter(json!({"command": "cat", "input_format": "last"}));
        let chunks: Vec<_> = a.chat_stream(&request(), None).await.unwrap().collect().await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(
            chunks[0].as_ref().unwrap().choices[0].delta.content.as_deref(),
            Some("hi")
        );
        assert!(chunks[1].as_ref().unwrap().is_terminal());
    }
}
