//! LLM client abstraction used by the fallback analyzer.
//!
//! The [`LlmClient`] trait is the only seam between the healer and a paid
//! model. The production implementation, [`ClaudeClient`], shells out to the
//! `claude` CLI; [`MockLlmClient`] provides scripted responses for tests.
//!
//! # Example
//!
//! ```rust,ignore
//! use ralph_healer::llm::{LlmClient, ClaudeClient};
//!
//! let client: Box<dyn LlmClient> = Box::new(ClaudeClient::new(".").with_model("haiku"));
//! let response = client.run_prompt("Diagnose: segfault in worker").await?;
//! ```

use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command as AsyncCommand;
use tracing::debug;

/// Abstraction for LLM client operations.
///
/// Object-safe and `Send + Sync`, so analyzers hold it as
/// `Arc<dyn LlmClient>` and share it across tasks.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Run a prompt and return the model's raw response text.
    ///
    /// # Errors
    ///
    /// Returns an error if the model cannot be reached, the call times out,
    /// or the process exits unsuccessfully.
    async fn run_prompt(&self, prompt: &str) -> Result<String>;

    /// Model identifier, also used as the admission-control key.
    fn model_name(&self) -> &str;
}

// =============================================================================
// Claude CLI client
// =============================================================================

/// Claude Code CLI client.
///
/// Runs `claude -p --model <variant> --output-format text` with the prompt on
/// stdin. The child is killed if it outlives the configured timeout.
#[derive(Debug, Clone)]
pub struct ClaudeClient {
    /// Working directory for Claude CLI execution.
    project_dir: PathBuf,
    /// Model variant to use.
    model: String,
    /// Timeout for one call.
    timeout: Duration,
}

impl ClaudeClient {
    /// Default call timeout (2 minutes).
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

    /// Create a new Claude client for the given project directory.
    #[must_use]
    pub fn new<P: Into<PathBuf>>(project_dir: P) -> Self {
        Self {
            project_dir: project_dir.into(),
            model: "sonnet".to_string(),
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    /// Set the model variant to use ("opus", "sonnet", "haiku", or a full id).
    #[must_use]
    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    /// Set the call timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Check whether the `claude` CLI is on `PATH`.
    #[must_use]
    pub fn is_available() -> bool {
        which::which("claude").is_ok()
    }
}

#[async_trait]
impl LlmClient for ClaudeClient {
    async fn run_prompt(&self, prompt: &str) -> Result<String> {
        let args = ["-p", "--model", &self.model, "--output-format", "text"];

        debug!(
            "[healer] Running Claude with model {} ({} chars prompt)",
            self.model,
            prompt.len()
        );

        let mut child = AsyncCommand::new("claude")
            .args(args)
            .current_dir(&self.project_dir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    anyhow::anyhow!("The 'claude' CLI is not installed or not in PATH")
                } else {
                    anyhow::anyhow!("Failed to spawn claude process: {}", e)
                }
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(prompt.as_bytes()).await?;
            stdin.flush().await?;
            drop(stdin);
        }

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => anyhow::bail!("Claude call timed out after {}s", self.timeout.as_secs()),
        };

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "Claude process exited with code {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )
        }
    }

    fn model_name(&self) -> &str {
        match self.model.as_str() {
            "opus" => "claude-opus-4",
            "sonnet" => "claude-sonnet-4",
            "haiku" => "claude-haiku-3.5",
            other => other,
        }
    }
}

// =============================================================================
// Mock client
// =============================================================================

/// Mock LLM client for testing.
///
/// ```rust,ignore
/// let client = MockLlmClient::new()
///     .with_response(r#"{"rootCause":"x","suggestedFixes":[],"confidence":0.5}"#);
/// ```
#[derive(Debug)]
pub struct MockLlmClient {
    /// Response to return from `run_prompt`.
    response: String,
    /// Error to return (if set).
    error: Option<String>,
    /// Model name to return.
    model: String,
    /// Artificial latency per call.
    delay: Option<Duration>,
    /// Count of prompt calls.
    call_count: AtomicU32,
    /// Number of calls to fail before succeeding.
    fail_count: AtomicU32,
    /// Error message for fail_count failures.
    fail_error: Option<String>,
    /// Most recent prompt.
    last_prompt: Mutex<Option<String>>,
}

impl Default for MockLlmClient {
    fn default() -> Self {
        Self {
            response: String::new(),
            error: None,
            model: "mock-llm".to_string(),
            delay: None,
            call_count: AtomicU32::new(0),
            fail_count: AtomicU32::new(0),
            fail_error: None,
            last_prompt: Mutex::new(None),
        }
    }
}

impl MockLlmClient {
    /// Create a new mock client with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the response to return.
    #[must_use]
    pub fn with_response(mut self, response: &str) -> Self {
        self.response = response.to_string();
        self
    }

    /// Configure the mock to always return an error.
    #[must_use]
    pub fn with_error(mut self, error: &str) -> Self {
        self.error = Some(error.to_string());
        self
    }

    /// Set the model name.
    #[must_use]
    pub fn with_model_name(mut self, name: &str) -> Self {
        self.model = name.to_string();
        self
    }

    /// Sleep this long inside every call.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Configure the mock to fail the first N calls, then succeed.
    #[must_use]
    pub fn with_fail_count(mut self, count: u32, error: &str) -> Self {
        self.fail_count = AtomicU32::new(count);
        self.fail_error = Some(error.to_string());
        self
    }

    /// Get the number of times `run_prompt` was called.
    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }

    /// The last prompt received, if any.
    pub fn last_prompt(&self) -> Option<String> {
        self.last_prompt.lock().ok().and_then(|p| p.clone())
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn run_prompt(&self, prompt: &str) -> Result<String> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.last_prompt.lock() {
            *last = Some(prompt.to_string());
        }

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let current_fail_count = self.fail_count.load(Ordering::SeqCst);
        if current_fail_count > 0 {
            self.fail_count.fetch_sub(1, Ordering::SeqCst);
            match self.fail_error {
                Some(ref fail_error) => anyhow::bail!("{}", fail_error),
                None => anyhow::bail!("Mock failure"),
            }
        }

        if let Some(ref error) = self.error {
            anyhow::bail!("{}", error)
        }

        Ok(self.response.clone())
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
