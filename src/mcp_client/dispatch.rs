//! Retry policy and result normalization for dispatched calls.
//!
//! Everything a transport can produce, including every [`McpError`], ends up
//! as a [`ToolCallResult`] here.

use std::future::Future;
use std::time::{Duration, Instant};

use super::errors::McpError;
use super::session::PendingAuth;
use super::types::{AuthRequired, LoginRequired, ToolCallOutcome, ToolCallResult};

/// Retries after the first attempt.
const MAX_RETRIES: u32 = 1;

const DEFAULT_AUTH_MESSAGE: &str = "Please complete authentication using the provided link";

/// Whether repeating an operation is harmless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Idempotency {
    /// Discovery and probes.
    ReadOnly,
    /// Tool invocations.
    SideEffecting,
}

fn should_retry(err: &McpError, idempotency: Idempotency) -> bool {
    match idempotency {
        Idempotency::ReadOnly => err.is_transient() || matches!(err, McpError::Timeout { .. }),
        // Never risk running a tool twice.
        Idempotency::SideEffecting => err.is_transient() && !err.may_have_reached_server(),
    }
}

/// Run `attempt`, retrying once after `backoff` if the failure allows it.
pub async fn with_retry<T, F, Fut>(
    server: &str,
    operation: &str,
    backoff: Duration,
    idempotency: Idempotency,
    mut attempt: F,
) -> Result<T, McpError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, McpError>>,
{
    let mut tries = 0;
    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(e) if tries < MAX_RETRIES && should_retry(&e, idempotency) => {
                tries += 1;
                tracing::warn!(
                    server,
                    operation,
                    error = %e,
                    backoff_ms = backoff.as_millis() as u64,
                    "transient failure, retrying"
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Builds the envelope for one call and stamps its duration.
pub struct CallTimer {
    server: String,
    tool: String,
    started: Instant,
}

impl CallTimer {
    pub fn start(server: &str, tool: &str) -> Self {
        Self {
            server: server.to_string(),
            tool: tool.to_string(),
            started: Instant::now(),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn success(self, result: serde_json::Value) -> ToolCallResult {
        let execution_time_ms = self.elapsed_ms();
        tracing::info!(server = %self.server, tool = %self.tool, execution_time_ms, "tool call succeeded");
        ToolCallResult::Completed(ToolCallOutcome {
            success: true,
            result: Some(result),
            error: None,
            error_kind: None,
            server: self.server,
            tool: self.tool,
            execution_time_ms,
        })
    }

    /// The tool ran and reported an error itself.
    pub fn tool_error(self, message: String) -> ToolCallResult {
        let execution_time_ms = self.elapsed_ms();
        tracing::warn!(server = %self.server, tool = %self.tool, error = %message, "tool reported an error");
        ToolCallResult::Completed(ToolCallOutcome {
            success: false,
            result: None,
            error: Some(message),
            error_kind: None,
            server: self.server,
            tool: self.tool,
            execution_time_ms,
        })
    }

    pub fn failure(self, err: &McpError) -> ToolCallResult {
        let execution_time_ms = self.elapsed_ms();
        tracing::warn!(
            server = %self.server,
            tool = %self.tool,
            error = %err,
            kind = ?err.kind(),
            execution_time_ms,
            "tool call failed"
        );
        ToolCallResult::Completed(ToolCallOutcome {
            success: false,
            result: None,
            error: Some(err.to_string()),
            error_kind: Some(err.kind()),
            server: self.server,
            tool: self.tool,
            execution_time_ms,
        })
    }

    pub fn auth_required(self, pending: &PendingAuth, message: Option<String>) -> ToolCallResult {
        tracing::info!(
            server = %self.server,
            tool = %self.tool,
            session_id = %pending.session_id,
            "tool call requires login"
        );
        ToolCallResult::AuthRequired(AuthRequired {
            status: LoginRequired::LoginRequired,
            login_url: pending.login_url.clone(),
            session_id: pending.session_id.clone(),
            message: message.unwrap_or_else(|| DEFAULT_AUTH_MESSAGE.to_string()),
            server: self.server,
            tool: self.tool,
        })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn connection_failed() -> McpError {
        McpError::ConnectionFailed {
            server: "fi_mcp".into(),
            reason: "refused".into(),
        }
    }

    fn timeout() -> McpError {
        McpError::Timeout {
            server: "fi_mcp".into(),
            operation: "tools/call".into(),
            timeout_ms: 30_000,
        }
    }

    async fn run(
        idempotency: Idempotency,
        failures: Vec<McpError>,
    ) -> (Result<&'static str, McpError>, u32) {
        let attempts = AtomicU32::new(0);
        let failures = std::sync::Mutex::new(failures);
        let result = with_retry("fi_mcp", "op", Duration::from_millis(1), idempotency, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            let next = failures.lock().unwrap().pop();
            async move {
                match next {
                    Some(e) => Err(e),
                    None => Ok("done"),
                }
            }
        })
        .await;
        (result, attempts.load(Ordering::SeqCst))
    }

    #[tokio::test]
    async fn test_transient_error_is_retried_once() {
        let (result, attempts) = run(Idempotency::SideEffecting, vec![connection_failed()]).await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(attempts, 2);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_one_retry() {
        let (result, attempts) = run(
            Idempotency::SideEffecting,
            vec![connection_failed(), connection_failed()],
        )
        .await;
        assert!(matches!(result, Err(McpError::ConnectionFailed { .. })));
        assert_eq!(attempts, 2);
    }

    #[tokio::test]
    async fn test_protocol_error_is_not_retried() {
        let err = McpError::ProtocolError {
            code: -32601,
            message: "nope".into(),
            data: None,
        };
        let (result, attempts) = run(Idempotency::ReadOnly, vec![err]).await;
        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn test_timeout_retried_only_when_read_only() {
        let (result, attempts) = run(Idempotency::SideEffecting, vec![timeout()]).await;
        assert!(matches!(result, Err(McpError::Timeout { .. })));
        assert_eq!(attempts, 1);

        let (result, attempts) = run(Idempotency::ReadOnly, vec![timeout()]).await;
        assert!(result.is_ok());
        assert_eq!(attempts, 2);
    }

    #[tokio::test]
    async fn test_lost_reply_retried_only_when_read_only() {
        let lost = || McpError::ResponseLost {
            server: "local".into(),
            reason: "server stdout closed".into(),
        };

        let (result, attempts) = run(Idempotency::SideEffecting, vec![lost()]).await;
        assert!(matches!(result, Err(McpError::ResponseLost { .. })));
        assert_eq!(attempts, 1);

        let (result, attempts) = run(Idempotency::ReadOnly, vec![lost()]).await;
        assert!(result.is_ok());
        assert_eq!(attempts, 2);
    }

    #[test]
    fn test_failure_envelope_carries_kind() {
        let result = CallTimer::start("fi_mcp", "fetch_net_worth").failure(&timeout());
        let outcome = result.outcome().unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.error_kind, Some(super::super::errors::FailureKind::Timeout));
        assert_eq!(outcome.server, "fi_mcp");
    }

    #[test]
    fn test_auth_required_envelope() {
        let pending = PendingAuth {
            server_name: "fi_mcp".into(),
            session_id: "mcp-session-1".into(),
            login_url: "https://fi.money/wealth-mcp-login?token=mcp-session-1".into(),
            owner: None,
            created_at: chrono::Utc::now(),
        };
        let result = CallTimer::start("fi_mcp", "fetch_net_worth").auth_required(&pending, None);
        let auth = result.auth_required().unwrap();
        assert_eq!(auth.session_id, "mcp-session-1");
        assert!(auth.login_url.contains("token=mcp-session-1"));
        assert_eq!(auth.message, DEFAULT_AUTH_MESSAGE);
    }

    #[test]
    fn test_tool_error_has_no_kind() {
        let result = CallTimer::start("fi_mcp", "fetch_net_worth").tool_error("not linked".into());
        let outcome = result.outcome().unwrap();
        assert_eq!(outcome.error.as_deref(), Some("not linked"));
        assert_eq!(outcome.error_kind, None);
    }
}
