//! Mock Fi MCP HTTP server.
//!
//! Speaks JSON-RPC on `POST /mcp/stream`, answers `GET /mcp/health` and
//! accepts session registrations on `POST /login`. Tool calls without a
//! registered session are rejected the way the real server does, either with
//! a 400 sentinel body or with login-required content.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

/// Token the mock embeds in its own login URLs.
pub const SERVER_TOKEN: &str = "mcp-session-from-server";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMode {
    /// No session needed.
    Open,
    /// 400 "Invalid session ID" for unknown sessions.
    #[default]
    Sentinel,
    /// 200 with `{"status":"login_required","login_url":...}` content.
    LoginContent,
}

#[derive(Debug, Default)]
pub struct MockState {
    pub mode: AuthMode,
    pub authenticated: HashSet<String>,
    /// `Mcp-Session-Id` of every `tools/call`.
    pub seen_sessions: Vec<Option<String>>,
    /// `(sessionId, phoneNumber)` of every registration.
    pub logins: Vec<(String, String)>,
    pub reject_logins: bool,
}

type Shared = Arc<Mutex<MockState>>;

pub struct MockServer {
    /// MCP endpoint, `http://127.0.0.1:<port>/mcp/stream`.
    pub url: String,
    pub state: Shared,
}

impl MockServer {
    pub async fn start(mode: AuthMode) -> Self {
        let state: Shared = Arc::new(Mutex::new(MockState {
            mode,
            ..MockState::default()
        }));

        let app = Router::new()
            .route("/mcp/stream", post(rpc))
            .route("/mcp/health", get(|| async { "ok" }))
            .route("/login", post(login))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            url: format!("http://{addr}/mcp/stream"),
            state,
        }
    }

    /// Start on a dedicated runtime, for tests driving the blocking facade.
    #[allow(dead_code)]
    pub fn start_on_own_runtime(mode: AuthMode) -> (Self, tokio::runtime::Runtime) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let server = runtime.block_on(Self::start(mode));
        (server, runtime)
    }

    #[allow(dead_code)]
    pub fn forget_sessions(&self) {
        self.state.lock().unwrap().authenticated.clear();
    }

    #[allow(dead_code)]
    pub fn set_reject_logins(&self, reject: bool) {
        self.state.lock().unwrap().reject_logins = reject;
    }

    pub fn seen_sessions(&self) -> Vec<Option<String>> {
        self.state.lock().unwrap().seen_sessions.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().unwrap().seen_sessions.len()
    }

    #[allow(dead_code)]
    pub fn logins(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().logins.clone()
    }
}

fn tools() -> Value {
    json!([
        {
            "name": "fetch_net_worth",
            "description": "Net worth across linked accounts",
            "inputSchema": {"type": "object", "properties": {}}
        },
        {
            "name": "fetch_bank_transactions",
            "description": "Recent bank transactions",
            "inputSchema": {
                "type": "object",
                "properties": {"account_id": {"type": "string"}},
                "required": ["account_id"]
            }
        },
        {"name": "broken_tool"},
        {"name": "unlinked_tool"},
        {"name": "stream_tool"},
        {"name": "slow_tool"},
        {"name": "crash_tool"},
        {"name": "plain_tool"}
    ])
}

fn reply(id: Value, result: Value) -> Response {
    Json(json!({"jsonrpc": "2.0", "id": id, "result": result})).into_response()
}

fn text_content(text: String) -> Value {
    json!({"content": [{"type": "text", "text": text}]})
}

async fn rpc(State(state): State<Shared>, headers: HeaderMap, Json(req): Json<Value>) -> Response {
    let id = req["id"].clone();
    let session = headers
        .get("mcp-session-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    match req["method"].as_str().unwrap_or_default() {
        "tools/list" => reply(id, json!({"tools": tools()})),
        "tools/call" => {
            let name = req["params"]["name"].as_str().unwrap_or_default().to_string();
            let args = req["params"]["arguments"].clone();

            let (mode, authed) = {
                let mut s = state.lock().unwrap();
                s.seen_sessions.push(session.clone());
                let authed = session
                    .as_ref()
                    .is_some_and(|sid| s.authenticated.contains(sid));
                (s.mode, authed)
            };

            if !authed {
                match mode {
                    AuthMode::Open => {}
                    AuthMode::Sentinel => {
                        return (
                            StatusCode::BAD_REQUEST,
                            format!("Invalid session ID: {}", session.unwrap_or_default()),
                        )
                            .into_response();
                    }
                    AuthMode::LoginContent => {
                        let body = json!({
                            "status": "login_required",
                            "login_url": format!("https://fi.money/wealth-mcp-login?token={SERVER_TOKEN}"),
                            "message": "Log in to Fi to continue"
                        });
                        return reply(id, text_content(body.to_string()));
                    }
                }
            }

            call_tool(id, &name, args).await
        }
        _ => Json(json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": -32601, "message": "Method not found"}
        }))
        .into_response(),
    }
}

async fn call_tool(id: Value, name: &str, args: Value) -> Response {
    match name {
        "fetch_net_worth" => reply(
            id,
            text_content(json!({"netWorth": {"totalValue": 1000}}).to_string()),
        ),
        "fetch_bank_transactions" => reply(id, text_content(json!({"echo": args}).to_string())),
        "broken_tool" => Json(json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": -32000, "message": "backend exploded"}
        }))
        .into_response(),
        "unlinked_tool" => reply(
            id,
            json!({"isError": true, "content": [{"type": "text", "text": "account not linked"}]}),
        ),
        "stream_tool" => {
            let message = json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": text_content(json!({"streamed": true}).to_string())
            });
            (
                [(header::CONTENT_TYPE, "text/event-stream")],
                format!("event: message\ndata: {message}\n\n"),
            )
                .into_response()
        }
        "slow_tool" => {
            tokio::time::sleep(Duration::from_secs(3)).await;
            reply(id, text_content("late".into()))
        }
        "crash_tool" => (StatusCode::INTERNAL_SERVER_ERROR, "internal failure").into_response(),
        "plain_tool" => reply(id, text_content("All good".into())),
        other => Json(json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": -32602, "message": format!("unknown tool {other}")}
        }))
        .into_response(),
    }
}

#[derive(Deserialize)]
struct LoginForm {
    #[serde(rename = "sessionId")]
    session_id: String,
    #[serde(rename = "phoneNumber")]
    phone_number: String,
}

async fn login(State(state): State<Shared>, Form(form): Form<LoginForm>) -> Response {
    let mut s = state.lock().unwrap();
    if s.reject_logins {
        return (StatusCode::SERVICE_UNAVAILABLE, "login backend down").into_response();
    }
    s.logins.push((form.session_id.clone(), form.phone_number));
    s.authenticated.insert(form.session_id);
    (StatusCode::OK, "ok").into_response()
}
