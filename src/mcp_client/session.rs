//! Per-server authentication state.
//!
//! Each configured server owns exactly one [`AuthState`] behind its own lock,
//! so pending and authenticated sessions are mutually exclusive by
//! construction and unrelated servers never contend. The set of servers is
//! fixed when the store is built.
//!
//! ```text
//! Unauthenticated ──mint──▶ Pending ──mark_authenticated──▶ Authenticated
//!        ▲                                                       │
//!        └──────────────── ttl elapsed / reset ──────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::config::{ServerConfig, ServerTransport};
use super::errors::McpError;

const SESSION_ID_PREFIX: &str = "mcp-session-";
const LOGIN_PATH: &str = "/wealth-mcp-login";

// ─── Clock ───────────────────────────────────────────────────────────────────

/// Time source for session expiry.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += to_chrono(by);
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(d.as_millis().min(i64::MAX as u128) as i64)
}

// ─── Session records ─────────────────────────────────────────────────────────

/// A login link handed out and not yet confirmed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingAuth {
    pub server_name: String,
    pub session_id: String,
    pub login_url: String,
    pub owner: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A confirmed session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub server_name: String,
    pub session_id: String,
    pub owner: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub ttl: Duration,
}

impl Session {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.created_at + to_chrono(self.ttl)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }
}

#[derive(Debug, Clone, Default)]
enum AuthState {
    #[default]
    Unauthenticated,
    Pending(PendingAuth),
    Authenticated(Session),
}

/// Externally visible auth state of one server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AuthStatus {
    NotAuthenticated,
    PendingAuth {
        session_id: String,
        login_url: String,
        created_at: DateTime<Utc>,
    },
    Authenticated {
        session_id: String,
        owner: Option<String>,
        expires_at: DateTime<Utc>,
    },
    /// Reported once; the entry is evicted by the query that sees it.
    Expired,
}

/// Session a dispatched call should carry.
#[derive(Debug, Clone, PartialEq)]
pub enum CallSession {
    Authenticated(String),
    Pending(String),
}

impl CallSession {
    pub fn id(&self) -> &str {
        match self {
            CallSession::Authenticated(id) | CallSession::Pending(id) => id,
        }
    }
}

/// What to do about an auth-required reply.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthRequiredAction {
    /// Surface this login link to the user.
    Login(PendingAuth),
    /// The reply was for an older session; a newer authenticated one is live.
    RetryWith(String),
}

// ─── Login URL ───────────────────────────────────────────────────────────────

/// Builds `https://<domain>/wealth-mcp-login?token=<session_id>` for a server.
#[derive(Debug, Clone, PartialEq)]
pub struct LoginUrlTemplate {
    base: String,
}

impl LoginUrlTemplate {
    /// `None` for servers without an HTTP endpoint.
    ///
    /// The domain is the endpoint host with a leading `mcp.` removed, unless
    /// the server configures an explicit `login_base`.
    pub fn for_server(config: &ServerConfig) -> Option<Self> {
        let ServerTransport::Http {
            url, login_base, ..
        } = &config.transport
        else {
            return None;
        };

        if let Some(base) = login_base {
            return Some(Self {
                base: base.trim_end_matches('/').to_string(),
            });
        }

        let parsed = reqwest::Url::parse(url).ok()?;
        let host = parsed.host_str()?;
        let domain = host.strip_prefix("mcp.").unwrap_or(host);
        Some(Self {
            base: format!("https://{domain}"),
        })
    }

    pub fn login_url(&self, session_id: &str) -> String {
        format!("{}{LOGIN_PATH}?token={session_id}", self.base)
    }
}

/// `token=` query value of a server-supplied login URL.
pub fn token_from_login_url(login_url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(login_url).ok()?;
    parsed
        .query_pairs()
        .find(|(k, _)| k == "token")
        .map(|(_, v)| v.into_owned())
        .filter(|v| !v.is_empty())
}

pub fn new_session_id() -> String {
    format!("{SESSION_ID_PREFIX}{}", Uuid::new_v4())
}

// ─── SessionStore ────────────────────────────────────────────────────────────

struct ServerSlot {
    template: Option<LoginUrlTemplate>,
    state: Mutex<AuthState>,
}

/// Session state for every configured server, owned by one client.
pub struct SessionStore {
    slots: HashMap<String, ServerSlot>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl SessionStore {
    pub fn new<'a>(
        servers: impl IntoIterator<Item = &'a ServerConfig>,
        ttl: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let slots = servers
            .into_iter()
            .map(|config| {
                (
                    config.name.clone(),
                    ServerSlot {
                        template: LoginUrlTemplate::for_server(config),
                        state: Mutex::new(AuthState::Unauthenticated),
                    },
                )
            })
            .collect();
        Self { slots, ttl, clock }
    }

    /// Whether `server` uses session auth at all.
    pub fn supports_auth(&self, server: &str) -> bool {
        self.slots
            .get(server)
            .is_some_and(|slot| slot.template.is_some())
    }

    /// Return the pending session for `server`, minting one if none exists.
    ///
    /// An authenticated session is replaced: asking for a login link starts a
    /// new login. An existing pending session keeps its id and link, and
    /// picks up `owner` if it had none.
    pub fn generate_auth_session(
        &self,
        server: &str,
        owner: Option<&str>,
    ) -> Result<PendingAuth, McpError> {
        let (slot, template) = self.auth_slot(server)?;
        let mut state = lock(&slot.state);

        if let AuthState::Pending(pending) = &mut *state {
            if let (None, Some(owner)) = (&pending.owner, owner) {
                pending.owner = Some(owner.to_string());
            }
            return Ok(pending.clone());
        }

        let pending = self.mint(server, Some(template), owner);
        *state = AuthState::Pending(pending.clone());
        tracing::info!(server, session_id = %pending.session_id, "minted pending auth session");
        Ok(pending)
    }

    /// Pending session matching `session_id`, without changing state.
    pub fn pending_matching(&self, server: &str, session_id: &str) -> Result<PendingAuth, String> {
        let slot = self
            .slots
            .get(server)
            .ok_or_else(|| format!("unknown server: '{server}'"))?;
        match &*lock(&slot.state) {
            AuthState::Pending(pending) if pending.session_id == session_id => Ok(pending.clone()),
            AuthState::Pending(_) => Err("Session ID mismatch".to_string()),
            _ => Err("No pending authentication session found".to_string()),
        }
    }

    /// Move the pending session `session_id` to authenticated.
    ///
    /// Re-checks the pending entry under the lock, so a session superseded
    /// while a registration call was in flight is not promoted.
    pub fn promote(&self, server: &str, session_id: &str) -> Result<Session, String> {
        let slot = self
            .slots
            .get(server)
            .ok_or_else(|| format!("unknown server: '{server}'"))?;
        let mut state = lock(&slot.state);

        let owner = match &*state {
            AuthState::Pending(pending) if pending.session_id == session_id => pending.owner.clone(),
            AuthState::Pending(_) => return Err("Session ID mismatch".to_string()),
            _ => return Err("No pending authentication session found".to_string()),
        };

        let session = Session {
            server_name: server.to_string(),
            session_id: session_id.to_string(),
            owner,
            created_at: self.clock.now(),
            ttl: self.ttl,
        };
        *state = AuthState::Authenticated(session.clone());
        tracing::info!(server, session_id, "session authenticated");
        Ok(session)
    }

    /// True only for an unexpired authenticated session. Evicts on expiry.
    pub fn is_authenticated(&self, server: &str) -> bool {
        let Some(slot) = self.slots.get(server) else {
            return false;
        };
        let mut state = lock(&slot.state);
        self.evict_if_expired(server, &mut state);
        matches!(&*state, AuthState::Authenticated(_))
    }

    pub fn authentication_status(&self, server: &str) -> Result<AuthStatus, McpError> {
        let slot = self.slot(server)?;
        let mut state = lock(&slot.state);

        if self.evict_if_expired(server, &mut state) {
            return Ok(AuthStatus::Expired);
        }

        Ok(match &*state {
            AuthState::Unauthenticated => AuthStatus::NotAuthenticated,
            AuthState::Pending(pending) => AuthStatus::PendingAuth {
                session_id: pending.session_id.clone(),
                login_url: pending.login_url.clone(),
                created_at: pending.created_at,
            },
            AuthState::Authenticated(session) => AuthStatus::Authenticated {
                session_id: session.session_id.clone(),
                owner: session.owner.clone(),
                expires_at: session.expires_at(),
            },
        })
    }

    /// Evict every expired authenticated session; returns how many.
    pub fn cleanup_expired_sessions(&self) -> usize {
        let removed = self
            .slots
            .iter()
            .filter(|(name, slot)| self.evict_if_expired(name, &mut lock(&slot.state)))
            .count();
        if removed > 0 {
            tracing::info!(removed, "cleaned up expired sessions");
        }
        removed
    }

    /// Drop whatever state `server` holds.
    pub fn reset(&self, server: &str) {
        if let Some(slot) = self.slots.get(server) {
            *lock(&slot.state) = AuthState::Unauthenticated;
            tracing::info!(server, "session state reset");
        }
    }

    /// Session id for an outgoing call.
    ///
    /// Prefers an unexpired authenticated session, then the pending one, and
    /// otherwise mints a pending placeholder so the server's auth-required
    /// reply names a session the user can log in with. `None` for servers
    /// without session auth.
    pub fn session_for_call(&self, server: &str) -> Option<CallSession> {
        let slot = self.slots.get(server)?;
        let template = slot.template.as_ref()?;
        let mut state = lock(&slot.state);
        self.evict_if_expired(server, &mut state);

        match &*state {
            AuthState::Authenticated(session) => {
                Some(CallSession::Authenticated(session.session_id.clone()))
            }
            AuthState::Pending(pending) => Some(CallSession::Pending(pending.session_id.clone())),
            AuthState::Unauthenticated => {
                let pending = self.mint(server, Some(template), None);
                let id = pending.session_id.clone();
                *state = AuthState::Pending(pending);
                tracing::debug!(server, session_id = %id, "minted placeholder session for call");
                Some(CallSession::Pending(id))
            }
        }
    }

    /// Record an auth-required reply to a call made with `sent`.
    ///
    /// A rejected authenticated session is reset and replaced by a fresh
    /// pending one. A login URL supplied by the server wins over the derived
    /// one, and its `token` becomes the pending session id.
    ///
    /// A reply to anything other than the live authenticated session leaves
    /// that session alone and asks for the call to be retried with it.
    pub fn on_auth_required(
        &self,
        server: &str,
        sent: Option<&CallSession>,
        server_login_url: Option<&str>,
    ) -> Result<AuthRequiredAction, McpError> {
        let slot = self.slot(server)?;
        if slot.template.is_none() && server_login_url.is_none() {
            return Err(McpError::AuthNotSupported {
                server: server.to_string(),
            });
        }
        let mut state = lock(&slot.state);

        if let (Some(sent), AuthState::Authenticated(current)) = (sent, &*state) {
            let is_live = matches!(sent, CallSession::Authenticated(id) if *id == current.session_id);
            if !is_live {
                tracing::info!(
                    server,
                    stale = sent.id(),
                    live = %current.session_id,
                    "auth-required reply for a superseded session"
                );
                return Ok(AuthRequiredAction::RetryWith(current.session_id.clone()));
            }
        }

        let rejected = matches!(
            (sent, &*state),
            (Some(CallSession::Authenticated(sent_id)), AuthState::Authenticated(current))
                if &current.session_id == sent_id
        );
        if rejected {
            tracing::warn!(server, "server rejected authenticated session, resetting");
            *state = AuthState::Unauthenticated;
        }

        let mut pending = match &*state {
            AuthState::Pending(pending) => pending.clone(),
            _ => self.mint(server, slot.template.as_ref(), None),
        };

        if let Some(url) = server_login_url {
            if let Some(token) = token_from_login_url(url) {
                pending.session_id = token;
            }
            pending.login_url = url.to_string();
        }

        *state = AuthState::Pending(pending.clone());
        Ok(AuthRequiredAction::Login(pending))
    }

    /// Id of the unexpired authenticated session, if any. Never mints.
    pub fn active_session(&self, server: &str) -> Option<String> {
        let slot = self.slots.get(server)?;
        let mut state = lock(&slot.state);
        self.evict_if_expired(server, &mut state);
        match &*state {
            AuthState::Authenticated(session) => Some(session.session_id.clone()),
            _ => None,
        }
    }

    fn slot(&self, server: &str) -> Result<&ServerSlot, McpError> {
        self.slots.get(server).ok_or_else(|| McpError::UnknownServer {
            name: server.to_string(),
        })
    }

    fn auth_slot(&self, server: &str) -> Result<(&ServerSlot, &LoginUrlTemplate), McpError> {
        let slot = self.slot(server)?;
        let template = slot
            .template
            .as_ref()
            .ok_or_else(|| McpError::AuthNotSupported {
                server: server.to_string(),
            })?;
        Ok((slot, template))
    }

    fn mint(
        &self,
        server: &str,
        template: Option<&LoginUrlTemplate>,
        owner: Option<&str>,
    ) -> PendingAuth {
        let session_id = new_session_id();
        PendingAuth {
            server_name: server.to_string(),
            login_url: template
                .map(|t| t.login_url(&session_id))
                .unwrap_or_default(),
            session_id,
            owner: owner.map(str::to_string),
            created_at: self.clock.now(),
        }
    }

    /// Returns true if an expired session was evicted.
    fn evict_if_expired(&self, server: &str, state: &mut AuthState) -> bool {
        let expired = matches!(state, AuthState::Authenticated(s) if s.is_expired(self.clock.now()));
        if expired {
            tracing::info!(server, "authenticated session expired");
            *state = AuthState::Unauthenticated;
        }
        expired
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
