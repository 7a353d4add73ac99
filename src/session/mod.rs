//! Session manager with bounded automatic recovery.
//!
//! Each logical client session is bound to at most one initialized child.
//! In durable mode a call that fails because the child died is answered
//! with [`GatewayError::SessionRestarted`] after a replacement child has
//! been connected, as long as the session's restart budget allows it:
//!
//! ```text
//!   call ──▶ child ──▶ Ok / non-retriable error ──────────────▶ caller
//!              │
//!              └─ retriable error (broken pipe, EOF, ...)
//!                   │
//!                   ├─ budget left ─▶ close + reconnect ─▶ SessionRestarted
//!                   └─ exhausted / reconnect failed ─────▶ TemporaryFailure
//! ```
//!
//! The budget is `max_restarts` restarts; it refills once the last failure
//! is older than `restart_window`.

pub mod endpoint;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::error::GatewayError;

pub use endpoint::SessionEndpoint;

/// An initialized MCP connection owned by one session.
pub trait SessionClient: Send + Sync + 'static {
    /// Sends a request and waits for the result.
    fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> impl Future<Output = Result<Value, GatewayError>> + Send;

    /// Releases the connection and its process.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Creates initialized clients.
pub trait ClientFactory: Send + Sync + 'static {
    /// The client type produced.
    type Client: SessionClient;

    /// Starts a child and completes the initialize handshake.
    fn connect(&self) -> impl Future<Output = Result<Self::Client, GatewayError>> + Send;
}

/// Recovery settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Create sessions lazily and restart dead children.
    pub durable: bool,
    /// Restarts allowed inside one window.
    pub max_restarts: u32,
    /// Age after which the last failure no longer counts.
    pub window: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            durable: true,
            max_restarts: 3,
            window: Duration::from_secs(300),
        }
    }
}

impl From<&SessionConfig> for RestartPolicy {
    fn from(config: &SessionConfig) -> Self {
        Self {
            durable: config.durable,
            max_restarts: config.max_restarts,
            window: config.restart_window(),
        }
    }
}

#[derive(Debug, Default)]
struct RestartState {
    count: u32,
    last_failure: Option<Instant>,
}

impl RestartState {
    /// Consumes one restart if the budget allows it.
    fn try_consume(&mut self, policy: &RestartPolicy, now: Instant) -> bool {
        let recent = self
            .last_failure
            .is_some_and(|at| now.duration_since(at) < policy.window);
        if !recent {
            self.count = 0;
        }
        if self.count >= policy.max_restarts {
            return false;
        }
        self.count += 1;
        self.last_failure = Some(now);
        true
    }
}

type Slot<C> = Arc<tokio::sync::Mutex<Option<Arc<C>>>>;

struct Session<C> {
    id: String,
    slot: Slot<C>,
    restarts: Mutex<RestartState>,
}

impl<C> Session<C> {
    fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            slot: Arc::new(tokio::sync::Mutex::new(None)),
            restarts: Mutex::new(RestartState::default()),
        })
    }
}

/// Tracks sessions and their bound clients.
pub struct SessionManager<F: ClientFactory> {
    factory: Arc<F>,
    policy: RestartPolicy,
    sessions: RwLock<HashMap<String, Arc<Session<F::Client>>>>,
}

impl<F: ClientFactory> std::fmt::Debug for SessionManager<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("policy", &self.policy)
            .field("sessions", &self.len())
            .finish_non_exhaustive()
    }
}

impl<F: ClientFactory> SessionManager<F> {
    /// Creates an empty manager.
    pub fn new(factory: F, policy: RestartPolicy) -> Self {
        Self {
            factory: Arc::new(factory),
            policy,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the recovery settings.
    pub const fn policy(&self) -> RestartPolicy {
        self.policy
    }

    fn read_sessions(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<Session<F::Client>>>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_sessions(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<Session<F::Client>>>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a session and starts binding a client in the background.
    ///
    /// A bind failure is logged and leaves the session unbound. Calls made
    /// while the bind is in progress wait for it.
    pub fn register(&self, session_id: &str) {
        let session = {
            let mut sessions = self.write_sessions();
            if sessions.contains_key(session_id) {
                debug!(session_id, "Session already registered");
                return;
            }
            let session = Session::new(session_id);
            sessions.insert(session_id.to_string(), Arc::clone(&session));
            session
        };

        // Uncontended: the session was created above.
        let Ok(mut slot) = Arc::clone(&session.slot).try_lock_owned() else {
            return;
        };
        let factory = Arc::clone(&self.factory);
        tokio::spawn(async move {
            match factory.connect().await {
                Ok(client) => {
                    *slot = Some(Arc::new(client));
                    info!(session_id = %session.id, "Session bound to child process");
                }
                Err(e) => {
                    error!(session_id = %session.id, error = %e, "Failed to bind session");
                }
            }
        });
    }

    /// Removes a session and closes its client. Returns `false` if unknown.
    pub async fn unregister(&self, session_id: &str) -> bool {
        let Some(session) = self.write_sessions().remove(session_id) else {
            return false;
        };
        let client = session.slot.lock().await.take();
        if let Some(client) = client {
            client.close().await;
        }
        info!(session_id, "Session unregistered");
        true
    }

    /// Returns `true` if the session is known.
    pub fn contains(&self, session_id: &str) -> bool {
        self.read_sessions().contains_key(session_id)
    }

    /// Returns the number of known sessions.
    pub fn len(&self) -> usize {
        self.read_sessions().len()
    }

    /// Returns `true` if no session is known.
    pub fn is_empty(&self) -> bool {
        self.read_sessions().is_empty()
    }

    /// Returns `true` once the session has a bound client.
    pub async fn is_bound(&self, session_id: &str) -> bool {
        let session = self.read_sessions().get(session_id).cloned();
        match session {
            Some(session) => session.slot.lock().await.is_some(),
            None => false,
        }
    }

    /// Sends `method` to the session's child, applying the restart policy.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::SessionNotFound`] in non-durable mode when the
    ///   session or its client is missing
    /// - [`GatewayError::SessionRestarted`] after a successful recovery
    /// - [`GatewayError::TemporaryFailure`] when recovery is not possible
    /// - any other error from the child, unchanged
    pub async fn dispatch(
        &self,
        session_id: &str,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, GatewayError> {
        let session = self.resolve(session_id)?;
        let client = self.bound_client(&session).await?;

        match client.request(method, params).await {
            Err(e) if self.policy.durable && e.is_retriable() => {
                self.recover(&session, &client, &e).await
            }
            result => result,
        }
    }

    /// Closes every bound client and forgets all sessions.
    pub async fn shutdown(&self) {
        let sessions: Vec<_> = self.write_sessions().drain().map(|(_, s)| s).collect();
        if sessions.is_empty() {
            return;
        }
        info!(count = sessions.len(), "Closing sessions");
        futures::future::join_all(sessions.into_iter().map(|session| async move {
            let client = session.slot.lock().await.take();
            if let Some(client) = client {
                client.close().await;
            }
        }))
        .await;
    }

    fn resolve(&self, session_id: &str) -> Result<Arc<Session<F::Client>>, GatewayError> {
        if let Some(session) = self.read_sessions().get(session_id) {
            return Ok(Arc::clone(session));
        }
        if !self.policy.durable {
            return Err(GatewayError::SessionNotFound(session_id.to_string()));
        }

        debug!(session_id, "Adopting unknown session");
        let mut sessions = self.write_sessions();
        let session = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Session::new(session_id));
        Ok(Arc::clone(session))
    }

    async fn bound_client(
        &self,
        session: &Session<F::Client>,
    ) -> Result<Arc<F::Client>, GatewayError> {
        let mut slot = session.slot.lock().await;
        if let Some(client) = slot.as_ref() {
            return Ok(Arc::clone(client));
        }
        if !self.policy.durable {
            return Err(GatewayError::SessionNotFound(session.id.clone()));
        }

        match self.factory.connect().await {
            Ok(client) => {
                info!(session_id = %session.id, "Session bound to child process");
                let client = Arc::new(client);
                *slot = Some(Arc::clone(&client));
                Ok(client)
            }
            Err(e) => {
                error!(session_id = %session.id, error = %e, "Failed to bind session");
                Err(GatewayError::TemporaryFailure)
            }
        }
    }

    async fn recover(
        &self,
        session: &Session<F::Client>,
        failed: &Arc<F::Client>,
        cause: &GatewayError,
    ) -> Result<Value, GatewayError> {
        let mut slot = session.slot.lock().await;

        // Another call already replaced the failed client.
        if slot.as_ref().is_some_and(|current| !Arc::ptr_eq(current, failed)) {
            return Err(GatewayError::SessionRestarted);
        }

        let allowed = session
            .restarts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_consume(&self.policy, Instant::now());
        if !allowed {
            warn!(
                session_id = %session.id,
                error = %cause,
                max_restarts = self.policy.max_restarts,
                "Restart budget exhausted"
            );
            return Err(GatewayError::TemporaryFailure);
        }

        warn!(session_id = %session.id, error = %cause, "Child process died, restarting session");
        if let Some(old) = slot.take() {
            old.close().await;
        }

        match self.factory.connect().await {
            Ok(client) => {
                *slot = Some(Arc::new(client));
                info!(session_id = %session.id, "Session restarted");
                Err(GatewayError::SessionRestarted)
            }
            Err(e) => {
                error!(session_id = %session.id, error = %e, "Failed to restart session");
                Err(GatewayError::TemporaryFailure)
            }
        }
    }
}
