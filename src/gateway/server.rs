//! Router assembly, listener and shutdown.

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{any, get};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::{bridge, streamable, GatewayContext, StreamableSettings};
use crate::config::{Config, Transport};
use crate::error::GatewayError;
use crate::mcp::{CapabilitySet, ProcessClientFactory};
use crate::process::{Launcher, PoolSettings, TerminationPolicy};
use crate::session::{RestartPolicy, SessionEndpoint, SessionManager};

/// How long open connections may keep the server alive after a signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Router for the WebSocket transport.
pub fn websocket_router(ctx: Arc<GatewayContext>, path: &str) -> Router {
    Router::new()
        .route(path, get(bridge::handle_upgrade))
        .with_state(ctx)
}

/// Router for the stateless streamable HTTP transport.
pub fn streamable_router(ctx: Arc<GatewayContext>, path: &str) -> Router {
    Router::new()
        .route(path, any(streamable::handle))
        .with_state(ctx)
}

/// A configured gateway, ready to serve.
#[derive(Debug)]
pub struct Gateway {
    router: Router,
    ctx: Arc<GatewayContext>,
    sessions: Option<Arc<SessionManager<ProcessClientFactory>>>,
}

impl Gateway {
    /// Builds the transport selected in `config`.
    ///
    /// The warm pool is only started for the WebSocket and stateless HTTP
    /// transports. The session transport introspects the wrapped server
    /// first and fails if that does not work.
    ///
    /// # Errors
    ///
    /// Returns an error if the command is invalid or, in session
    /// transport, introspection fails.
    pub async fn build(config: &Config) -> Result<Self, GatewayError> {
        let launcher = Launcher::new(&config.command, TerminationPolicy::from(&config.process))?;
        let settings = StreamableSettings::from(&config.http);

        let mut pool = PoolSettings::from(&config.pool);
        if config.transport == Transport::Session && pool.capacity > 0 {
            info!("Process pool is not used by the session transport");
            pool.capacity = 0;
        }

        let ctx = Arc::new(GatewayContext::start(launcher.clone(), pool, settings).await);

        let (router, sessions) = match config.transport {
            Transport::Websocket => (
                websocket_router(Arc::clone(&ctx), &config.server.websocket_path),
                None,
            ),
            Transport::Http => (
                streamable_router(Arc::clone(&ctx), &config.server.http_path),
                None,
            ),
            Transport::Session => {
                let capabilities =
                    CapabilitySet::introspect(&launcher, settings.response_timeout).await?;
                let factory = ProcessClientFactory::new(launcher, settings.response_timeout);
                let manager = Arc::new(SessionManager::new(
                    factory,
                    RestartPolicy::from(&config.session),
                ));
                let endpoint =
                    SessionEndpoint::new(Arc::clone(&manager), Arc::new(capabilities));
                (
                    Arc::new(endpoint).router(&config.server.http_path),
                    Some(manager),
                )
            }
        };

        Ok(Self {
            router: router.layer(TraceLayer::new_for_http()),
            ctx,
            sessions,
        })
    }

    /// Returns a handle to the router.
    #[must_use]
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Returns the shared context.
    #[must_use]
    pub const fn context(&self) -> &Arc<GatewayContext> {
        &self.ctx
    }

    /// Serves until SIGINT or SIGTERM, then tears everything down.
    ///
    /// # Errors
    ///
    /// Returns an error if the server fails.
    pub async fn serve(self, listener: TcpListener) -> std::io::Result<()> {
        let stopping = CancellationToken::new();
        let signalled = stopping.clone();

        let server = axum::serve(listener, self.router.clone())
            .with_graceful_shutdown(async move {
                shutdown_signal().await;
                signalled.cancel();
            })
            .into_future();

        let result = tokio::select! {
            result = server => result,
            () = async {
                stopping.cancelled().await;
                tokio::time::sleep(DRAIN_TIMEOUT).await;
            } => {
                warn!(timeout = ?DRAIN_TIMEOUT, "Connections still open, shutting down anyway");
                Ok(())
            }
        };

        self.shutdown().await;
        result
    }

    /// Closes all sessions and the pool.
    pub async fn shutdown(&self) {
        if let Some(sessions) = &self.sessions {
            sessions.shutdown().await;
        }
        self.ctx.shutdown().await;
    }
}

/// Runs `command` through `sh -c` with inherited stdio.
///
/// # Errors
///
/// Returns [`GatewayError::Boot`] if the command cannot be started or
/// exits unsuccessfully.
pub async fn run_boot_command(command: &str) -> Result<(), GatewayError> {
    info!(command, "Running boot command");
    let status = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .status()
        .await
        .map_err(|e| GatewayError::Boot {
            command: command.to_string(),
            reason: e.to_string(),
        })?;

    if !status.success() {
        return Err(GatewayError::Boot {
            command: command.to_string(),
            reason: status.to_string(),
        });
    }
    info!("Boot command completed");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
#[cfg(unix)]
pub async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigint, mut sigterm) =
        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "Failed to install signal handlers");
                std::future::pending::<()>().await;
                return;
            }
        };

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, initiating graceful shutdown"),
        _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
    }
}

/// Resolves on Ctrl+C.
#[cfg(windows)]
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    info!("Received Ctrl+C, initiating graceful shutdown");
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn boot_command_success() {
        run_boot_command("true").await.unwrap();
    }

    #[tokio::test]
    async fn boot_command_failure_is_reported() {
        let err = run_boot_command("exit 3").await.unwrap_err();
        assert!(matches!(err, GatewayError::Boot { .. }));
        assert!(err.to_string().contains("exit 3"));
    }

    #[tokio::test]
    async fn build_http_gateway() {
        let config: Config = serde_json::from_str(
            r#"{"command": "cat", "transport": "http", "pool": {"size": 1}}"#,
        )
        .unwrap();
        let gateway = Gateway::build(&config).await.unwrap();
        assert_eq!(gateway.context().idle_count(), 1);
        gateway.shutdown().await;
        assert_eq!(gateway.context().idle_count(), 0);
    }

    #[tokio::test]
    async fn session_gateway_needs_working_server() {
        let config: Config = serde_json::from_str(
            r#"{"command": "/nonexistent/definitely-not-a-binary", "transport": "session"}"#,
        )
        .unwrap();
        assert!(Gateway::build(&config).await.is_err());
    }

    #[tokio::test]
    async fn session_gateway_skips_pool() {
        let command = format!("sh {}/tests/fixtures/mock_mcp.sh", env!("CARGO_MANIFEST_DIR"));
        let mut config = Config::default();
        config.command = command;
        config.pool.size = 3;

        let gateway = Gateway::build(&config).await.unwrap();
        assert_eq!(gateway.context().idle_count(), 0);
        gateway.shutdown().await;
    }
}
