#![allow(clippy::too_many_arguments)]
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context as _;
use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::Span;

use chronicle::{db, git};

mod api;

#[derive(Debug, Clone)]
pub struct Options {
    pub listen: SocketAddr,
    pub db: PathBuf,
    pub repos: PathBuf,
    pub cors_origin: Option<String>,
    pub sync_token: Option<String>,
    pub session_secret: Option<String>,
}

/// How long to keep draining requests after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// How often to drop expired access-token revocations.
const EXPUNGE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Run the server.
pub async fn run(options: Options) -> anyhow::Result<()> {
    let listen = options.listen;

    let database =
        db::Database::open(&options.db).context("failed to open or migrate the database")?;
    let repos = git::Repos::open(&options.repos).context("failed to open the repository root")?;

    tracing::info!("database at {}", options.db.display());
    tracing::info!("repositories under {}", options.repos.display());
    tracing::info!("listening on http://{listen}");

    let ctx = api::Context::new(database, repos, &options);

    // Revoked access-token ids only need to be held until their natural
    // expiry; sweep the table in the background.
    let users = ctx.users();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(EXPUNGE_INTERVAL);
        loop {
            interval.tick().await;
            if let Err(e) = users.expunge_revoked() {
                tracing::warn!("Failed to expunge revoked tokens: {e}");
            }
        }
    });

    let app = router(ctx, &options)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|_request: &Request<Body>| {
                    tracing::info_span!("request", id = %format!("{:08x}", fastrand::u32(..)))
                })
                .on_response(
                    |response: &Response<Body>, latency: Duration, _span: &Span| {
                        tracing::info!("{} {:?}", response.status(), latency);
                    },
                ),
        )
        .into_make_service_with_connect_info::<SocketAddr>();

    let handle = axum_server::Handle::new();
    tokio::spawn(shutdown(handle.clone()));

    axum_server::bind(listen)
        .handle(handle)
        .serve(app)
        .await
        .map_err(anyhow::Error::from)
}

/// Create the application router.
fn router(ctx: api::Context, options: &Options) -> Router {
    Router::new().nest("/api", api::router(ctx, options.cors_origin.as_deref()))
}

/// Trigger a graceful shutdown, with a drain window, on SIGINT or SIGTERM.
async fn shutdown(handle: axum_server::Handle) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Ctrl-C handler can be installed");
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler can be installed")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutting down..");
    handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
}
