//! Web server module

mod error;
mod extract;
mod middleware;
mod routes;

use anyhow::Result;
use axum::{
    extract::connect_info::IntoMakeServiceWithConnectInfo,
    http::{header, HeaderValue},
    routing::{get, post},
    Router,
};
use cached::{Cached, TimedCache};
use std::{
    future::IntoFuture,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, set_header::SetResponseHeaderLayer};
use tracing::{info, warn};

use crate::auth::{PasswordHasher, TokenService};
use crate::config::Config;
use crate::db::{Database, NewPost, Post, WriteSender};
use middleware::RequestLoggingLayer;

/// Seconds a fetched post stays in the read cache
const POST_CACHE_TTL_SECS: u64 = 60;

pub struct AppState {
    pub db: Database,
    pub tokens: TokenService,
    pub hasher: PasswordHasher,
    pub write_tx: WriteSender<NewPost>,
    post_cache: Mutex<TimedCache<i64, Post>>,
}

impl AppState {
    pub fn new(
        db: Database,
        tokens: TokenService,
        hasher: PasswordHasher,
        write_tx: WriteSender<NewPost>,
    ) -> Self {
        Self {
            db,
            tokens,
            hasher,
            write_tx,
            post_cache: Mutex::new(TimedCache::with_lifespan(POST_CACHE_TTL_SECS)),
        }
    }

    fn cached_post(&self, post_id: i64) -> Option<Post> {
        let mut cache = self.post_cache.lock().ok()?;
        cache.cache_get(&post_id).cloned()
    }

    fn cache_post(&self, post: Post) {
        if let Ok(mut cache) = self.post_cache.lock() {
            cache.cache_set(post.id, post);
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/register", post(routes::register))
        .route("/api/login", post(routes::login))
        .route("/api/tweet", post(routes::create_post))
        .route("/api/tweet/:post_id", get(routes::get_post))
        .route(
            "/api/follow/:target_user_id",
            post(routes::follow).delete(routes::unfollow),
        )
        .route("/api/timeline", get(routes::timeline))
        .route("/api/health", get(routes::health))
        .fallback(routes::not_found)
        .layer(SetResponseHeaderLayer::if_not_present(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .layer(CorsLayer::permissive())
        .layer(RequestLoggingLayer::new())
        .with_state(state)
}

/// Serve until `shutdown` is cancelled, then give in-flight requests
/// `shutdown_grace_secs` to finish
pub async fn start_server(
    config: &Config,
    state: Arc<AppState>,
    shutdown: CancellationToken,
) -> Result<()> {
    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let grace = Duration::from_secs(config.server.shutdown_grace_secs);

    if config.tls_enabled() {
        let tls = axum_server::tls_rustls::RustlsConfig::from_pem_file(
            &config.server.tls_cert,
            &config.server.tls_key,
        )
        .await?;

        let handle = axum_server::Handle::new();
        let shutdown_handle = handle.clone();
        tokio::spawn(async move {
            shutdown.cancelled().await;
            shutdown_handle.graceful_shutdown(Some(grace));
        });

        info!("Web server starting on https://{}", addr);
        axum_server::bind_rustls(addr, tls)
            .handle(handle)
            .serve(app)
            .await?;
    } else {
        info!("Web server starting on http://{}", addr);
        let listener = tokio::net::TcpListener::bind(addr).await?;
        serve_plain(listener, app, shutdown, grace).await?;
    }

    info!("Web server stopped");
    Ok(())
}

async fn serve_plain(
    listener: tokio::net::TcpListener,
    app: IntoMakeServiceWithConnectInfo<Router, SocketAddr>,
    shutdown: CancellationToken,
    grace: Duration,
) -> Result<()> {
    let signal = shutdown.clone();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move { signal.cancelled().await })
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        served = &mut server => served?,
        _ = shutdown.cancelled() => {
            // Connections still open after the grace period are dropped
            if tokio::time::timeout(grace, &mut server).await.is_err() {
                warn!("Open connections did not finish within {:?}, closing them", grace);
            }
        }
    }
    Ok(())
}
