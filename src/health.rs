//! HTTP index and health endpoint
//!
//! - `GET /` - HTML page with the owner and version
//! - `GET /healthz` - liveness, always `ok`
//!
//! Everything else is a 404.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use minijinja::{context, Environment, Value};
use tracing::{error, info};

use crate::{Error, Result, LABEL_OWNER};

/// Index page template loaded at compile time
const INDEX_TEMPLATE: &str = include_str!("../templates/index.html");

/// Render the index page for an owner
pub fn render_index(owner: &str, version: &str) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("index.html", INDEX_TEMPLATE)
        .map_err(|e| Error::internal_with_context("index_template", e.to_string()))?;
    env.get_template("index.html")
        .and_then(|t| {
            t.render(context! {
                owner => owner,
                owner_label => Value::from_safe_string(LABEL_OWNER.to_string()),
                version => version,
            })
        })
        .map_err(|e| Error::internal_with_context("index_template", e.to_string()))
}

/// Build the router; the index is rendered once up front
pub fn health_routes(owner: &str) -> Result<Router> {
    let index: Arc<str> = render_index(owner, crate::version())?.into();
    Ok(Router::new()
        .route("/", get(index_page))
        .route("/healthz", get(|| async { "ok" }))
        .fallback(|| async { (StatusCode::NOT_FOUND, "not found") })
        .with_state(index))
}

async fn index_page(State(index): State<Arc<str>>) -> Html<String> {
    Html(index.to_string())
}

/// Serve the router until the process exits; bind failures are returned
pub async fn serve_health(addr: SocketAddr, owner: &str) -> Result<()> {
    let app = health_routes(owner)?;
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        Error::internal_with_context("health_server", format!("failed to bind {addr}: {e}"))
    })?;
    info!(addr = %addr, "health server started");
    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "health server error");
    }
    Ok(())
}
