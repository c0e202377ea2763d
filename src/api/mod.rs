pub mod handlers;
pub mod models;

use anyhow::Result;
use axum::routing::{get, post};
use tokio::task::JoinHandle;
use tracing::info;

pub use handlers::AppState;

/// Bind the control endpoint and serve it in the background. A bind failure
/// is returned to the caller and is fatal at startup.
pub async fn start(listen: &str, state: AppState) -> Result<JoinHandle<()>> {
    let app = axum::Router::new()
        .route(
            "/users",
            get(handlers::get_all_users).post(handlers::add_user),
        )
        .route(
            "/users/{name}",
            get(handlers::get_user)
                .patch(handlers::modify_user)
                .delete(handlers::delete_user),
        )
        .route("/users/{name}/start", post(handlers::start_user))
        .route("/users/{name}/stop", post(handlers::stop_user))
        .route("/reset", post(handlers::reset_all))
        .route("/restore", post(handlers::restore))
        .route("/filter/upgrade", post(handlers::upgrade_filter))
        .route("/filter/sources", post(handlers::add_filter_sources))
        .route("/ciphers", get(handlers::list_ciphers))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!(addr = listen, "control API listening");

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "control API server error");
        }
    });
    Ok(handle)
}
