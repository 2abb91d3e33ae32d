use crate::handlers::{manage, proxy};
use crate::middleware;
use crate::state::AppState;
use axum::routing::{delete, get, post};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// Assemble the router: management surface + proxy endpoint, token
/// guard and process-time stamping on everything, 904 for the rest.
pub fn build_router(state: Arc<AppState>) -> Router {
    let manage = Router::new()
        .route("/router/ping", get(manage::ping))
        // stats
        .route("/router/stats/service", get(manage::get_service_stats))
        .route("/router/stats/http", get(manage::get_http_stats))
        .route("/router/stats/users", get(manage::get_users_stats))
        .route("/router/stats/users/{login}", get(manage::get_user_stats))
        .route("/router/stats/cache", get(manage::get_cache_stats))
        // cache
        .route("/router/cache/{selector}", get(manage::get_cache_top))
        .route("/router/cache", delete(manage::purge_cache))
        // users
        .route("/router/users", get(manage::get_users))
        .route("/router/users/{login}", get(manage::get_user))
        // accounts
        .route(
            "/router/accounts",
            get(manage::get_accounts).post(manage::add_account),
        )
        .route(
            "/router/accounts/{email}",
            get(manage::get_account).delete(manage::remove_account),
        )
        // reset
        .route("/router/reset", post(manage::reset))
        .route("/router/reset/accounts", post(manage::reset_accounts))
        .route("/router/reset/accounts/{email}", post(manage::reset_account))
        .route("/router/reset/users", post(manage::reset_users));

    let proxy = Router::new().route(
        "/api/{*rest}",
        get(proxy::route_all)
            .post(proxy::route_all)
            .put(proxy::route_all)
            .patch(proxy::route_all)
            .delete(proxy::route_all),
    );

    Router::new()
        .merge(manage)
        .merge(proxy)
        .fallback(manage::not_found)
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            middleware::require_token,
        ))
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            middleware::process_time,
        ))
        .with_state(state)
}

/// Bind and serve until ctrl-c.
pub async fn serve(state: Arc<AppState>, addr: SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);
    info!(addr = %addr, "starting router API");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;
    Ok(())
}
