//! Route table. CORS and request tracing wrap every route.
//!
//! ## Public
//! - `GET  /healthz`, `GET /readyz`
//! - `GET  /api/resources`: active resources
//! - `GET  /api/resources/stats`
//! - `GET  /api/resources/{id}`
//! - `POST /api/resources/{id}/download`: fresh link, counts the download
//! - `GET  /files/{*key}?expires=&signature=`: signed-link target
//!
//! ## Admin (bearer JWT with the `admin` role)
//! - `GET    /admin/resources?active_only=`
//! - `GET    /admin/resources/{id}`, `PUT` to edit, `DELETE` to deactivate
//! - `DELETE /admin/resources/{id}/purge`
//! - `POST   /admin/resources/refresh-urls`
//! - `PUT    /admin/uploads/{*key}`

use crate::{
    handlers::{
        file_handlers::{serve_file, upload_resource},
        health_handlers::{healthz, readyz},
        resource_handlers::{
            delete_resource, download_resource, get_any_resource, get_resource,
            list_all_resources, list_resources, purge_resource, refresh_urls, resource_stats,
            update_resource,
        },
    },
    middleware::auth::require_admin,
    state::AppState,
};
use axum::{
    Router,
    http::{
        HeaderName, HeaderValue, Method,
        header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE},
    },
    middleware,
    routing::{delete, get, post, put},
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

/// Browser access for the frontend. `*` in `origins` allows any origin.
fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([
            AUTHORIZATION,
            ACCEPT,
            CONTENT_TYPE,
            HeaderName::from_static("x-resource-title"),
            HeaderName::from_static("x-resource-category"),
            HeaderName::from_static("x-resource-description"),
        ]);

    if origins.iter().any(|origin| origin == "*") {
        return layer.allow_origin(Any);
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("ignoring invalid CORS origin {:?}", origin);
                None
            }
        })
        .collect();
    layer.allow_origin(allowed)
}

pub fn routes(state: AppState, cors_origins: &[String]) -> Router {
    let admin = Router::new()
        .route("/resources", get(list_all_resources))
        .route("/resources/refresh-urls", post(refresh_urls))
        .route(
            "/resources/{id}",
            get(get_any_resource)
                .put(update_resource)
                .delete(delete_resource),
        )
        .route("/resources/{id}/purge", delete(purge_resource))
        .route("/uploads/{*key}", put(upload_resource))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/api/resources", get(list_resources))
        .route("/api/resources/stats", get(resource_stats))
        .route("/api/resources/{id}", get(get_resource))
        .route("/api/resources/{id}/download", post(download_resource))
        .route("/files/{*key}", get(serve_file))
        .nest("/admin", admin)
        .layer(cors_layer(cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
