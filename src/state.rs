//! Shared state handed to every handler.

use crate::{
    middleware::auth::JwtVerifier,
    services::{object_gateway::LocalObjectStore, resource_service::ResourceService},
};
use sqlx::SqlitePool;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    /// Pool used directly only by the readiness probe.
    pub db: Arc<SqlitePool>,
    pub resources: ResourceService,
    pub objects: Arc<LocalObjectStore>,
    pub jwt: Arc<JwtVerifier>,
}
