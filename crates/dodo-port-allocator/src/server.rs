//! HTTP front-end of the port allocator

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tracing::info;

use crate::allocator::PortAllocator;
use crate::api::{AllocateRequest, PortResponse, RemoveRequest, ReserveRequest};
use crate::error::{Error, Result};

/// Routes of the allocator API
pub fn router(allocator: Arc<PortAllocator>) -> Router {
    Router::new()
        .route("/api/allocate", post(allocate_handler))
        .route("/api/reserve", post(reserve_handler))
        .route("/api/remove", post(remove_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(allocator)
}

/// Serve the allocator API on `addr` until the process is stopped
pub async fn serve(addr: SocketAddr, allocator: Arc<PortAllocator>) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Port allocator listening");
    axum::serve(listener, router(allocator)).await
}

async fn blocking<T, F>(allocator: Arc<PortAllocator>, f: F) -> Result<T>
where
    F: FnOnce(&PortAllocator) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || f(&allocator))
        .await
        .map_err(|e| Error::Internal(format!("allocator task failed: {}", e)))?
}

async fn allocate_handler(
    State(allocator): State<Arc<PortAllocator>>,
    Json(req): Json<AllocateRequest>,
) -> Result<Json<PortResponse>> {
    blocking(allocator, move |a| a.allocate(req)).await.map(Json)
}

async fn reserve_handler(
    State(allocator): State<Arc<PortAllocator>>,
    body: Option<Json<ReserveRequest>>,
) -> Result<Json<PortResponse>> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    blocking(allocator, move |a| a.reserve(req)).await.map(Json)
}

async fn remove_handler(
    State(allocator): State<Arc<PortAllocator>>,
    Json(req): Json<RemoveRequest>,
) -> Result<()> {
    blocking(allocator, move |a| a.deallocate(req)).await
}
