//! Loopback HTTP view of the ledger
//!
//! Serves the stored messages as JSON and exposes clear and the two trims.
//! Only ever binds 127.0.0.1.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::services::Ledger;
use crate::types::{Result, SinkError};

pub enum AdminError {
    Store(SinkError),
    Internal(String),
}

impl From<SinkError> for AdminError {
    fn from(err: SinkError) -> Self {
        AdminError::Store(err)
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let (status, msg) = match self {
            AdminError::Store(e) => {
                error!("Admin request failed: {}", e);
                let status = match e {
                    SinkError::StoreUnavailable(_) | SinkError::Database(_) => {
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, e.to_string())
            }
            AdminError::Internal(e) => {
                error!("Admin task failed: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(json!({ "error": msg }))).into_response()
    }
}

type AdminResult<T> = std::result::Result<T, AdminError>;

pub fn router(ledger: Arc<Ledger>) -> Router {
    Router::new()
        .route("/messages.json", get(list_messages))
        .route("/size", get(size))
        .route("/clear", post(clear))
        .route("/truncate/:retain", post(truncate))
        .route("/tail/:retain", post(tail))
        .with_state(ledger)
        .layer(TraceLayer::new_for_http())
}

pub async fn bind(port: u16) -> Result<TcpListener> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    TcpListener::bind(addr)
        .await
        .map_err(|e| SinkError::Io(format!("cannot listen on {}: {}", addr, e)))
}

/// Serve the admin routes until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, ledger: Arc<Ledger>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let local = listener.local_addr()?;
    info!("Admin HTTP listening on {}", local);

    axum::serve(listener, router(ledger).into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| SinkError::Io(format!("admin listener on {} failed: {}", local, e)))?;

    info!("Admin HTTP on {} shut down", local);
    Ok(())
}

/// Ledger calls block on the store, so they run off the async workers.
async fn with_ledger<T, F>(ledger: Arc<Ledger>, op: F) -> AdminResult<T>
where
    F: FnOnce(&Ledger) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let result = tokio::task::spawn_blocking(move || op(&ledger))
        .await
        .map_err(|e| AdminError::Internal(e.to_string()))?;
    Ok(result?)
}

async fn list_messages(State(ledger): State<Arc<Ledger>>) -> AdminResult<Json<Value>> {
    let documents = with_ledger(ledger, |ledger| ledger.documents()).await?;
    let messages: Vec<Value> = documents
        .iter()
        .map(|doc| Value::Object(doc.to_json()))
        .collect();
    Ok(Json(json!({ "messages": messages })))
}

async fn size(State(ledger): State<Arc<Ledger>>) -> AdminResult<Json<Value>> {
    let mirroring = ledger.mirroring_enabled();
    let size = with_ledger(ledger, |ledger| ledger.size()).await?;
    Ok(Json(json!({ "size": size, "mirroring": mirroring })))
}

async fn clear(State(ledger): State<Arc<Ledger>>) -> AdminResult<Json<Value>> {
    let size = with_ledger(ledger, |ledger| {
        ledger.clear()?;
        ledger.size()
    })
    .await?;
    Ok(Json(json!({ "size": size })))
}

async fn truncate(
    State(ledger): State<Arc<Ledger>>,
    Path(retain): Path<usize>,
) -> AdminResult<Json<Value>> {
    let size = with_ledger(ledger, move |ledger| {
        ledger.truncate(retain)?;
        ledger.size()
    })
    .await?;
    Ok(Json(json!({ "size": size })))
}

async fn tail(
    State(ledger): State<Arc<Ledger>>,
    Path(retain): Path<usize>,
) -> AdminResult<Json<Value>> {
    let size = with_ledger(ledger, move |ledger| {
        ledger.tail(retain)?;
        ledger.size()
    })
    .await?;
    Ok(Json(json!({ "size": size })))
}
