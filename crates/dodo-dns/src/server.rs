//! HTTP front-end of the zone manager

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;

use crate::error::{Error, Result};
use crate::manager::ZoneManager;

/// Body of every mutating request
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordRequest {
    /// Zone the entry lives in
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub domain: String,
    /// Name relative to the zone
    pub entry: String,
    /// TXT value or IPv4 address
    pub text: String,
}

/// Routes of the zone API
pub fn router(manager: Arc<ZoneManager>) -> Router {
    Router::new()
        .route("/create-txt-record", post(create_txt_handler))
        .route("/delete-txt-record", post(delete_txt_handler))
        .route("/create-a-record", post(create_a_handler))
        .route("/delete-a-record", post(delete_a_handler))
        .route("/records-to-publish", get(records_to_publish_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(manager)
}

/// Serve the zone API on `addr` until the process is stopped
pub async fn serve(addr: SocketAddr, manager: Arc<ZoneManager>) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, zone = %manager.zone(), "Zone manager listening");
    axum::serve(listener, router(manager)).await
}

async fn blocking<F>(
    manager: Arc<ZoneManager>,
    body: std::result::Result<Json<RecordRequest>, JsonRejection>,
    f: F,
) -> Result<()>
where
    F: FnOnce(&ZoneManager, &RecordRequest) -> Result<()> + Send + 'static,
{
    let Json(req) = body.map_err(|e| Error::invalid(e.body_text()))?;
    tokio::task::spawn_blocking(move || f(&manager, &req))
        .await
        .map_err(|e| Error::Internal(format!("zone task failed: {}", e)))?
}

async fn create_txt_handler(
    State(manager): State<Arc<ZoneManager>>,
    body: std::result::Result<Json<RecordRequest>, JsonRejection>,
) -> Result<()> {
    blocking(manager, body, |m, r| m.add_txt_record(&r.entry, &r.text)).await
}

async fn delete_txt_handler(
    State(manager): State<Arc<ZoneManager>>,
    body: std::result::Result<Json<RecordRequest>, JsonRejection>,
) -> Result<()> {
    blocking(manager, body, |m, r| m.delete_txt_record(&r.entry, &r.text)).await
}

async fn create_a_handler(
    State(manager): State<Arc<ZoneManager>>,
    body: std::result::Result<Json<RecordRequest>, JsonRejection>,
) -> Result<()> {
    blocking(manager, body, |m, r| m.add_a_record(&r.entry, &r.text)).await
}

async fn delete_a_handler(
    State(manager): State<Arc<ZoneManager>>,
    body: std::result::Result<Json<RecordRequest>, JsonRejection>,
) -> Result<()> {
    blocking(manager, body, |m, r| m.delete_a_record(&r.entry, &r.text)).await
}

async fn records_to_publish_handler(State(manager): State<Arc<ZoneManager>>) -> String {
    let mut out = manager.records_to_publish().join("\n");
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::tests::manager;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    async fn text_body(response: axum::response::Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .expect("body");
        String::from_utf8(bytes.to_vec()).expect("utf8")
    }

    #[tokio::test]
    async fn txt_records_round_trip_over_http() {
        let (_dir, m) = manager();
        let m = Arc::new(m);
        let app = router(m.clone());
        let body = serde_json::json!({"domain": "lekva.me", "entry": "_acme-challenge.app", "text": "tok"});

        let created = app
            .clone()
            .oneshot(post_json("/create-txt-record", body.clone()))
            .await
            .expect("response");
        assert_eq!(created.status(), StatusCode::OK);
        let zone = m.read().expect("zone");
        assert_eq!(zone.txt_records("_acme-challenge.app.lekva.me.").count(), 1);

        let deleted = app
            .oneshot(post_json("/delete-txt-record", body))
            .await
            .expect("response");
        assert_eq!(deleted.status(), StatusCode::OK);
        let zone = m.read().expect("zone");
        assert_eq!(zone.txt_records("_acme-challenge.app.lekva.me.").count(), 0);
    }

    #[tokio::test]
    async fn invalid_body_is_bad_request() {
        let (_dir, m) = manager();
        let app = router(Arc::new(m));
        let request = Request::builder()
            .method("POST")
            .uri("/create-txt-record")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .expect("request");
        let response = app.clone().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let bad_ip = app
            .oneshot(post_json("/create-a-record", serde_json::json!({"entry": "x", "text": "nope"})))
            .await
            .expect("response");
        assert_eq!(bad_ip.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn deleting_missing_a_record_is_not_found() {
        let (_dir, m) = manager();
        let response = router(Arc::new(m))
            .oneshot(post_json(
                "/delete-a-record",
                serde_json::json!({"entry": "ghost", "text": "10.9.9.9"}),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn records_to_publish_lists_ds_and_glue() {
        let (_dir, m) = manager();
        let request = Request::builder()
            .uri("/records-to-publish")
            .body(Body::empty())
            .expect("request");
        let response = router(Arc::new(m)).oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = text_body(response).await;
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 5);
        assert!(lines[0].contains("\tDS\t"));
        assert_eq!(lines[2], "lekva 10800 IN NS ns1.lekva.me.");
    }
}
