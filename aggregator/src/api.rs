use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use clap::Args;
use log::{error, info};
use queue_models::probe_record::ProbeRecord;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::store::RecordStore;

#[derive(Args, Clone, Debug)]
#[group(id = "api")]
pub struct Params {
    /// Address for the HTTP read API to listen on
    #[arg(long, env = "API_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    api_listen_addr: SocketAddr,
}

/// Serves the stored records until the stop token is cancelled.
pub async fn run<S: RecordStore>(
    store: Arc<S>,
    stop_rx: CancellationToken,
    params: Params,
) -> Result<()> {
    let listener = TcpListener::bind(params.api_listen_addr)
        .await
        .with_context(|| format!("while binding read API to {}", params.api_listen_addr))?;
    info!("Read API listening on {}.", params.api_listen_addr);

    axum::serve(listener, router(store))
        .with_graceful_shutdown(async move { stop_rx.cancelled().await })
        .await
        .context("while serving read API")
}

pub fn router<S: RecordStore>(store: Arc<S>) -> Router {
    Router::new()
        .route("/pings", get(list_pings::<S>))
        .with_state(store)
}

async fn list_pings<S: RecordStore>(
    State(store): State<Arc<S>>,
) -> Result<Json<Vec<ProbeRecord>>, StatusCode> {
    match store.list().await {
        Ok(records) => Ok(Json(records)),
        Err(e) => {
            error!("Unable to list stored pings: {:?}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[cfg(test)]
mod tests {
    use assertor::{assert_that, EqualityAssertion};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::test_utils::{record, MemoryStore};

    use super::*;

    async fn given_store_with(records: Vec<ProbeRecord>) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::default());
        store.upsert(&records).await.unwrap();
        store
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn lists_records_ordered_by_address() {
        // given
        let store =
            given_store_with(vec![record("10.0.0.2", 7), record("10.0.0.1", 5)]).await;

        // when
        let response = router(store).oneshot(get_request("/pings")).await.unwrap();

        // then
        assert_that!(response.status()).is_equal_to(StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let listed: Vec<ProbeRecord> = serde_json::from_slice(&body).unwrap();
        assert_that!(listed).is_equal_to(vec![record("10.0.0.1", 5), record("10.0.0.2", 7)]);
    }

    #[tokio::test]
    async fn empty_store_gives_empty_array() {
        // given
        let store = given_store_with(vec![]).await;

        // when
        let response = router(store).oneshot(get_request("/pings")).await.unwrap();

        // then
        assert_that!(response.status()).is_equal_to(StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_that!(&body[..]).is_equal_to(&b"[]"[..]);
    }

    #[tokio::test]
    async fn storage_failure_is_500() {
        // given
        let store = given_store_with(vec![record("10.0.0.1", 5)]).await;
        store.set_failing(true);

        // when
        let response = router(store).oneshot(get_request("/pings")).await.unwrap();

        // then
        assert_that!(response.status()).is_equal_to(StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn unknown_path_is_404() {
        // given
        let store = given_store_with(vec![]).await;

        // when
        let response = router(store).oneshot(get_request("/nope")).await.unwrap();

        // then
        assert_that!(response.status()).is_equal_to(StatusCode::NOT_FOUND);
    }
}
