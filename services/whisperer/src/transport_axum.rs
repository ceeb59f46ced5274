use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use auth::SESSION_TOKEN_HEADER;
use axum::{
    Router,
    body::Body,
    extract::{Path, Query, State, rejection::QueryRejection},
    http::{HeaderMap, HeaderValue, StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
    routing::get,
};
use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tower_http::{compression::CompressionLayer, trace::TraceLayer};

use crate::error::{DetailedError, FailureKind};
use crate::metrics;
use crate::pipeline::{DataRequest, Gateway};
use crate::query::DataQueryParams;
use crate::stream::{ResponseSink, SinkClosed};

const BODY_CHANNEL_CAPACITY: usize = 32;

#[derive(Clone)]
struct AppState {
    gateway: Arc<Gateway>,
}

pub fn router(gateway: Arc<Gateway>) -> Router {
    let data_routes = Router::new()
        .route("/:user_id", get(get_data))
        .layer(CompressionLayer::new());

    Router::new()
        .route("/status", get(get_status))
        .route("/metrics", get(get_metrics))
        .merge(data_routes)
        .with_state(AppState { gateway })
        .layer(TraceLayer::new_for_http())
}

pub async fn serve<F>(listener: TcpListener, gateway: Arc<Gateway>, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(gateway))
        .with_graceful_shutdown(shutdown)
        .await
}

/// Resolves on ctrl-c or, on unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}

async fn get_status(State(state): State<AppState>) -> Response {
    let started_at = Instant::now();
    let response = match state.gateway.check_status().await {
        Ok(()) => (
            StatusCode::OK,
            [(CONTENT_TYPE, HeaderValue::from_static("text/plain"))],
            "OK\n",
        )
            .into_response(),
        Err(err) => {
            err.log("status", started_at);
            err.into_response()
        }
    };
    metrics::observe_http_request("status", response.status().as_u16(), started_at.elapsed());
    response
}

async fn get_metrics() -> Response {
    match metrics::render() {
        Ok((body, content_type)) => ([(CONTENT_TYPE, content_type)], body).into_response(),
        Err(err) => {
            tracing::warn!(error = %err, "metrics render failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn get_data(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    params: Result<Query<DataQueryParams>, QueryRejection>,
    headers: HeaderMap,
) -> Response {
    let started_at = Instant::now();
    let params = match params {
        Ok(Query(params)) => params,
        Err(rejection) => {
            let err = DetailedError::new(FailureKind::ParameterParse).with_internal(rejection.body_text());
            err.log("start", started_at);
            return respond("data", err.into_response(), started_at);
        }
    };

    let request = DataRequest {
        target_user_id: user_id,
        session_token: headers
            .get(SESSION_TOKEN_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
        params,
    };

    let (head_tx, head_rx) = oneshot::channel();
    let gateway = state.gateway.clone();
    tokio::spawn(async move {
        gateway.serve_data(request, ChannelSink::new(head_tx)).await;
    });

    let response = match head_rx.await {
        Ok(response) => response,
        Err(_) => {
            let err = DetailedError::new(FailureKind::QueryExecution)
                .with_internal("request pipeline ended without a response");
            err.log("start", started_at);
            err.into_response()
        }
    };
    respond("data", response, started_at)
}

fn respond(route: &str, response: Response, started_at: Instant) -> Response {
    metrics::observe_http_request(route, response.status().as_u16(), started_at.elapsed());
    response
}

/// Hands the response head to the waiting handler over a oneshot, then feeds
/// the body through a bounded channel. A dropped body receiver means the
/// client went away.
struct ChannelSink {
    head: Option<oneshot::Sender<Response>>,
    body: Option<mpsc::Sender<Result<Bytes, Infallible>>>,
}

impl ChannelSink {
    fn new(head: oneshot::Sender<Response>) -> Self {
        Self {
            head: Some(head),
            body: None,
        }
    }
}

#[async_trait]
impl ResponseSink for ChannelSink {
    async fn reject(&mut self, error: &DetailedError) -> Result<(), SinkClosed> {
        let head = self.head.take().ok_or(SinkClosed)?;
        head.send(error.clone().into_response())
            .map_err(|_| SinkClosed)
    }

    async fn commit(&mut self) -> Result<(), SinkClosed> {
        let head = self.head.take().ok_or(SinkClosed)?;
        let (tx, rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
        let mut response = Response::new(Body::from_stream(ReceiverStream::new(rx)));
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        head.send(response).map_err(|_| SinkClosed)?;
        self.body = Some(tx);
        Ok(())
    }

    async fn send(&mut self, chunk: Bytes) -> Result<(), SinkClosed> {
        let body = self.body.as_ref().ok_or(SinkClosed)?;
        body.send(Ok(chunk)).await.map_err(|_| SinkClosed)
    }
}
