//! HTTP side of the relay, for networks that only let web traffic through.
//!
//! `GET/POST /relay?session=<id>` joins the same session registry as the
//! TCP listener: the request body is the inbound byte stream and the
//! response body streams the outbound bytes, one frame per write. This
//! only behaves as a duplex pipe when the peer keeps the request body
//! open while reading the response.

use crate::relay::server::join_session;
use crate::relay::session::SessionRegistry;
use crate::stats::Stats;
use crate::transport::{BodyFrame, Transport};
use axum::body::Body;
use axum::extract::{ConnectInfo, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use chrono::Local;
use serde::Deserialize;
use std::io::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc::channel;
use tokio::task;
use tokio_stream::wrappers::ReceiverStream;

#[derive(Clone)]
struct HttpState {
    registry: Arc<SessionRegistry>,
    stats: Arc<Stats>,
}

/// Serve the relay and status endpoints on an already-bound listener.
pub(crate) async fn serve(
    listener: TcpListener,
    registry: Arc<SessionRegistry>,
    stats: Arc<Stats>,
) -> Result<()> {
    let state = HttpState { registry, stats };
    let app = Router::new()
        .route("/", get(status_page))
        .route("/relay", any(relay_endpoint))
        .with_state(state);

    log::info!("http relay listening on {}", listener.local_addr()?);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}

#[derive(Deserialize)]
struct RelayQuery {
    session: Option<String>,
}

async fn relay_endpoint(
    State(state): State<HttpState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Query(query): Query<RelayQuery>,
    request: Request,
) -> Response {
    let session = match query.session {
        Some(id) if !id.is_empty() => id,
        _ => return (StatusCode::BAD_REQUEST, "missing session id\n").into_response(),
    };

    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_owned();

    let (tx, rx) = channel::<BodyFrame>(16);
    let conn = Transport::http(request.into_body(), tx, remote.to_string(), host);

    let registry = state.registry.clone();
    task::spawn(join_session(registry, conn, session));

    Body::from_stream(ReceiverStream::new(rx)).into_response()
}

async fn status_page(State(state): State<HttpState>) -> String {
    format!(
        "Network Pipe Relay\n\
         ------------------\n\n\
         Active sessions: {}\n\
         Server time: {}\n\
         Uptime: {}s\n",
        state.registry.len(),
        Local::now().to_rfc2822(),
        state.stats.uptime().as_secs(),
    )
}
