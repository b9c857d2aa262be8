//! HTTP route handlers.

use std::io;
use std::time::{Duration, Instant};

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use futures::TryStreamExt;
use futures::stream::Stream;
use labproxy::ProxyError;
use labproxy::core::frame::END_MARKER;
use labproxy::io::executor::{Completion, ResponseEvent, RunningCommand, send_outputs};
use labproxy::io::frame_io::{AsyncFrameReader, drain};
use labproxy::io::intake::{self, Invocation};
use labproxy::io::workspace::Workspace;
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;
use tower_http::trace::TraceLayer;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::state::AppState;

/// Response events buffered between the command and a slow client.
const RESPONSE_BUFFER: usize = 16;

/// Build the server router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/", post(run_command))
        .route("/{*path}", post(run_command))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok\n"
}

/// POST / - run one command and stream its result.
async fn run_command(State(state): State<AppState>, body: Body) -> Response {
    let request_id = Uuid::new_v4().simple().to_string();
    let span = info_span!("request", id = %request_id);
    handle(state, body, request_id).instrument(span).await
}

async fn handle(state: AppState, body: Body, request_id: String) -> Response {
    let started = Instant::now();
    let stream = body.into_data_stream().map_err(io::Error::other);
    let mut reader = AsyncFrameReader::new(StreamReader::new(stream));

    let (invocation, workspace) =
        match intake::receive(&mut reader, &state.executor, &request_id).await {
            Ok(received) => received,
            Err(err) => {
                warn!(err = %err, "request rejected");
                // Read the rest of the upload so the client gets to see the
                // error instead of a reset connection.
                if let Err(err) = drain(reader.into_inner()).await {
                    debug!(err = %err, "draining rejected request failed");
                }
                return error_response(&err);
            }
        };
    let received = started.elapsed();

    let running = match state.executor.launch(&invocation, &workspace) {
        Ok(running) => running,
        Err(err) => {
            close_workspace(workspace).await;
            return error_response(&err);
        }
    };

    let (tx, rx) = mpsc::channel(RESPONSE_BUFFER);
    tokio::spawn(
        finish(
            running,
            invocation,
            workspace,
            tx,
            Timings { started, received },
        )
        .in_current_span(),
    );

    (
        StatusCode::OK,
        [(CONTENT_TYPE, "application/octet-stream")],
        Body::from_stream(response_stream(rx)),
    )
        .into_response()
}

struct Timings {
    started: Instant,
    received: Duration,
}

/// Relay the running command, then send outputs and the exit status.
///
/// The workspace is removed before the exit frame goes out, so a client that
/// has seen a complete result never races the cleanup.
async fn finish(
    running: RunningCommand,
    invocation: Invocation,
    workspace: Workspace,
    tx: mpsc::Sender<ResponseEvent>,
    timings: Timings,
) {
    let run_started = Instant::now();
    let code = match running.relay(&tx).await {
        Ok(Completion::Exited(code)) | Ok(Completion::TimedOut(code)) => code,
        Ok(Completion::Disconnected) => {
            info!(command = %invocation.display(), "client disconnected, command killed");
            close_workspace(workspace).await;
            return;
        }
        Err(err) => {
            error!(command = %invocation.display(), err = %err, "relaying command output failed");
            close_workspace(workspace).await;
            return;
        }
    };
    let ran = run_started.elapsed();

    if send_outputs(&invocation, &workspace, &tx).await.is_err() {
        info!(command = %invocation.display(), "client disconnected while sending outputs");
        close_workspace(workspace).await;
        return;
    }
    close_workspace(workspace).await;

    if tx.send(ResponseEvent::Exit(code)).await.is_err() {
        info!(command = %invocation.display(), "client disconnected before exit status");
        return;
    }
    info!(
        command = %invocation.display(),
        exit_code = code,
        receive_ms = millis(timings.received),
        run_ms = millis(ran),
        total_ms = millis(timings.started.elapsed()),
        "request finished"
    );
}

/// Encode events into the response body. The end marker follows the exit
/// frame; a body that stops without it tells the client the result is
/// incomplete.
fn response_stream(
    mut rx: mpsc::Receiver<ResponseEvent>,
) -> impl Stream<Item = Result<Bytes, io::Error>> {
    async_stream::stream! {
        while let Some(event) = rx.recv().await {
            let is_exit = matches!(event, ResponseEvent::Exit(_));
            match event.encode() {
                Ok(frame) => {
                    yield Ok::<Bytes, io::Error>(Bytes::from(frame));
                }
                Err(err) => {
                    error!(err = %err, "encoding response frame failed");
                    yield Err(io::Error::other(err));
                    break;
                }
            }
            if is_exit {
                yield Ok(Bytes::from_static(END_MARKER));
                break;
            }
        }
    }
}

async fn close_workspace(workspace: Workspace) {
    let request_id = workspace.request_id().to_string();
    match tokio::task::spawn_blocking(move || workspace.end()).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(%request_id, err = %err, "removing workspace failed"),
        Err(err) => warn!(%request_id, err = %err, "workspace cleanup task failed"),
    }
}

fn error_response(err: &ProxyError) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(err.to_body())).into_response()
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
