//! HTTP surface of the dev server: in-memory assets and a reload event stream

use std::{convert::Infallible, net::SocketAddr};

use anyhow::Context as _;
use axum::{
    Router,
    extract::State,
    http::{StatusCode, Uri, header},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::get,
};
use log::{debug, info};
use tokio::{
    net::TcpListener,
    sync::{broadcast, mpsc},
};
use tokio_stream::{Stream, wrappers::ReceiverStream};
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::{DevEvent, DevSession, ServedBuild};
use crate::html::find_ignore_case;

/// Server-sent events endpoint
pub const EVENTS_PATH: &str = "/__loadout/events";

const RELOAD_CLIENT: &str = "<script>
(function () {
  var source = new EventSource(\"/__loadout/events\");
  source.addEventListener(\"reload\", function () { window.location.reload(); });
})();
</script>
";

#[derive(Debug, Clone)]
struct AppState {
    served: ServedBuild,
    events: broadcast::Sender<DevEvent>,
    /// Ends open event streams so graceful shutdown can finish
    shutdown: CancellationToken,
    inline_reload: bool,
    /// `output.public_path` without its leading slash
    public_prefix: String,
}

/// Routes serving the session's last good build; event streams close once `shutdown` fires
pub fn router(session: &DevSession, shutdown: CancellationToken) -> Router {
    let config = session.config();
    let state = AppState {
        served: session.served(),
        events: session.events(),
        shutdown,
        inline_reload: config.dev_server.inline_reload,
        public_prefix: config.output.public_path.trim_start_matches('/').to_owned(),
    };
    Router::new()
        .route(EVENTS_PATH, get(events))
        .fallback(get(asset))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind the configured address
pub async fn bind(host: &str, port: u16) -> anyhow::Result<TcpListener> {
    let listener = TcpListener::bind((host, port))
        .await
        .with_context(|| format!("failed to bind {host}:{port}"))?;
    Ok(listener)
}

/// Serve `router` on `listener` until `shutdown` is cancelled
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr: SocketAddr = listener.local_addr().context("listener has no address")?;
    info!("Dev server listening on http://{addr}");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("dev server failed")
}

async fn events(State(state): State<AppState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    debug!("Reload client connected");
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(forward_events(state.events.subscribe(), tx, state.shutdown));
    Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::default())
}

/// Feed one client until it disconnects or the server shuts down
async fn forward_events(
    mut events: broadcast::Receiver<DevEvent>,
    tx: mpsc::Sender<Result<Event, Infallible>>,
    shutdown: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            () = shutdown.cancelled() => break,
            received = events.recv() => received,
        };
        let event = match received {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let sse = Event::default().event(event.name()).data(event.to_json());
        if tx.send(Ok(sse)).await.is_err() {
            break;
        }
    }
    debug!("Reload client stream closed");
}

async fn asset(State(state): State<AppState>, uri: Uri) -> Response {
    let mut path = uri.path().trim_start_matches('/');
    if !state.public_prefix.is_empty() {
        path = path.strip_prefix(state.public_prefix.as_str()).unwrap_or(path);
    }
    let path = if path.is_empty() || path.ends_with('/') {
        format!("{path}index.html")
    } else {
        path.to_owned()
    };

    let served = state.served.read().await;
    let Some(file) = served.file(&path) else {
        return (StatusCode::NOT_FOUND, format!("{path} not found")).into_response();
    };
    let mime = mime_guess::from_path(&path).first_or_octet_stream();
    let body = if state.inline_reload && mime.subtype() == mime_guess::mime::HTML {
        inject_reload_client(&file.bytes)
    } else {
        file.bytes.clone()
    };
    (
        [
            (header::CONTENT_TYPE, mime.as_ref()),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response()
}

/// Insert the reload client before `</body>`, or append it
fn inject_reload_client(html: &[u8]) -> Vec<u8> {
    let text = String::from_utf8_lossy(html);
    let page = match find_ignore_case(&text, "</body>") {
        Some(idx) => format!("{}{RELOAD_CLIENT}{}", &text[..idx], &text[idx..]),
        None => format!("{text}{RELOAD_CLIENT}"),
    };
    page.into_bytes()
}
