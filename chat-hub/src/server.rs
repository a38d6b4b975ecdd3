use std::{
    future::{Future, ready},
    net::SocketAddr,
};

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{
        Query, State,
        ws::{Message as Frame, WebSocket, WebSocketUpgrade},
    },
    response::Response,
    routing::get,
};
use futures::{Sink, SinkExt, Stream, StreamExt, stream::SplitStream};
use serde::Deserialize;
use tokio::{net::TcpListener, sync::mpsc};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::{
    hub::{self, HubHandle},
    message::Message,
    session::{ClientSession, resolve_display_name},
};

/// Default number of messages queued per connection before fan-out waits.
pub const DEFAULT_OUTBOUND_BUFFER: usize = 32;

pub struct ChatServer {
    listener: TcpListener,
    state: AppState,
}

#[derive(Clone)]
struct AppState {
    hub: HubHandle,
    outbound_buffer: usize,
}

#[derive(Debug, Deserialize)]
struct ConnectQuery {
    username: Option<String>,
}

impl ChatServer {
    /// Starts the hub loop and prepares to serve `/ws` on `listener`.
    pub fn new(listener: TcpListener, outbound_buffer: usize) -> Self {
        Self {
            listener,
            state: AppState {
                hub: hub::spawn(),
                outbound_buffer: outbound_buffer.max(1),
            },
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let ChatServer { listener, state } = self;
        axum::serve(listener, router(state))
            .with_graceful_shutdown(shutdown)
            .await
            .context("http server failed")?;
        info!("chat hub shutting down");
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ConnectQuery>,
    State(state): State<AppState>,
) -> Response {
    let name = resolve_display_name(query.username.as_deref());
    ws.on_failed_upgrade(|err| warn!(error = %err, "websocket upgrade failed"))
        .on_upgrade(move |socket| handle_socket(socket, name, state))
}

async fn handle_socket(socket: WebSocket, name: String, state: AppState) {
    let (sink, stream) = socket.split();
    let (outbound_tx, outbound_rx) = mpsc::channel(state.outbound_buffer);
    let writer = tokio::spawn(write_outbound(sink, outbound_rx));

    let session = match ClientSession::start(state.hub, name, outbound_tx).await {
        Ok(session) => session,
        Err(err) => {
            warn!(error = ?err, "failed to register session");
            writer.abort();
            return;
        }
    };
    let id = session.id();
    info!(session = %id, name = session.name(), "client connected");

    if let Err(err) = session.run(text_frames(stream)).await {
        warn!(session = %id, error = ?err, "session closed with error");
    }

    // The writer drains whatever the hub queued before the leave and exits
    // once the hub drops this member's sender.
    if let Err(err) = writer.await {
        debug!(session = %id, error = ?err, "writer task ended abnormally");
    }
}

/// Adapts the socket into a stream of message bodies.
///
/// Binary payloads are read as lossy UTF-8, control frames are skipped and a
/// close frame ends the stream.
fn text_frames(
    stream: SplitStream<WebSocket>,
) -> impl Stream<Item = Result<String, axum::Error>> + Unpin {
    stream
        .take_while(|frame| ready(!matches!(frame, Ok(Frame::Close(_)))))
        .filter_map(|frame| {
            ready(match frame {
                Ok(Frame::Text(text)) => Some(Ok(text)),
                Ok(Frame::Binary(bytes)) => {
                    Some(Ok(String::from_utf8_lossy(&bytes).into_owned()))
                }
                Ok(_) => None,
                Err(err) => Some(Err(err)),
            })
        })
}

async fn write_outbound<S>(mut sink: S, mut outbound: mpsc::Receiver<Message>)
where
    S: Sink<Frame> + Unpin,
    S::Error: std::fmt::Display,
{
    while let Some(message) = outbound.recv().await {
        let text = match message.to_json() {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "failed to encode message");
                continue;
            }
        };
        if let Err(err) = sink.send(Frame::Text(text)).await {
            debug!(error = %err, "failed to write to websocket");
            return;
        }
    }
    if let Err(err) = sink.close().await {
        debug!(error = %err, "failed to close websocket");
    }
}
