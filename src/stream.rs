use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::client::Client;
use crate::message::{self, Payload, SubscribeMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long `subscribe` waits for the server's acknowledgment.
pub const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Error type the stream handler may return. Handler errors are logged
/// and the stream keeps running; they never tear the subscription down.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Errors returned while establishing a subscription.
///
/// All of these are raised before any background task starts; on every
/// path the socket (if one was opened) has already been closed.
#[derive(Error, Debug)]
pub enum SubscribeError {
    /// The base endpoint's scheme could not be rewritten for the
    /// stream socket.
    #[error("unsupported endpoint scheme '{0}'")]
    Scheme(String),
    /// Connecting the socket, or reading from it during the handshake,
    /// failed at the transport level.
    #[error("websocket error: {0}")]
    Ws(#[from] tungstenite::Error),
    /// The subscribe request could not be serialized.
    #[error("encode subscribe request: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    /// No acknowledgment arrived within the handshake timeout.
    #[error("stream subscribe timed out")]
    Timeout,
    /// The acknowledgment frame did not decode.
    #[error("stream subscribe failed ({0})")]
    Rejected(#[source] rmp_serde::decode::Error),
    /// The acknowledged stream set differs from the requested one.
    #[error("stream subscribe failed")]
    TopicMismatch,
    /// The server went away before acknowledging.
    #[error("stream subscribe failed (connection closed)")]
    ConnectionClosed,
}

/// Options for `Client::subscribe_with_options`.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Bound on the wait for the server's acknowledgment.
    pub handshake_timeout: Duration,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: SUBSCRIBE_TIMEOUT,
        }
    }
}

/// Why a subscription's dispatch loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The connection ended (server close frame, stream end, or a
    /// transport error, which is logged by the reader).
    ConnectionClosed,
    /// The caller's cancellation token fired.
    Cancelled,
}

/// Completion handle for an established subscription.
///
/// `subscribe` returns once the handshake is acknowledged; from then on
/// delivery happens on background tasks and the only caller-visible
/// lifecycle event is this handle resolving. It resolves exactly once,
/// after the dispatch loop has exited and the connection is being
/// retired.
#[derive(Debug)]
pub struct StreamHandle {
    done: oneshot::Receiver<StreamEnd>,
}

impl StreamHandle {
    /// Wait for the subscription to finish.
    pub async fn done(self) -> StreamEnd {
        // The dispatch task always reports before dropping the sender;
        // a recv error can only mean the task was torn down mid-report.
        self.done.await.unwrap_or(StreamEnd::ConnectionClosed)
    }
}

impl Client {
    /// Subscribe to a set of streams and dispatch updates to `handler`.
    ///
    /// Opens the service's stream socket, performs the subscribe
    /// handshake, and starts the background reader and dispatch tasks
    /// only once the server has acknowledged the exact requested
    /// stream set. `handler` is invoked once per decoded [`Payload`], in
    /// arrival order, never concurrently. A handler error is logged and
    /// delivery continues.
    ///
    /// `cancel` is observed between deliveries: cancelling stops
    /// dispatch promptly and closes the connection. The returned
    /// [`StreamHandle`] resolves when the subscription has fully wound
    /// down, whichever side ended it.
    pub async fn subscribe<H, I, S>(
        &self,
        handler: H,
        cancel: CancellationToken,
        streams: I,
    ) -> Result<StreamHandle, SubscribeError>
    where
        H: FnMut(Payload) -> Result<(), HandlerError> + Send + 'static,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subscribe_with_options(handler, cancel, streams, SubscribeOptions::default())
            .await
    }

    /// `subscribe` with explicit options.
    pub async fn subscribe_with_options<H, I, S>(
        &self,
        handler: H,
        cancel: CancellationToken,
        streams: I,
        options: SubscribeOptions,
    ) -> Result<StreamHandle, SubscribeError>
    where
        H: FnMut(Payload) -> Result<(), HandlerError> + Send + 'static,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let url = stream_endpoint(self.base_url())?;
        let request = SubscribeMessage::new(streams);
        let buf = message::encode(&request)?;

        let (mut ws, _) = connect_async(url.as_str()).await?;

        if let Err(e) = ws.send(Message::Binary(buf.into())).await {
            let _ = ws.close(None).await;
            return Err(SubscribeError::Ws(e));
        }

        let ack = match handshake_reply(&mut ws, options.handshake_timeout).await {
            Ok(ack) => ack,
            Err(e) => {
                let _ = ws.close(None).await;
                return Err(e);
            }
        };

        if !message::streams_equal(&request.streams, &ack.streams) {
            let _ = ws.close(None).await;
            return Err(SubscribeError::TopicMismatch);
        }

        debug!(streams = ?request.streams, "stream subscription established");
        Ok(spawn_stream(ws, handler, cancel))
    }
}

/// Rewrite the service base endpoint into its stream-socket URL:
/// scheme mapped to `ws`/`wss`, path suffixed with `/ws`.
fn stream_endpoint(base: &Url) -> Result<Url, SubscribeError> {
    let mut url = base.clone();
    let scheme = match base.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    if url.set_scheme(scheme).is_err() {
        return Err(SubscribeError::Scheme(base.scheme().to_string()));
    }
    let path = format!("{}/ws", base.path().trim_end_matches('/'));
    url.set_path(&path);
    Ok(url)
}

/// Wait up to `wait` for the single acknowledgment frame and decode it.
async fn handshake_reply(
    ws: &mut WsStream,
    wait: Duration,
) -> Result<SubscribeMessage, SubscribeError> {
    let reply = match timeout(wait, next_data_frame(ws)).await {
        Err(_) => return Err(SubscribeError::Timeout),
        Ok(None) => return Err(SubscribeError::ConnectionClosed),
        Ok(Some(Err(e))) => return Err(SubscribeError::Ws(e)),
        Ok(Some(Ok(buf))) => buf,
    };
    message::decode::<SubscribeMessage>(&reply).map_err(SubscribeError::Rejected)
}

/// Pull the next data frame off the socket, handling control frames
/// inline.
///
/// This one primitive serves both the bounded handshake read and the
/// steady-state reader loop. Text and Binary frames are both data.
/// Keepalive is reactive and symmetric: a Ping is answered with a Pong
/// and a Pong with a Ping, since the service expects traffic in both
/// directions rather than the usual pong-only reply. Returns `None` on a
/// Close frame or when the stream ends.
async fn next_data_frame(ws: &mut WsStream) -> Option<Result<Bytes, tungstenite::Error>> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Binary(buf))) => return Some(Ok(buf)),
            Some(Ok(Message::Text(text))) => return Some(Ok(text.into())),
            Some(Ok(Message::Ping(buf))) => {
                if let Err(e) = ws.send(Message::Pong(buf)).await {
                    return Some(Err(e));
                }
            }
            Some(Ok(Message::Pong(buf))) => {
                if let Err(e) = ws.send(Message::Ping(buf)).await {
                    return Some(Err(e));
                }
            }
            Some(Ok(Message::Close(_))) => return None,
            Some(Ok(Message::Frame(_))) => {}
            Some(Err(e)) => return Some(Err(e)),
            None => return None,
        }
    }
}

fn spawn_stream<H>(ws: WsStream, handler: H, cancel: CancellationToken) -> StreamHandle
where
    H: FnMut(Payload) -> Result<(), HandlerError> + Send + 'static,
{
    // Single-slot buffer between reader and dispatcher: the reader
    // blocks here when the handler lags, so nothing queues unbounded.
    let (frame_tx, frame_rx) = mpsc::channel::<Bytes>(1);
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let (done_tx, done_rx) = oneshot::channel::<StreamEnd>();

    tokio::spawn(run_reader(ws, frame_tx, shutdown_rx));
    tokio::spawn(run_dispatch(frame_rx, handler, cancel, shutdown_tx, done_tx));

    StreamHandle { done: done_rx }
}

/// Reader task: sole owner of the socket. Forwards data frames until
/// the connection ends or the dispatcher signals shutdown, then closes
/// the socket. Dropping `frame_tx` on exit is what tells the
/// dispatcher the connection is gone.
async fn run_reader(
    mut ws: WsStream,
    frame_tx: mpsc::Sender<Bytes>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                let _ = ws.close(None).await;
                break;
            }
            next = next_data_frame(&mut ws) => match next {
                Some(Ok(buf)) => {
                    if frame_tx.send(buf).await.is_err() {
                        // Dispatcher already gone.
                        let _ = ws.close(None).await;
                        break;
                    }
                }
                Some(Err(e)) => {
                    if !is_clean_close(&e) {
                        warn!(error = %e, "unexpected websocket closure");
                    }
                    break;
                }
                None => break,
            }
        }
    }
}

fn is_clean_close(err: &tungstenite::Error) -> bool {
    matches!(
        err,
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed
    )
}

/// Dispatch task: decodes frames and runs the handler, racing the
/// cancellation token. Decode and handler failures are per-message:
/// logged, then the loop moves on. On exit it retires the reader
/// (which closes the socket) and fires the completion signal once.
async fn run_dispatch<H>(
    mut frame_rx: mpsc::Receiver<Bytes>,
    mut handler: H,
    cancel: CancellationToken,
    shutdown_tx: oneshot::Sender<()>,
    done_tx: oneshot::Sender<StreamEnd>,
) where
    H: FnMut(Payload) -> Result<(), HandlerError> + Send + 'static,
{
    let end = loop {
        tokio::select! {
            // Cancellation wins over a pending frame.
            biased;
            _ = cancel.cancelled() => break StreamEnd::Cancelled,
            next = frame_rx.recv() => {
                let Some(buf) = next else {
                    break StreamEnd::ConnectionClosed;
                };
                let payload = match message::decode::<Payload>(&buf) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, "error decoding stream message");
                        continue;
                    }
                };
                if let Err(e) = handler(payload) {
                    warn!(error = %e, "error handling stream message");
                }
            }
        }
    };

    let _ = shutdown_tx.send(());
    debug!(?end, "stream dispatch finished");
    let _ = done_tx.send(end);
}
