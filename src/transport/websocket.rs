//! [`Connection`] over a `tokio-tungstenite` WebSocket stream.

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio::time::{Instant, timeout_at};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{self, Message};

use super::{Connection, Frame, TransportError};

/// A WebSocket split into independently lockable write and read halves, so
/// the heartbeat sender and the inbound reader never wait on each other.
///
/// Pings received from the peer are answered by `tungstenite` itself; they
/// are still surfaced as [`Frame::Ping`] so they can count as liveness
/// evidence.
pub struct WebSocketConnection<S> {
    sink: Mutex<SplitSink<WebSocketStream<S>, Message>>,
    stream: Mutex<SplitStream<WebSocketStream<S>>>,
}

impl<S> WebSocketConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wraps an already-upgraded WebSocket stream.
    pub fn new(ws: WebSocketStream<S>) -> Self {
        let (sink, stream) = ws.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
        }
    }
}

impl<S> Connection for WebSocketConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send_frame(&self, frame: Frame, deadline: Instant) -> Result<(), TransportError> {
        let message = into_message(frame);
        let send = async {
            let mut sink = self.sink.lock().await;
            sink.send(message).await
        };
        match timeout_at(deadline, send).await {
            Ok(result) => result.map_err(TransportError::from),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn receive_frame(&self, deadline: Instant) -> Result<Frame, TransportError> {
        let receive = async {
            let mut stream = self.stream.lock().await;
            loop {
                match stream.next().await {
                    Some(Ok(message)) => {
                        if let Some(frame) = from_message(message) {
                            return Ok(frame);
                        }
                    }
                    Some(Err(e)) => return Err(TransportError::from(e)),
                    None => return Err(TransportError::Closed),
                }
            }
        };
        timeout_at(deadline, receive)
            .await
            .unwrap_or(Err(TransportError::Timeout))
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut sink = self.sink.lock().await;
        match sink.close().await {
            Ok(())
            | Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn into_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Binary(data) => Message::Binary(data),
        Frame::Ping(data) => Message::Ping(data),
        Frame::Pong(data) => Message::Pong(data),
        Frame::Close => Message::Close(None),
    }
}

// Raw `Message::Frame` values are never produced by reads.
fn from_message(message: Message) -> Option<Frame> {
    match message {
        Message::Text(text) => Some(Frame::Text(text.as_str().to_owned())),
        Message::Binary(data) => Some(Frame::Binary(data)),
        Message::Ping(data) => Some(Frame::Ping(data)),
        Message::Pong(data) => Some(Frame::Pong(data)),
        Message::Close(_) => Some(Frame::Close),
        Message::Frame(_) => None,
    }
}
