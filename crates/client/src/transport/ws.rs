// WebSocket transport on tokio-tungstenite.
//
// One task per connection owns the socket: it performs the handshake
// (bounded by the connect timeout), forwards inbound text frames, and writes
// frames queued by `send`. `close` aborts the task, which also cancels a
// handshake still in flight.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::connect_async;
use tracing::{debug, warn};

use courier_common::protocol::ws::ClientFrame;

use super::{
    ConnectFailure, ConnectionId, Credentials, SendFailure, Transport, TransportEvent,
    TransportEventKind,
};
use crate::config::validate_ws_url;

struct ConnectionTask {
    outgoing: mpsc::UnboundedSender<String>,
    open: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

pub struct WsTransport {
    events: mpsc::UnboundedSender<TransportEvent>,
    connect_timeout: Duration,
    connections: HashMap<ConnectionId, ConnectionTask>,
}

impl WsTransport {
    pub fn new(events: mpsc::UnboundedSender<TransportEvent>, connect_timeout: Duration) -> Self {
        Self { events, connect_timeout, connections: HashMap::new() }
    }

    fn build_request(endpoint: &str, credentials: &Credentials) -> Result<Request, ConnectFailure> {
        let url = validate_ws_url(endpoint)
            .map_err(|error| ConnectFailure::InvalidEndpoint(error.to_string()))?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|error| ConnectFailure::InvalidEndpoint(error.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", credentials.token))
            .map_err(|_| ConnectFailure::InvalidEndpoint("token is not a valid header value".into()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);
        Ok(request)
    }
}

impl Transport for WsTransport {
    fn open(
        &mut self,
        connection: ConnectionId,
        endpoint: &str,
        credentials: &Credentials,
    ) -> Result<(), ConnectFailure> {
        let request = Self::build_request(endpoint, credentials)?;
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(run_connection(
            connection,
            request,
            outgoing_rx,
            self.events.clone(),
            Arc::clone(&open),
            self.connect_timeout,
        ));

        if let Some(previous) = self.connections.insert(connection, ConnectionTask { outgoing, open, task })
        {
            previous.task.abort();
        }
        Ok(())
    }

    fn send(&mut self, connection: ConnectionId, frame: &ClientFrame) -> Result<(), SendFailure> {
        let Some(conn) = self.connections.get(&connection) else {
            return Err(SendFailure::NotOpen(connection));
        };
        if !conn.open.load(Ordering::Acquire) {
            return Err(SendFailure::NotOpen(connection));
        }
        conn.outgoing.send(frame.encode()).map_err(|_| SendFailure::NotOpen(connection))
    }

    fn close(&mut self, connection: ConnectionId) {
        if let Some(conn) = self.connections.remove(&connection) {
            conn.open.store(false, Ordering::Release);
            conn.task.abort();
            debug!(%connection, "websocket connection closed");
        }
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        for (_, conn) in self.connections.drain() {
            conn.task.abort();
        }
    }
}

async fn run_connection(
    connection: ConnectionId,
    request: Request,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<TransportEvent>,
    open: Arc<AtomicBool>,
    connect_timeout: Duration,
) {
    let emit = |kind| events.send(TransportEvent::new(connection, kind)).is_ok();

    let socket = match tokio::time::timeout(connect_timeout, connect_async(request)).await {
        Ok(Ok((socket, _response))) => socket,
        Ok(Err(error)) => {
            emit(TransportEventKind::Error(format!("websocket handshake failed: {error}")));
            return;
        }
        Err(_) => {
            emit(TransportEventKind::Error("websocket connect timed out".to_string()));
            return;
        }
    };

    open.store(true, Ordering::Release);
    if !emit(TransportEventKind::Opened) {
        return;
    }

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            outbound = outgoing.recv() => {
                let Some(text) = outbound else {
                    let _ = sink.close().await;
                    return;
                };
                if let Err(error) = sink.send(Message::Text(text.into())).await {
                    open.store(false, Ordering::Release);
                    emit(TransportEventKind::Error(format!("websocket write failed: {error}")));
                    return;
                }
            }
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    if !emit(TransportEventKind::Frame(text.as_str().to_owned())) {
                        return;
                    }
                }
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => {
                        if !emit(TransportEventKind::Frame(text)) {
                            return;
                        }
                    }
                    Err(_) => warn!(%connection, "dropping non-utf8 binary frame"),
                },
                Some(Ok(Message::Close(_))) | None => {
                    open.store(false, Ordering::Release);
                    emit(TransportEventKind::Closed);
                    return;
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Err(error)) => {
                    open.store(false, Ordering::Release);
                    emit(TransportEventKind::Error(format!("websocket read failed: {error}")));
                    return;
                }
            },
        }
    }
}
