//! WebSocket transport on top of tokio-tungstenite.
//!
//! Each dial spawns one task owning the socket. The [`WsTransport`] handle
//! only talks to that task through a command channel, so `send` and `close`
//! never block and can be called while holding locks.

use std::borrow::Cow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::USER_AGENT;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, trace, warn};
use url::Url;

use super::{
    ConnectionId, Connector, EventSender, Transport, TransportError, TransportEvent, close_code,
};

/// How long to wait for the server to answer our close frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Default `User-Agent` sent on the upgrade request.
pub fn default_user_agent() -> String {
    format!("liveupdates/{}", env!("CARGO_PKG_VERSION"))
}

/// Check that `host` is an absolute `ws://` or `wss://` URL.
pub fn validate_url(host: &str) -> Result<Url, TransportError> {
    let url = Url::parse(host).map_err(|e| TransportError::InvalidUrl {
        url: host.to_owned(),
        reason: e.to_string(),
    })?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(TransportError::InvalidUrl {
            url: host.to_owned(),
            reason: format!("unsupported scheme '{other}', expected ws or wss"),
        }),
    }
}

/// Dials real WebSocket endpoints.
#[derive(Debug, Clone)]
pub struct WsConnector {
    user_agent: String,
}

impl WsConnector {
    pub fn new() -> Self {
        Self {
            user_agent: default_user_agent(),
        }
    }

    pub fn with_user_agent(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
        }
    }

    fn build_request(&self, url: &Url) -> Result<Request, TransportError> {
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let agent = HeaderValue::from_str(&self.user_agent)
            .map_err(|e| TransportError::Connect(format!("invalid user agent: {e}")))?;
        request.headers_mut().insert(USER_AGENT, agent);
        Ok(request)
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for WsConnector {
    fn connect(
        &self,
        host: &str,
        id: ConnectionId,
        events: EventSender,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let url = validate_url(host)?;
        let request = self.build_request(&url)?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        debug!(%id, %url, "Dialing");
        runtime.spawn(run_socket(id, request, commands_rx, events));

        Ok(Arc::new(WsTransport {
            commands: commands_tx,
            closed: AtomicBool::new(false),
        }))
    }
}

enum Command {
    Text(String),
    Close(u16, String),
}

/// Handle to a socket task.
pub struct WsTransport {
    commands: mpsc::UnboundedSender<Command>,
    closed: AtomicBool,
}

impl Transport for WsTransport {
    fn send(&self, text: String) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.commands
            .send(Command::Text(text))
            .map_err(|_| TransportError::Closed)
    }

    fn close(&self, code: u16, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.commands.send(Command::Close(code, reason.to_owned()));
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self
                .commands
                .send(Command::Close(close_code::NORMAL, String::new()));
        }
    }
}

async fn run_socket(
    id: ConnectionId,
    request: Request,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: EventSender,
) {
    let stream = match connect_async(request).await {
        Ok((stream, _response)) => stream,
        Err(e) => {
            let _ = events.send((id, TransportEvent::Error(e.to_string())));
            return;
        }
    };
    let _ = events.send((id, TransportEvent::Open));

    let (mut sink, mut stream) = stream.split();
    let outcome = loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Text(text)) => {
                    trace!(%id, "-> {text}");
                    if let Err(e) = sink.send(WsMessage::text(text)).await {
                        break TransportEvent::Error(e.to_string());
                    }
                }
                Some(Command::Close(code, reason)) => {
                    break close_handshake(&mut sink, &mut stream, code, reason).await;
                }
                None => {
                    break close_handshake(&mut sink, &mut stream, close_code::NORMAL, String::new()).await;
                }
            },
            frame = stream.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    let _ = events.send((id, TransportEvent::Message(text.to_string())));
                }
                Some(Ok(WsMessage::Close(frame))) => break closed_event(frame),
                Some(Ok(_)) => {}
                Some(Err(e)) => break TransportEvent::Error(e.to_string()),
                None => break TransportEvent::Error("connection reset without close frame".into()),
            },
        }
    };

    debug!(%id, ?outcome, "Socket finished");
    let _ = events.send((id, outcome));
}

/// Send our close frame and wait briefly for the server's reply.
async fn close_handshake(
    sink: &mut SplitSink<WsStream, WsMessage>,
    stream: &mut SplitStream<WsStream>,
    code: u16,
    reason: String,
) -> TransportEvent {
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: Cow::Owned(reason.clone()),
    };
    if let Err(e) = sink.send(WsMessage::Close(Some(frame))).await {
        debug!("Close frame not delivered: {e}");
        return TransportEvent::Closed { code, reason };
    }

    let reply = tokio::time::timeout(CLOSE_TIMEOUT, async {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(WsMessage::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;
    if reply.is_err() {
        warn!(code, "Server did not answer the close frame");
    }
    TransportEvent::Closed { code, reason }
}

fn closed_event(frame: Option<CloseFrame<'_>>) -> TransportEvent {
    match frame {
        Some(frame) => TransportEvent::Closed {
            code: u16::from(frame.code),
            reason: frame.reason.to_string(),
        },
        None => TransportEvent::Closed {
            code: close_code::ABNORMAL,
            reason: String::new(),
        },
    }
}
