//! WebSocket event channel. The HTTP upgrade is routed by the API server,
//! framing and control messages are left to `tungstenite`.

use std::borrow::Cow;
use std::io::ErrorKind;
use std::net::TcpStream;
use std::time::Duration;

use anyhow::{anyhow, Result};
use base64::Engine;
use serde::Serialize;
use tungstenite::handshake::derive_accept_key;
use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::protocol::{CloseFrame, Role, WebSocketConfig};
use tungstenite::{Message, WebSocket};

use crate::congestion::CongestionReport;
use crate::detect::Detection;
use crate::error::PipelineError;
use crate::forward::epoch_seconds;
use crate::geometry::Polygon;
use crate::session::{Session, Sink, TickOutput};

const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_CLIENT_MESSAGE: usize = 64 * 1024;

/// Per-tick message pushed to viewers.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TickMessage<'a> {
    timestamp: f64,
    image: String,
    detections: &'a [Detection],
    roi_polygon: Option<&'a Polygon>,
    upstream_polygon: Option<&'a Polygon>,
    downstream_polygon: Option<&'a Polygon>,
    congestion: &'a CongestionReport,
}

impl<'a> TickMessage<'a> {
    fn from_tick(tick: &'a TickOutput) -> Self {
        let b64 = base64::engine::general_purpose::STANDARD.encode(&tick.jpeg);
        Self {
            timestamp: epoch_seconds(tick.timestamp),
            image: format!("data:image/jpeg;base64,{b64}"),
            detections: &tick.detections,
            roi_polygon: tick.roi.primary_polygon(),
            upstream_polygon: tick.roi.upstream(),
            downstream_polygon: tick.roi.downstream(),
            congestion: &tick.report,
        }
    }
}

fn server_config() -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(MAX_CLIENT_MESSAGE);
    config.max_frame_size = Some(MAX_CLIENT_MESSAGE);
    config
}

pub struct WsSink {
    ws: WebSocket<TcpStream>,
    closed: bool,
}

impl WsSink {
    /// Wrap a socket whose upgrade response has already been written.
    pub fn new(stream: TcpStream) -> Self {
        Self {
            ws: WebSocket::from_raw_socket(stream, Role::Server, Some(server_config())),
            closed: false,
        }
    }

    fn close_with(&mut self, code: CloseCode) {
        if self.closed {
            return;
        }
        self.closed = true;
        let frame = CloseFrame {
            code,
            reason: Cow::Borrowed(""),
        };
        if let Err(err) = self.ws.close(Some(frame)).and_then(|_| self.ws.flush()) {
            log::debug!("websocket close not delivered: {}", err);
        }
    }

    /// Drain whatever the client sent without blocking. Pongs and close
    /// replies queued by the protocol layer are flushed afterwards.
    fn pump_inbound(&mut self) -> Result<()> {
        self.ws.get_mut().set_nonblocking(true)?;
        let read_result = loop {
            match self.ws.read() {
                Ok(Message::Close(frame)) => {
                    log::debug!("websocket client closed: {:?}", frame);
                    self.closed = true;
                    break Ok(());
                }
                Ok(_) => continue,
                Err(tungstenite::Error::Io(err)) if err.kind() == ErrorKind::WouldBlock => {
                    break Ok(())
                }
                Err(err) => break Err(anyhow!(err)),
            }
        };
        self.ws.get_mut().set_nonblocking(false)?;
        read_result?;

        match self.ws.flush() {
            Ok(()) => Ok(()),
            Err(tungstenite::Error::ConnectionClosed) if self.closed => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

impl Sink for WsSink {
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    fn emit(&mut self, tick: &TickOutput) -> Result<()> {
        if self.closed {
            return Err(anyhow!("websocket closed"));
        }
        let message = serde_json::to_string(&TickMessage::from_tick(tick))?;
        self.ws.send(Message::Text(message))?;
        Ok(())
    }

    fn poll_closed(&mut self) -> bool {
        if self.closed {
            return true;
        }
        if let Err(err) = self.pump_inbound() {
            log::debug!("websocket consumer gone: {:#}", err);
            self.closed = true;
        }
        self.closed
    }

    fn fail(&mut self, err: &PipelineError) {
        if self.closed {
            return;
        }
        let body = serde_json::json!({ "error": err.to_string() }).to_string();
        if let Err(send_err) = self.ws.send(Message::Text(body)) {
            log::debug!("websocket error report not delivered: {}", send_err);
        }
        self.close_with(CloseCode::Error);
    }
}

fn handshake(stream: &mut TcpStream, client_key: &str) -> Result<()> {
    use std::io::Write;

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
        derive_accept_key(client_key.trim().as_bytes())
    );
    stream.write_all(response.as_bytes())?;
    stream.flush()?;
    Ok(())
}

pub fn serve(mut stream: TcpStream, client_key: &str, mut session: Session) -> Result<()> {
    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
    handshake(&mut stream, client_key)?;
    let mut sink = WsSink::new(stream);
    match session.run(&mut sink) {
        Ok(_) => sink.close_with(CloseCode::Normal),
        Err(err) => log::info!("websocket session ended: {}", err),
    }
    Ok(())
}
