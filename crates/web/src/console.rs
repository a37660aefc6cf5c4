//! Interactive console bridge: one client WebSocket multiplexing any number
//! of upstream PTY sessions, each an independent WebSocket to the owning
//! node's `/vms/{id}/tty`.
//!
//! Client frames are a closed set: `{control: open|close|focus, sid}`,
//! `{data, sid?, broadcast?}`, plain text (command to the active session),
//! or binary (raw bytes to the active session). Unknown tags are rejected at
//! the boundary. Outgoing text gets a trailing newline appended when
//! missing, so plain text means "run a command".

use crate::client::NodeClient;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlKind {
    Open,
    Close,
    Focus,
}

/// Server -> client envelope.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerFrame {
    Info {
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        sid: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        sessions: Option<Vec<String>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        active: Option<String>,
    },
    Error {
        message: String,
    },
    Stream {
        sid: String,
        payload: String,
    },
    StreamBytes {
        sid: String,
        note: String,
    },
}

impl ServerFrame {
    fn info(message: impl Into<String>) -> Self {
        ServerFrame::Info {
            message: Some(message.into()),
            sid: None,
            sessions: None,
            active: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        ServerFrame::Error {
            message: message.into(),
        }
    }
}

/// Frames queued for the client socket.
enum Outbound {
    Frame(ServerFrame),
    /// Plain text, used for proxy errors.
    Text(String),
    Bytes(Vec<u8>),
    Close,
}

enum SessionEvent {
    Ended(String),
}

type UpstreamSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, TungsteniteMessage>;
type UpstreamStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

struct Session {
    sink: UpstreamSink,
    reader: JoinHandle<()>,
}

/// Append a newline when missing so plain text executes as a command.
/// Control characters pass through unchanged.
pub fn with_newline(data: &str) -> String {
    if data.ends_with('\n') {
        data.to_string()
    } else {
        format!("{data}\n")
    }
}

pub struct ConsoleBridge {
    client: NodeClient,
    vm_id: String,
    sessions: HashMap<String, Session>,
    active_sid: Option<String>,
    out_tx: mpsc::Sender<Outbound>,
    evt_tx: mpsc::Sender<SessionEvent>,
}

/// Drive one client console connection to completion.
pub async fn run_console(socket: WebSocket, client: NodeClient, vm_id: String) {
    let (ws_write, ws_read) = socket.split();
    let (out_tx, out_rx) = mpsc::channel::<Outbound>(256);
    let (evt_tx, evt_rx) = mpsc::channel::<SessionEvent>(16);

    let writer = tokio::spawn(client_writer(ws_write, out_rx));

    let mut bridge = ConsoleBridge {
        client,
        vm_id,
        sessions: HashMap::new(),
        active_sid: None,
        out_tx,
        evt_tx,
    };
    bridge.run(ws_read, evt_rx).await;

    for (_, session) in bridge.sessions.drain() {
        session.reader.abort();
    }
    let _ = writer.await;
}

async fn client_writer(
    mut ws_write: SplitSink<WebSocket, WsMessage>,
    mut out_rx: mpsc::Receiver<Outbound>,
) {
    while let Some(item) = out_rx.recv().await {
        let result = match item {
            Outbound::Frame(frame) => match serde_json::to_string(&frame) {
                Ok(json) => ws_write.send(WsMessage::Text(json)).await,
                Err(_) => continue,
            },
            Outbound::Text(text) => ws_write.send(WsMessage::Text(text)).await,
            Outbound::Bytes(bytes) => ws_write.send(WsMessage::Binary(bytes)).await,
            Outbound::Close => {
                let _ = ws_write.close().await;
                break;
            }
        };
        if result.is_err() {
            break;
        }
    }
}

impl ConsoleBridge {
    async fn run(
        &mut self,
        mut ws_read: SplitStream<WebSocket>,
        mut evt_rx: mpsc::Receiver<SessionEvent>,
    ) {
        // Every connection starts with a single console "s1".
        match self.open_session("s1").await {
            Ok(()) => {
                self.active_sid = Some("s1".to_string());
                self.send_frame(ServerFrame::Info {
                    message: Some("Connected".into()),
                    sid: None,
                    sessions: Some(self.session_ids()),
                    active: self.active_sid.clone(),
                })
                .await;
            }
            Err(e) => {
                self.send(Outbound::Text(format!(
                    "Proxy error: could not connect initial console (s1) ({e})"
                )))
                .await;
                self.send(Outbound::Close).await;
                return;
            }
        }

        loop {
            tokio::select! {
                msg = ws_read.next() => {
                    match msg {
                        Some(Ok(WsMessage::Text(text))) => self.handle_text(text).await,
                        Some(Ok(WsMessage::Binary(data))) => self.handle_binary(data).await,
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!(error = %e, "Client socket error");
                            break;
                        }
                    }
                }
                evt = evt_rx.recv() => {
                    match evt {
                        Some(SessionEvent::Ended(sid)) => {
                            self.close_session(&sid).await;
                            if self.sessions.is_empty() {
                                self.send(Outbound::Close).await;
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    }

    fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn send(&self, item: Outbound) {
        let _ = self.out_tx.send(item).await;
    }

    async fn send_frame(&self, frame: ServerFrame) {
        self.send(Outbound::Frame(frame)).await;
    }

    async fn handle_text(&mut self, text: String) {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) else {
            // Plain text goes to the active session.
            self.send_to_active(&text).await;
            return;
        };
        let Some(obj) = value.as_object() else {
            self.send_to_active(&text).await;
            return;
        };

        if obj.contains_key("control") {
            self.handle_control(&value).await;
            return;
        }

        let Some(data) = obj.get("data").and_then(|d| d.as_str()).map(str::to_string) else {
            self.send_frame(ServerFrame::error("Missing 'data' for command."))
                .await;
            return;
        };

        if obj.get("broadcast").and_then(|b| b.as_bool()) == Some(true) {
            let sids = self.session_ids();
            for sid in sids {
                self.send_to_one(&sid, &data).await;
            }
            return;
        }

        let sid = obj
            .get("sid")
            .and_then(|s| s.as_str())
            .map(str::to_string)
            .or_else(|| self.active_sid.clone());
        match sid {
            Some(sid) if self.sessions.contains_key(&sid) => {
                self.send_to_one(&sid, &data).await;
            }
            other => {
                self.send_frame(ServerFrame::error(format!(
                    "Unknown or inactive sid '{}'.",
                    other.unwrap_or_default()
                )))
                .await;
            }
        }
    }

    async fn handle_binary(&mut self, data: Vec<u8>) {
        let Some(sid) = self.active_sid.clone() else {
            self.send_frame(ServerFrame::error("No active session for binary payload."))
                .await;
            return;
        };
        let Some(session) = self.sessions.get_mut(&sid) else {
            self.send_frame(ServerFrame::error("No active session for binary payload."))
                .await;
            return;
        };
        if let Err(e) = session.sink.send(TungsteniteMessage::Binary(data)).await {
            self.send(Outbound::Text(format!(
                "Proxy error when sending bin upstream[{sid}]: {e}"
            )))
            .await;
            self.close_session(&sid).await;
            self.maybe_close_if_empty().await;
        }
    }

    async fn handle_control(&mut self, value: &serde_json::Value) {
        #[derive(Deserialize)]
        struct ControlFrame {
            control: ControlKind,
            sid: Option<String>,
        }

        let frame: ControlFrame = match serde_json::from_value(value.clone()) {
            Ok(f) => f,
            Err(_) => {
                let tag = value
                    .get("control")
                    .and_then(|c| c.as_str())
                    .unwrap_or("<none>");
                self.send_frame(ServerFrame::error(format!("Unknown control '{tag}'.")))
                    .await;
                return;
            }
        };

        match frame.control {
            ControlKind::Open => {
                let Some(sid) = frame.sid else {
                    self.send_frame(ServerFrame::error("control=open requires a string 'sid'."))
                        .await;
                    return;
                };
                if self.sessions.contains_key(&sid) {
                    self.send_frame(ServerFrame::error(format!(
                        "Session '{sid}' already exists."
                    )))
                    .await;
                    return;
                }
                match self.open_session(&sid).await {
                    Ok(()) => {
                        // A newly opened session takes focus.
                        self.active_sid = Some(sid.clone());
                        self.send_frame(ServerFrame::Info {
                            message: Some("session-opened".into()),
                            sid: Some(sid),
                            sessions: None,
                            active: self.active_sid.clone(),
                        })
                        .await;
                    }
                    Err(e) => {
                        self.send_frame(ServerFrame::error(format!(
                            "Failed to open session '{sid}': {e}"
                        )))
                        .await;
                    }
                }
            }
            ControlKind::Close => {
                let requested = frame.sid.clone();
                let Some(sid) = frame.sid.filter(|s| self.sessions.contains_key(s)) else {
                    self.send_frame(ServerFrame::error(format!(
                        "Unknown sid '{}' to close.",
                        requested.unwrap_or_default()
                    )))
                    .await;
                    return;
                };
                self.close_session(&sid).await;
                self.send_frame(ServerFrame::Info {
                    message: Some("session-closed".into()),
                    sid: Some(sid),
                    sessions: None,
                    active: None,
                })
                .await;
                self.maybe_close_if_empty().await;
            }
            ControlKind::Focus => {
                let requested = frame.sid.clone();
                let Some(sid) = frame.sid.filter(|s| self.sessions.contains_key(s)) else {
                    self.send_frame(ServerFrame::error(format!(
                        "Unknown sid '{}' to focus.",
                        requested.unwrap_or_default()
                    )))
                    .await;
                    return;
                };
                self.active_sid = Some(sid.clone());
                self.send_frame(ServerFrame::Info {
                    message: Some("session-focused".into()),
                    sid: Some(sid),
                    sessions: None,
                    active: None,
                })
                .await;
            }
        }
    }

    /// Open an upstream console to the node and start its reader.
    async fn open_session(&mut self, sid: &str) -> Result<(), String> {
        let mut request = self
            .client
            .tty_url(&self.vm_id)
            .into_client_request()
            .map_err(|e| e.to_string())?;
        request.headers_mut().insert(
            http::header::AUTHORIZATION,
            self.client.bearer().parse().map_err(|_| "bad token")?,
        );

        let (upstream, _) = connect_async(request).await.map_err(|e| e.to_string())?;
        let (mut sink, stream) = upstream.split();

        // Small bootstrap for a pleasant shell.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        sink.send(TungsteniteMessage::Text("cd /app && clear && ls -la\n".into()))
            .await
            .map_err(|e| e.to_string())?;

        let reader = tokio::spawn(pump_upstream(
            sid.to_string(),
            stream,
            self.out_tx.clone(),
            self.evt_tx.clone(),
        ));

        self.sessions.insert(sid.to_string(), Session { sink, reader });
        Ok(())
    }

    async fn close_session(&mut self, sid: &str) {
        if let Some(mut session) = self.sessions.remove(sid) {
            session.reader.abort();
            let _ = session.sink.close().await;
        }
        if self.active_sid.as_deref() == Some(sid) {
            self.active_sid = self.session_ids().first().cloned();
        }
    }

    async fn maybe_close_if_empty(&mut self) {
        if self.sessions.is_empty() {
            self.send(Outbound::Close).await;
        }
    }

    async fn send_to_one(&mut self, sid: &str, data: &str) {
        let payload = with_newline(data);
        let failed = match self.sessions.get_mut(sid) {
            Some(session) => session
                .sink
                .send(TungsteniteMessage::Text(payload))
                .await
                .err(),
            None => return,
        };
        if let Some(e) = failed {
            self.send(Outbound::Text(format!(
                "Proxy error when sending upstream[{sid}]: {e}"
            )))
            .await;
            self.close_session(sid).await;
            self.maybe_close_if_empty().await;
        }
    }

    async fn send_to_active(&mut self, data: &str) {
        match self.active_sid.clone() {
            Some(sid) => self.send_to_one(&sid, data).await,
            None => {
                self.send_frame(ServerFrame::error(
                    "No active session to receive plain text.",
                ))
                .await;
            }
        }
    }
}

/// Fan one upstream session into the shared client writer. Binary data is
/// preceded by a `stream-bytes` envelope naming the session.
async fn pump_upstream(
    sid: String,
    mut stream: UpstreamStream,
    out_tx: mpsc::Sender<Outbound>,
    evt_tx: mpsc::Sender<SessionEvent>,
) {
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(TungsteniteMessage::Text(payload)) => {
                let frame = ServerFrame::Stream {
                    sid: sid.clone(),
                    payload,
                };
                if out_tx.send(Outbound::Frame(frame)).await.is_err() {
                    break;
                }
            }
            Ok(TungsteniteMessage::Binary(data)) => {
                let envelope = ServerFrame::StreamBytes {
                    sid: sid.clone(),
                    note: "binary follows".into(),
                };
                if out_tx.send(Outbound::Frame(envelope)).await.is_err() {
                    break;
                }
                if out_tx.send(Outbound::Bytes(data)).await.is_err() {
                    break;
                }
            }
            Ok(TungsteniteMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(sid, error = %e, "Upstream console ended");
                let _ = out_tx
                    .send(Outbound::Frame(ServerFrame::Info {
                        message: Some(format!("Proxy: upstream connection ended ({e})")),
                        sid: Some(sid.clone()),
                        sessions: None,
                        active: None,
                    }))
                    .await;
                break;
            }
        }
    }
    let _ = evt_tx.send(SessionEvent::Ended(sid)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newline_discipline_appends_only_when_missing() {
        assert_eq!(with_newline("ls"), "ls\n");
        assert_eq!(with_newline("ls\n"), "ls\n");
        // Control characters pass through unchanged (with the newline).
        assert_eq!(with_newline("\x03"), "\x03\n");
    }

    #[test]
    fn server_frames_serialize_with_expected_tags() {
        let connected = ServerFrame::Info {
            message: Some("Connected".into()),
            sid: None,
            sessions: Some(vec!["s1".into()]),
            active: Some("s1".into()),
        };
        let json = serde_json::to_value(&connected).unwrap();
        assert_eq!(json["type"], "info");
        assert_eq!(json["sessions"][0], "s1");
        assert_eq!(json["active"], "s1");
        assert!(json.get("sid").is_none());

        let bytes = ServerFrame::StreamBytes {
            sid: "s2".into(),
            note: "binary follows".into(),
        };
        let json = serde_json::to_value(&bytes).unwrap();
        assert_eq!(json["type"], "stream-bytes");
        assert_eq!(json["sid"], "s2");

        let stream = ServerFrame::Stream {
            sid: "s1".into(),
            payload: "hello".into(),
        };
        assert_eq!(serde_json::to_value(&stream).unwrap()["type"], "stream");

        let err = ServerFrame::error("boom");
        assert_eq!(serde_json::to_value(&err).unwrap()["type"], "error");
    }

    #[test]
    fn control_kind_rejects_unknown_tags() {
        assert!(serde_json::from_str::<ControlKind>("\"open\"").is_ok());
        assert!(serde_json::from_str::<ControlKind>("\"focus\"").is_ok());
        assert!(serde_json::from_str::<ControlKind>("\"detach\"").is_err());
    }
}
