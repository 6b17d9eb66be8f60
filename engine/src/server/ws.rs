//! Live log websocket

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::Response,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::EngineError;
use crate::relay::buffer::matches_keyword;
use crate::relay::{Delivery, LineBuffer, LogSource, RelayHandle};
use crate::server::state::ServerState;

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub container: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
}

impl LogsQuery {
    pub fn into_source(self) -> Result<LogSource, EngineError> {
        let missing = |param: &str| EngineError::ValidationError(format!("'{}' is required", param));
        let source = match self.source.as_deref().unwrap_or("file") {
            "file" => LogSource::File {
                path: self.path.ok_or_else(|| missing("path"))?,
            },
            "container" => LogSource::Container {
                container: self.container.ok_or_else(|| missing("container"))?,
            },
            "command" => LogSource::Command {
                command: self.command.ok_or_else(|| missing("command"))?,
            },
            other => {
                return Err(EngineError::ValidationError(format!("unknown log source '{}'", other)));
            }
        };
        source.validate()?;
        Ok(source)
    }
}

/// Frames pushed to the client
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerFrame<'a> {
    Lines { lines: &'a [String] },
    Dropped { count: u64 },
    History { keyword: Option<&'a str>, lines: &'a [String] },
    Closed { message: &'a str },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Close,
    Filter {
        #[serde(default)]
        keyword: Option<String>,
    },
}

fn parse_client_frame(text: &str) -> Option<ClientFrame> {
    if text.trim() == "close" {
        return Some(ClientFrame::Close);
    }
    serde_json::from_str(text).ok()
}

/// Attach before upgrading so a refused stream is a plain HTTP error
pub async fn logs_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
    Path(resource_id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Response, EngineError> {
    let source = query.into_source()?;
    let target = state.store.get_resource(&resource_id).await?.target();
    let handle = state.relay.open(&resource_id, &target, source).await?;
    let history_lines = state.relay.options().buffer_lines;

    Ok(ws.on_upgrade(move |socket| pump(socket, handle, history_lines, resource_id)))
}

async fn send(socket: &mut WebSocket, frame: &ServerFrame<'_>) -> Result<(), EngineError> {
    let text = serde_json::to_string(frame)?;
    socket
        .send(Message::Text(text.into()))
        .await
        .map_err(|e| EngineError::ServerError(e.to_string()))
}

async fn pump(mut socket: WebSocket, mut handle: RelayHandle, history_lines: usize, resource_id: String) {
    let mut history = LineBuffer::new(history_lines);
    let mut keyword: Option<String> = None;

    loop {
        tokio::select! {
            delivery = handle.next() => match delivery {
                Some(Delivery::Lines { lines, dropped }) => {
                    if dropped > 0 && send(&mut socket, &ServerFrame::Dropped { count: dropped }).await.is_err() {
                        break;
                    }
                    let visible: Vec<String> = lines
                        .iter()
                        .filter(|line| matches_keyword(line, keyword.as_deref()))
                        .cloned()
                        .collect();
                    history.extend(lines);
                    if !visible.is_empty() && send(&mut socket, &ServerFrame::Lines { lines: &visible }).await.is_err() {
                        break;
                    }
                }
                Some(Delivery::Closed(message)) => {
                    let _ = send(&mut socket, &ServerFrame::Closed { message: &message }).await;
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
                None => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => match parse_client_frame(text.as_str()) {
                    Some(ClientFrame::Close) => {
                        debug!(resource = %resource_id, "Client asked to close the stream");
                        break;
                    }
                    Some(ClientFrame::Filter { keyword: next }) => {
                        keyword = next.filter(|k| !k.is_empty());
                        let lines = history.render(keyword.as_deref());
                        let frame = ServerFrame::History { keyword: keyword.as_deref(), lines: &lines };
                        if send(&mut socket, &frame).await.is_err() {
                            break;
                        }
                    }
                    None => debug!(resource = %resource_id, "Ignoring client frame"),
                },
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    handle.close().await;
    info!(resource = %resource_id, "Live log connection closed");
}
