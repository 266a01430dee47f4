//! Minimal Chrome DevTools Protocol connection.
//!
//! One WebSocket per page target. Commands are correlated with their replies
//! by id; protocol events are ignored.

use anyhow::{Context, Result, anyhow, bail};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type PendingReplies = Arc<StdMutex<HashMap<u64, oneshot::Sender<Result<Value>>>>>;

pub struct CdpConnection {
    writer: Mutex<WsWriter>,
    pending: PendingReplies,
    next_id: AtomicU64,
    command_timeout: Duration,
    reader: JoinHandle<()>,
}

impl CdpConnection {
    /// Connect to a target's `webSocketDebuggerUrl`.
    pub async fn connect(ws_url: &str) -> Result<Self> {
        let (stream, _) = tokio_tungstenite::connect_async(ws_url)
            .await
            .with_context(|| format!("Failed to connect to DevTools at {}", ws_url))?;
        let (writer, mut reader) = stream.split();

        let pending: PendingReplies = Arc::default();
        let reader_pending = pending.clone();

        let reader = tokio::spawn(async move {
            while let Some(message) = reader.next().await {
                let message = match message {
                    Ok(message) => message,
                    Err(e) => {
                        warn!("DevTools socket error: {}", e);
                        break;
                    }
                };

                let Message::Text(text) = message else {
                    continue;
                };

                let Some((id, outcome)) = parse_reply(text.as_str()) else {
                    continue;
                };

                let sender = reader_pending
                    .lock()
                    .ok()
                    .and_then(|mut pending| pending.remove(&id));
                if let Some(sender) = sender {
                    let _ = sender.send(outcome);
                }
            }

            // Dropping the senders wakes every caller still waiting.
            if let Ok(mut pending) = reader_pending.lock() {
                pending.clear();
            }
            debug!("DevTools connection closed");
        });

        Ok(Self {
            writer: Mutex::new(writer),
            pending,
            next_id: AtomicU64::new(1),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            reader,
        })
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Send `method` and wait for its result object.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .map_err(|_| anyhow!("DevTools reply table poisoned"))?
            .insert(id, tx);

        let frame = json!({ "id": id, "method": method, "params": params });
        let sent = {
            let mut writer = self.writer.lock().await;
            writer.send(Message::Text(frame.to_string().into())).await
        };
        if let Err(e) = sent {
            self.forget(id);
            bail!("Failed to send {}: {}", method, e);
        }

        match tokio::time::timeout(self.command_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => bail!("DevTools connection closed while waiting for {}", method),
            Err(_) => {
                self.forget(id);
                bail!(
                    "{} timed out after {}ms",
                    method,
                    self.command_timeout.as_millis()
                )
            }
        }
    }

    fn forget(&self, id: u64) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&id);
        }
    }
}

impl Drop for CdpConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Split a raw protocol frame into `(id, outcome)`; events yield `None`.
fn parse_reply(raw: &str) -> Option<(u64, Result<Value>)> {
    let payload: Value = match serde_json::from_str(raw) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("Unparseable DevTools frame: {}", e);
            return None;
        }
    };

    let id = payload.get("id").and_then(Value::as_u64)?;
    let outcome = match payload.get("error") {
        Some(error) => Err(anyhow!(
            "DevTools error {}: {}",
            error.get("code").and_then(Value::as_i64).unwrap_or_default(),
            error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
        )),
        None => Ok(payload.get("result").cloned().unwrap_or(Value::Null)),
    };

    Some((id, outcome))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_with_result_is_routed() {
        let (id, outcome) = parse_reply(r#"{"id":7,"result":{"value":1}}"#).unwrap();
        assert_eq!(id, 7);
        assert_eq!(outcome.unwrap(), json!({"value": 1}));
    }

    #[test]
    fn reply_with_error_becomes_err() {
        let (id, outcome) =
            parse_reply(r#"{"id":3,"error":{"code":-32000,"message":"No node"}}"#).unwrap();
        assert_eq!(id, 3);
        let message = outcome.unwrap_err().to_string();
        assert!(message.contains("-32000"));
        assert!(message.contains("No node"));
    }

    #[test]
    fn events_are_ignored() {
        assert!(parse_reply(r#"{"method":"Page.loadEventFired","params":{}}"#).is_none());
        assert!(parse_reply("not json").is_none());
    }
}
