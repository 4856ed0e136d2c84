use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result, anyhow, bail};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, trace, warn};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Per-target WebSocket CDP connection.
///
/// A background reader task routes responses to their callers by id and
/// events to per-method subscribers. This lets long-lived event consumers
/// (screencast frames, file chooser dialogs, frame navigations) run
/// concurrently with in-flight commands on the same socket. Handles are
/// cheap clones sharing one socket.
#[derive(Clone)]
pub struct CdpConnection {
    inner: Arc<Inner>,
}

struct Inner {
    out_tx: mpsc::UnboundedSender<Message>,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Value, String>>>>,
    subscribers: Mutex<HashMap<String, mpsc::UnboundedSender<Value>>>,
}

impl CdpConnection {
    /// Connect to a CDP WebSocket URL (browser or per-target) and spawn the
    /// reader/writer tasks.
    pub async fn connect(url: &str) -> Result<Self> {
        debug!(url, "connecting CDP WebSocket");
        let (ws, _) = connect_async(url)
            .await
            .with_context(|| format!("Failed to connect to {url}"))?;
        debug!(url, "CDP WebSocket connected");

        let (sink, source) = ws.split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            out_tx,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
        });

        tokio::spawn(write_loop(sink, out_rx));
        tokio::spawn(read_loop(source, Arc::downgrade(&inner)));

        Ok(Self { inner })
    }

    /// Send a CDP command and wait for the matching response (by id).
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().unwrap().insert(id, tx);

        let msg = json!({
            "id": id,
            "method": method,
            "params": params,
        });
        trace!(id, method, "cdp call");

        if self
            .inner
            .out_tx
            .send(Message::Text(msg.to_string().into()))
            .is_err()
        {
            self.inner.pending.lock().unwrap().remove(&id);
            bail!("Connection closed while sending {method}");
        }

        match rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(anyhow!("CDP error for {method}: {e}")),
            Err(_) => bail!("Connection closed while waiting for {method} response"),
        }
    }

    /// Register a subscriber for an event method. One subscriber per method;
    /// a later subscription replaces the earlier one. Events with no
    /// subscriber are dropped.
    pub fn subscribe(&self, method: &str) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .subscribers
            .lock()
            .unwrap()
            .insert(method.to_string(), tx);
        rx
    }

    /// Remove the subscriber for an event method, if any.
    pub fn unsubscribe(&self, method: &str) {
        self.inner.subscribers.lock().unwrap().remove(method);
    }

    /// Evaluate a synchronous JS expression and return its value.
    pub async fn eval(&self, expression: &str) -> Result<Value> {
        let result = self
            .call(
                "Runtime.evaluate",
                json!({"expression": expression, "returnByValue": true}),
            )
            .await
            .context("JS evaluation failed")?;
        check_js_exception(&result)?;
        Ok(result)
    }
}

/// Bail if a `Runtime.evaluate` result contains an exception.
fn check_js_exception(result: &Value) -> Result<()> {
    if let Some(desc) = result
        .get("exceptionDetails")
        .and_then(|e| e.get("exception"))
        .and_then(|e| e.get("description"))
        .and_then(|d| d.as_str())
    {
        bail!("JS error: {desc}");
    }
    Ok(())
}

async fn write_loop(mut sink: WsSink, mut out_rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(msg) = out_rx.recv().await {
        if let Err(e) = sink.send(msg).await {
            warn!(error = %e, "CDP write failed, closing writer");
            break;
        }
    }
    let _ = sink.close().await;
    debug!("CDP writer task exited");
}

async fn read_loop(mut source: WsSource, inner: std::sync::Weak<Inner>) {
    while let Some(raw) = source.next().await {
        let Some(inner) = inner.upgrade() else {
            break; // all handles dropped
        };

        let msg = match raw {
            Ok(Message::Text(text)) => text,
            Ok(_) => continue, // binary/ping/pong frames
            Err(e) => {
                warn!(error = %e, "CDP read error, closing reader");
                break;
            }
        };

        let parsed: Value = match serde_json::from_str(&msg) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "unparseable CDP message, skipping");
                continue;
            }
        };

        // Response: route to the waiting caller by id.
        if let Some(id) = parsed.get("id").and_then(|v| v.as_u64()) {
            let Some(tx) = inner.pending.lock().unwrap().remove(&id) else {
                trace!(id, "response for unknown id, dropping");
                continue;
            };
            let outcome = match parsed.get("error") {
                Some(error) => Err(serde_json::to_string(error).unwrap_or_default()),
                None => Ok(parsed.get("result").cloned().unwrap_or(Value::Null)),
            };
            let _ = tx.send(outcome);
            continue;
        }

        // Event: route to the method's subscriber, if any.
        if let Some(method) = parsed.get("method").and_then(|v| v.as_str()) {
            let params = parsed.get("params").cloned().unwrap_or(Value::Null);
            let mut subs = inner.subscribers.lock().unwrap();
            if let Some(tx) = subs.get(method) {
                if tx.send(params).is_err() {
                    // Receiver dropped without unsubscribing.
                    subs.remove(method);
                }
            } else {
                trace!(method, "unsubscribed event dropped");
            }
        }
    }

    // Fail anything still waiting so callers see a clean error instead of
    // hanging forever.
    if let Some(inner) = inner.upgrade() {
        let mut pending = inner.pending.lock().unwrap();
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err("connection closed".to_string()));
        }
        inner.subscribers.lock().unwrap().clear();
    }
    debug!("CDP reader task exited");
}
