//! Source-platform connection backed by a bridge child process.
//!
//! The bridge speaks newline-delimited JSON over stdin/stdout. Requests carry
//! a uuid that the matching response echoes; lines with an `event` field are
//! platform events and go to the session's event channel.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    ChatSummary, Contact, InboundMessage, Media, Outgoing, SendOptions, SentMessage,
    SourceConnection, SourceConnector, SourceEvent,
};
use crate::config::BridgeConfig;

type PendingRequests = Arc<Mutex<HashMap<String, oneshot::Sender<Result<Value, String>>>>>;

#[derive(Serialize)]
struct BridgeRequest<'a> {
    id: &'a str,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BridgeLine {
    Response {
        id: String,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<String>,
    },
    Event {
        event: String,
        #[serde(default)]
        data: Value,
    },
}

#[derive(Deserialize)]
struct Initialized {
    #[serde(default)]
    pid: Option<u32>,
}

#[derive(Deserialize)]
struct Revoked {
    #[serde(default)]
    before: Option<InboundMessage>,
}

/// Turn a bridge event into a `SourceEvent`. Unknown events yield `None`.
fn parse_event(event: &str, data: Value) -> Result<Option<SourceEvent>> {
    let parsed = match event {
        "qr" => SourceEvent::Qr(serde_json::from_value(data).context("Invalid qr event")?),
        "ready" => SourceEvent::Ready,
        "disconnected" => {
            SourceEvent::Disconnected(data.as_str().unwrap_or("unknown").to_string())
        }
        "message_create" => SourceEvent::MessageCreate(
            serde_json::from_value(data).context("Invalid message_create event")?,
        ),
        "message_revoke_everyone" => {
            let revoked: Revoked =
                serde_json::from_value(data).context("Invalid message_revoke_everyone event")?;
            SourceEvent::MessageRevoked {
                before: revoked.before,
            }
        }
        _ => return Ok(None),
    };
    Ok(Some(parsed))
}

pub struct BridgeConnector {
    config: BridgeConfig,
}

impl BridgeConnector {
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SourceConnector for BridgeConnector {
    async fn connect(
        &self,
        user_id: &str,
    ) -> Result<(Arc<dyn SourceConnection>, mpsc::UnboundedReceiver<SourceEvent>)> {
        let session_dir = self.config.session_dir.join(user_id);
        tokio::fs::create_dir_all(&session_dir)
            .await
            .with_context(|| format!("Failed to create session dir {}", session_dir.display()))?;

        info!(
            "Starting bridge for {}: {} {:?}",
            user_id, self.config.command, self.config.args
        );
        let mut child = Command::new(&self.config.command)
            .args(&self.config.args)
            .envs(&self.config.env)
            .env("RELAY_SESSION_ID", user_id)
            .env("RELAY_SESSION_DIR", &session_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start bridge process: {}", self.config.command))?;

        let stdin = child.stdin.take().context("Bridge stdin not captured")?;
        let stdout = child.stdout.take().context("Bridge stdout not captured")?;
        let pid = child.id().unwrap_or(0);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let pending: PendingRequests = Arc::new(Mutex::new(HashMap::new()));
        let closing = Arc::new(AtomicBool::new(false));

        tokio::spawn(read_bridge(
            user_id.to_string(),
            stdout,
            pending.clone(),
            events_tx,
            closing.clone(),
        ));

        let connection = BridgeConnection {
            user_id: user_id.to_string(),
            stdin: Mutex::new(stdin),
            child: Mutex::new(child),
            pending,
            closing,
            pid: AtomicU32::new(pid),
            timeout: Duration::from_secs(self.config.request_timeout_secs),
        };
        Ok((Arc::new(connection), events_rx))
    }
}

/// Read bridge output until it closes. Responses complete pending requests,
/// events are forwarded. An unexpected close is reported as a disconnect.
async fn read_bridge(
    user_id: String,
    stdout: ChildStdout,
    pending: PendingRequests,
    events: mpsc::UnboundedSender<SourceEvent>,
    closing: Arc<AtomicBool>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!("Error reading bridge output for {}: {}", user_id, e);
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match serde_json::from_str::<BridgeLine>(line) {
            Ok(BridgeLine::Response { id, result, error }) => {
                let Some(reply) = pending.lock().await.remove(&id) else {
                    debug!("Bridge answered unknown request {} for {}", id, user_id);
                    continue;
                };
                let outcome = match error {
                    Some(error) => Err(error),
                    None => Ok(result.unwrap_or(Value::Null)),
                };
                let _ = reply.send(outcome);
            }
            Ok(BridgeLine::Event { event, data }) => match parse_event(&event, data) {
                Ok(Some(event)) => {
                    if events.send(event).is_err() {
                        debug!("Event receiver for {} is gone", user_id);
                    }
                }
                Ok(None) => debug!("Ignoring bridge event {} for {}", event, user_id),
                Err(e) => warn!("Bad bridge event for {}: {:#}", user_id, e),
            },
            Err(e) => warn!("Unparseable bridge line for {}: {}", user_id, e),
        }
    }

    for (_, reply) in pending.lock().await.drain() {
        let _ = reply.send(Err("bridge closed".to_string()));
    }
    if !closing.load(Ordering::SeqCst) {
        warn!("Bridge for {} exited unexpectedly", user_id);
        let _ = events.send(SourceEvent::Disconnected("bridge exited".to_string()));
    }
}

pub struct BridgeConnection {
    user_id: String,
    stdin: Mutex<ChildStdin>,
    child: Mutex<Child>,
    pending: PendingRequests,
    closing: Arc<AtomicBool>,
    /// Browser pid once initialized, the bridge's own pid before that
    pid: AtomicU32,
    timeout: Duration,
}

impl BridgeConnection {
    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        let mut line = serde_json::to_string(&BridgeRequest {
            id: &id,
            method,
            params,
        })?;
        line.push('\n');

        let written = {
            let mut stdin = self.stdin.lock().await;
            match stdin.write_all(line.as_bytes()).await {
                Ok(()) => stdin.flush().await,
                Err(e) => Err(e),
            }
        };
        if let Err(e) = written {
            self.pending.lock().await.remove(&id);
            return Err(e).with_context(|| format!("Failed to send {} to bridge", method));
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(message))) => bail!("Bridge {} failed: {}", method, message),
            Ok(Err(_)) => bail!("Bridge closed before answering {}", method),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                bail!("Bridge {} timed out after {:?}", method, self.timeout)
            }
        }
    }

    async fn call<T: serde::de::DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let value = self.request(method, params).await?;
        serde_json::from_value(value)
            .with_context(|| format!("Unexpected bridge response to {}", method))
    }
}

#[async_trait]
impl SourceConnection for BridgeConnection {
    async fn initialize(&self) -> Result<()> {
        let initialized: Initialized = self.call("initialize", json!({})).await?;
        if let Some(pid) = initialized.pid {
            self.pid.store(pid, Ordering::SeqCst);
            debug!("Bridge for {} reports browser pid {}", self.user_id, pid);
        }
        Ok(())
    }

    async fn send_message(
        &self,
        chat: &str,
        content: Outgoing,
        options: SendOptions,
    ) -> Result<SentMessage> {
        self.call(
            "send_message",
            json!({ "chat": chat, "content": content, "options": options }),
        )
        .await
    }

    async fn delete_message(&self, message: &SentMessage, everyone: bool) -> Result<()> {
        self.request(
            "delete_message",
            json!({ "id": message.id, "chat": message.chat, "everyone": everyone }),
        )
        .await?;
        Ok(())
    }

    async fn download_media(&self, message: &InboundMessage) -> Result<Media> {
        self.call("download_media", json!({ "id": message.id })).await
    }

    async fn get_chats(&self) -> Result<Vec<ChatSummary>> {
        self.call("get_chats", json!({})).await
    }

    async fn get_contact_by_id(&self, id: &str) -> Result<Contact> {
        self.call("get_contact", json!({ "id": id })).await
    }

    fn process_id(&self) -> Option<u32> {
        match self.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    async fn destroy(&self) -> Result<()> {
        self.closing.store(true, Ordering::SeqCst);
        if let Err(e) = self.request("destroy", json!({})).await {
            debug!("Bridge for {} already closed: {:#}", self.user_id, e);
        }

        let mut child = self.child.lock().await;
        if let Err(e) = child.start_kill() {
            debug!("Bridge process for {} already gone: {}", self.user_id, e);
        }
        match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
            Ok(Ok(status)) => debug!("Bridge for {} exited with {}", self.user_id, status),
            Ok(Err(e)) => warn!("Error waiting for bridge of {}: {}", self.user_id, e),
            Err(_) => warn!("Bridge for {} did not exit in time", self.user_id),
        }
        Ok(())
    }
}
