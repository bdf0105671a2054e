//! In-process stand-ins for the two messaging platforms.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::{DelayRange, PacingConfig, SessionConfig};
use crate::platform::{
    BotAssignment, BotLauncher, ChatSummary, Contact, InboundMessage, Media, MessageId, Outgoing,
    SecondaryBot, SecondaryPayload, SendOptions, SentMessage, SourceConnection, SourceConnector,
    SourceEvent,
};

pub fn instant_pacing() -> PacingConfig {
    PacingConfig {
        text_send: DelayRange::zero(),
        media_send: DelayRange::zero(),
        between_sends: DelayRange::zero(),
        between_deletions: DelayRange::zero(),
        delete_item: DelayRange::zero(),
        secondary_retry_ms: 0,
    }
}

pub fn instant_sessions() -> SessionConfig {
    SessionConfig {
        qr_poll_interval_ms: 5,
        qr_poll_attempts: 40,
        reset_cooldown_ms: 0,
        init_attempts: 2,
        init_backoff_ms: 0,
    }
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn text_message(id: &str, body: &str) -> InboundMessage {
    InboundMessage {
        id: MessageId(id.into()),
        timestamp: 1_700_000_000,
        from_me: true,
        to: "main@g.us".into(),
        body: body.into(),
        ..Default::default()
    }
}

#[derive(Default)]
pub struct FakeConnection {
    pub sent: Mutex<Vec<(String, Outgoing, SendOptions)>>,
    pub deleted: Mutex<Vec<SentMessage>>,
    /// Chats whose sends fail
    pub failing_chats: Mutex<HashSet<String>>,
    pub media: Mutex<Option<Media>>,
    pub chats: Mutex<Vec<ChatSummary>>,
    pub fail_chats: AtomicBool,
    pub contact_lookups: Mutex<Vec<String>>,
    /// Order of sends and deletions as `send:<chat>` / `delete:<id>`
    pub log: Mutex<Vec<String>>,
    pub op_delay: Mutex<Duration>,
    pub init_failures: AtomicU32,
    pub init_calls: AtomicU32,
    pub init_delay: Mutex<Duration>,
    pub destroyed: AtomicBool,
    pub pid: Mutex<Option<u32>>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    next_id: AtomicU32,
}

impl FakeConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<(String, Outgoing, SendOptions)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    async fn enter(&self, entry: String) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.log.lock().unwrap().push(entry);
        let delay = *self.op_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl SourceConnection for FakeConnection {
    async fn initialize(&self) -> Result<()> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.init_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let remaining = self.init_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.init_failures.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("browser failed to launch");
        }
        Ok(())
    }

    async fn send_message(
        &self,
        chat: &str,
        content: Outgoing,
        options: SendOptions,
    ) -> Result<SentMessage> {
        self.enter(format!("send:{}", chat)).await;
        let failing = self.failing_chats.lock().unwrap().contains(chat);
        self.leave();
        if failing {
            anyhow::bail!("send to {} rejected", chat);
        }
        self.sent
            .lock()
            .unwrap()
            .push((chat.to_string(), content, options));
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(SentMessage {
            id: MessageId(format!("out-{}", n)),
            chat: chat.to_string(),
        })
    }

    async fn delete_message(&self, message: &SentMessage, everyone: bool) -> Result<()> {
        assert!(everyone);
        self.enter(format!("delete:{}", message.id)).await;
        self.leave();
        self.deleted.lock().unwrap().push(message.clone());
        Ok(())
    }

    async fn download_media(&self, _message: &InboundMessage) -> Result<Media> {
        match self.media.lock().unwrap().clone() {
            Some(media) => Ok(media),
            None => anyhow::bail!("no media attached"),
        }
    }

    async fn get_chats(&self) -> Result<Vec<ChatSummary>> {
        if self.fail_chats.load(Ordering::SeqCst) {
            anyhow::bail!("Evaluation failed: Target closed");
        }
        Ok(self.chats.lock().unwrap().clone())
    }

    async fn get_contact_by_id(&self, id: &str) -> Result<Contact> {
        self.contact_lookups.lock().unwrap().push(id.to_string());
        Ok(Contact {
            id: id.to_string(),
            name: Some("Looked Up".into()),
        })
    }

    fn process_id(&self) -> Option<u32> {
        *self.pid.lock().unwrap()
    }

    async fn destroy(&self) -> Result<()> {
        self.destroyed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeBot {
    pub sent: Mutex<Vec<(i64, SecondaryPayload)>>,
    pub deleted: Mutex<Vec<(i64, i32)>>,
    /// Number of upcoming sends that fail
    pub failures: AtomicU32,
    pub attempts: AtomicU32,
    pub shut_down: AtomicBool,
    next_id: AtomicI32,
}

impl FakeBot {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<(i64, SecondaryPayload)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl SecondaryBot for FakeBot {
    async fn send(&self, chat_id: i64, payload: &SecondaryPayload) -> Result<i32> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("Too Many Requests");
        }
        self.sent.lock().unwrap().push((chat_id, payload.clone()));
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst) + 100)
    }

    async fn delete_message(&self, chat_id: i64, message_id: i32) -> Result<()> {
        self.deleted.lock().unwrap().push((chat_id, message_id));
        Ok(())
    }

    async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }
}

/// Hands out a fresh `FakeConnection` per connect and keeps the event sender
#[derive(Default)]
pub struct FakeConnector {
    pub connections: Mutex<Vec<(Arc<FakeConnection>, mpsc::UnboundedSender<SourceEvent>)>>,
    /// Initialize failures each new connection starts with
    pub init_failures: AtomicU32,
    /// How long each new connection takes to initialize
    pub init_delay: Mutex<Duration>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn latest(&self) -> (Arc<FakeConnection>, mpsc::UnboundedSender<SourceEvent>) {
        self.connections
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no connection created yet")
    }
}

#[async_trait]
impl SourceConnector for FakeConnector {
    async fn connect(
        &self,
        _user_id: &str,
    ) -> Result<(Arc<dyn SourceConnection>, mpsc::UnboundedReceiver<SourceEvent>)> {
        let connection = FakeConnection::new();
        connection
            .init_failures
            .store(self.init_failures.load(Ordering::SeqCst), Ordering::SeqCst);
        *connection.init_delay.lock().unwrap() = *self.init_delay.lock().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections
            .lock()
            .unwrap()
            .push((connection.clone(), tx));
        Ok((connection, rx))
    }
}

pub struct FakeLauncher {
    pub bot: Arc<FakeBot>,
    pub launches: Mutex<Vec<String>>,
}

impl FakeLauncher {
    pub fn new(bot: Arc<FakeBot>) -> Arc<Self> {
        Arc::new(Self {
            bot,
            launches: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl BotLauncher for FakeLauncher {
    async fn launch(
        &self,
        user_id: &str,
        assignment: &BotAssignment,
    ) -> Result<Arc<dyn SecondaryBot>> {
        self.launches
            .lock()
            .unwrap()
            .push(format!("{}:{}", user_id, assignment.bot_name));
        Ok(self.bot.clone())
    }
}
