//! Per-user session lifecycle.
//!
//! `UserRegistry` owns everything the service keeps for a user: the
//! source-platform connection, the listening flags, the relay engine and the
//! secondary bot. Every connection gets a new generation number so events
//! from a connection that has since been replaced are ignored.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{BotConfig, PacingConfig, SessionConfig};
use crate::platform::{
    BotAssignment, BotLauncher, ChatSummary, InboundMessage, SecondaryBot, SourceConnection,
    SourceConnector, SourceEvent,
};
use crate::relay::{RelayHandle, RelayStatus};
use crate::store::{ChatSelection, Store};

/// Most chats returned by a chat listing
const CHAT_LIST_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Connecting, no QR code yet
    Pending,
    /// A QR code is waiting to be scanned
    Available,
    Connected,
    Disconnected,
}

/// Answer to a QR request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QrStatus {
    pub status: ConnectionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub user_id: String,
    pub status: ConnectionStatus,
}

/// The user has no live source-platform session
#[derive(Debug)]
pub struct NotConnected;

impl std::fmt::Display for NotConnected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("User is not connected to the source platform")
    }
}

impl std::error::Error for NotConnected {}

struct Session {
    connection: Arc<dyn SourceConnection>,
    status: ConnectionStatus,
    qr: Option<String>,
    events: JoinHandle<()>,
}

struct UserState {
    generation: u64,
    session: Option<Session>,
    forwarding: bool,
    deletions: bool,
    relay: Option<RelayHandle>,
    bot: watch::Sender<Option<Arc<dyn SecondaryBot>>>,
    restarting: bool,
    /// Reset requested while a restart was running; `true` when hard
    reset_pending: Option<bool>,
}

impl UserState {
    fn new() -> Self {
        let (bot, _) = watch::channel(None);
        Self {
            generation: 0,
            session: None,
            forwarding: false,
            deletions: false,
            relay: None,
            bot,
            restarting: false,
            reset_pending: None,
        }
    }
}

/// Everything a teardown has to release, taken out of the registry first
struct Teardown {
    session: Option<Session>,
    relay: Option<RelayHandle>,
    bot: Option<Arc<dyn SecondaryBot>>,
}

impl Teardown {
    async fn run(self, user_id: &str, kill: bool) {
        if let Some(relay) = self.relay {
            relay.abort();
            debug!("Relay engine for {} aborted", user_id);
        }

        if let Some(session) = self.session {
            session.events.abort();
            if kill {
                if let Some(pid) = session.connection.process_id() {
                    kill_process(user_id, pid);
                }
            }
            match session.connection.destroy().await {
                Ok(()) => info!("Destroyed session for {}", user_id),
                Err(e) => warn!("Error destroying session for {}: {:#}", user_id, e),
            }
        }

        if let Some(bot) = self.bot {
            bot.shutdown().await;
        }
    }
}

/// Best-effort kill of the process behind a session
fn kill_process(user_id: &str, pid: u32) {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    match system.process(pid) {
        Some(process) => {
            if process.kill() {
                info!("Killed process {} for {}", pid, user_id);
            } else {
                warn!("Failed to kill process {} for {}", pid, user_id);
            }
        }
        None => debug!("Process {} for {} is already gone", pid, user_id),
    }
}

struct ResetRequest {
    user_id: String,
    hard: bool,
}

pub struct UserRegistry {
    users: Mutex<HashMap<String, UserState>>,
    connector: Arc<dyn SourceConnector>,
    launcher: Arc<dyn BotLauncher>,
    store: Store,
    pacing: PacingConfig,
    config: SessionConfig,
    bots: Vec<BotConfig>,
    resets: mpsc::UnboundedSender<ResetRequest>,
}

impl UserRegistry {
    /// Build the registry and start its reset supervisor. Must be called
    /// inside a Tokio runtime.
    pub fn new(
        connector: Arc<dyn SourceConnector>,
        launcher: Arc<dyn BotLauncher>,
        store: Store,
        pacing: PacingConfig,
        config: SessionConfig,
        bots: Vec<BotConfig>,
    ) -> Arc<Self> {
        let (resets, requests) = mpsc::unbounded_channel();
        let registry = Arc::new(Self {
            users: Mutex::new(HashMap::new()),
            connector,
            launcher,
            store,
            pacing,
            config,
            bots,
            resets,
        });
        tokio::spawn(supervise_resets(Arc::downgrade(&registry), requests));
        registry
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Start a session if the user has none, then wait a bounded time for
    /// it to produce a QR code or connect.
    pub async fn request_qr(self: &Arc<Self>, user_id: &str) -> Result<QrStatus> {
        let has_session = {
            let users = self.users.lock().await;
            match users.get(user_id).and_then(|state| state.session.as_ref()) {
                Some(session) if session.status == ConnectionStatus::Connected => {
                    return Ok(QrStatus {
                        status: ConnectionStatus::Connected,
                        qr: None,
                    });
                }
                Some(_) => true,
                None => false,
            }
        };

        if !has_session {
            info!("Starting new session for {} through QR", user_id);
            let (generation, connection) = self.open_session(user_id).await?;
            let registry = Arc::clone(self);
            let user = user_id.to_string();
            tokio::spawn(async move {
                registry.initialize(&user, generation, connection).await;
            });
        }

        let interval = Duration::from_millis(self.config.qr_poll_interval_ms);
        for attempt in 0..self.config.qr_poll_attempts {
            match self.qr_status(user_id).await {
                Some(status) if status.status != ConnectionStatus::Pending => return Ok(status),
                Some(_) => debug!("Waiting for QR status for {} (attempt {})", user_id, attempt + 1),
                None => break,
            }
            tokio::time::sleep(interval).await;
        }

        Ok(self.qr_status(user_id).await.unwrap_or(QrStatus {
            status: ConnectionStatus::Pending,
            qr: None,
        }))
    }

    async fn qr_status(&self, user_id: &str) -> Option<QrStatus> {
        let users = self.users.lock().await;
        let session = users.get(user_id)?.session.as_ref()?;
        Some(QrStatus {
            status: session.status,
            qr: session.qr.clone(),
        })
    }

    /// Connect a fresh source-platform session and start pumping its events.
    /// The connection still has to be initialized. A relay left over from an
    /// earlier connection is discarded along with the listening flags.
    async fn open_session(
        self: &Arc<Self>,
        user_id: &str,
    ) -> Result<(u64, Arc<dyn SourceConnection>)> {
        let (connection, events) = self
            .connector
            .connect(user_id)
            .await
            .with_context(|| format!("Failed to start session for {}", user_id))?;

        let (generation, stale) = {
            let mut users = self.users.lock().await;
            let state = users
                .entry(user_id.to_string())
                .or_insert_with(UserState::new);
            state.generation += 1;
            let generation = state.generation;

            let pump = tokio::spawn(Arc::clone(self).pump_events(
                user_id.to_string(),
                generation,
                events,
            ));
            let old = state.session.replace(Session {
                connection: Arc::clone(&connection),
                status: ConnectionStatus::Pending,
                qr: None,
                events: pump,
            });
            if old.is_some() {
                warn!("Replacing a live session for {}", user_id);
            }
            state.forwarding = false;
            state.deletions = false;
            let stale = Teardown {
                session: old,
                relay: state.relay.take(),
                bot: None,
            };
            (generation, stale)
        };
        stale.run(user_id, false).await;

        Ok((generation, connection))
    }

    /// Initialize with bounded retries. A connection that never comes up is
    /// removed so later requests see the user as not connected.
    async fn initialize(
        &self,
        user_id: &str,
        generation: u64,
        connection: Arc<dyn SourceConnection>,
    ) -> bool {
        let attempts = self.config.init_attempts;
        for attempt in 1..=attempts {
            info!("Initializing session for {} (attempt {})", user_id, attempt);
            match connection.initialize().await {
                Ok(()) => {
                    match connection.process_id() {
                        Some(pid) => info!("Session for {} running as process {}", user_id, pid),
                        None => debug!("Session for {} has no known process id", user_id),
                    }
                    return true;
                }
                Err(e) => {
                    error!(
                        "Failed to initialize session for {} (attempt {}): {:#}",
                        user_id, attempt, e
                    );
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_millis(self.config.init_backoff_ms))
                            .await;
                    }
                }
            }
        }

        error!(
            "Could not initialize session for {} after {} attempts",
            user_id, attempts
        );
        let teardown = {
            let mut users = self.users.lock().await;
            match users.get_mut(user_id) {
                Some(state) if state.generation == generation => {
                    state.forwarding = false;
                    state.deletions = false;
                    Some(Teardown {
                        session: state.session.take(),
                        relay: state.relay.take(),
                        bot: None,
                    })
                }
                _ => None,
            }
        };
        if let Some(teardown) = teardown {
            teardown.run(user_id, false).await;
        }
        false
    }

    async fn pump_events(
        self: Arc<Self>,
        user_id: String,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<SourceEvent>,
    ) {
        while let Some(event) = events.recv().await {
            self.handle_event(&user_id, generation, event).await;
        }
        debug!("Event stream for {} (generation {}) closed", user_id, generation);
    }

    async fn handle_event(&self, user_id: &str, generation: u64, event: SourceEvent) {
        match event {
            SourceEvent::Qr(code) => {
                info!("Generated QR code for {}", user_id);
                self.update_session(user_id, generation, |session| {
                    session.status = ConnectionStatus::Available;
                    session.qr = Some(code);
                })
                .await;
            }
            SourceEvent::Ready => {
                info!("Session connected for {}", user_id);
                self.update_session(user_id, generation, |session| {
                    session.status = ConnectionStatus::Connected;
                    session.qr = None;
                })
                .await;
            }
            SourceEvent::Disconnected(reason) => {
                error!("Session disconnected for {}: {}", user_id, reason);
                let current = self
                    .update_session(user_id, generation, |session| {
                        session.status = ConnectionStatus::Disconnected;
                    })
                    .await;
                if current {
                    self.request_reset(user_id, true);
                }
            }
            SourceEvent::MessageCreate(message) => {
                if !message.from_me || !self.is_main_chat(user_id, &message).await {
                    return;
                }
                let users = self.users.lock().await;
                let Some(state) = users.get(user_id) else {
                    return;
                };
                if state.generation != generation || !state.forwarding {
                    return;
                }
                if let Some(relay) = &state.relay {
                    relay.forward(message);
                }
            }
            SourceEvent::MessageRevoked { before } => {
                let Some(message) = before else {
                    return;
                };
                if !message.from_me || !self.is_main_chat(user_id, &message).await {
                    return;
                }
                let users = self.users.lock().await;
                let Some(state) = users.get(user_id) else {
                    return;
                };
                if state.generation != generation || !state.deletions {
                    return;
                }
                if let Some(relay) = &state.relay {
                    info!("Queued deletion of {:?} for {}", message.body, user_id);
                    relay.delete(message);
                }
            }
        }
    }

    /// Apply `f` to the user's session if it is still the given generation
    async fn update_session(
        &self,
        user_id: &str,
        generation: u64,
        f: impl FnOnce(&mut Session),
    ) -> bool {
        let mut users = self.users.lock().await;
        match users.get_mut(user_id) {
            Some(state) if state.generation == generation => match state.session.as_mut() {
                Some(session) => {
                    f(session);
                    true
                }
                None => false,
            },
            _ => {
                debug!("Ignoring event from a replaced session for {}", user_id);
                false
            }
        }
    }

    async fn is_main_chat(&self, user_id: &str, message: &InboundMessage) -> bool {
        match self.store.chat_selection(user_id).await {
            Ok(Some(selection)) => selection.main_chat == message.to,
            Ok(None) => false,
            Err(e) => {
                error!("Failed to load chat selection for {}: {:#}", user_id, e);
                false
            }
        }
    }

    fn request_reset(&self, user_id: &str, hard: bool) {
        let request = ResetRequest {
            user_id: user_id.to_string(),
            hard,
        };
        if self.resets.send(request).is_err() {
            error!("Reset supervisor is gone; cannot restart {}", user_id);
        }
    }

    /// Enable forwarding and deletion tracking. Calling it again while
    /// already listening does nothing.
    pub async fn start_listening(&self, user_id: &str) -> Result<()> {
        {
            let mut users = self.users.lock().await;
            let state = self.live_state(&mut users, user_id)?;
            if state.forwarding {
                info!("Listener already active for {}", user_id);
                return Ok(());
            }
            state.forwarding = true;
            state.deletions = true;
            self.ensure_relay(user_id, state);
            info!("Listening for messages for {}", user_id);
        }

        if let Err(e) = self.ensure_bot(user_id).await {
            warn!("Secondary bot unavailable for {}: {:#}", user_id, e);
        }
        Ok(())
    }

    /// Enable deletion tracking only
    pub async fn start_listening_deletions(&self, user_id: &str) -> Result<()> {
        let mut users = self.users.lock().await;
        let state = self.live_state(&mut users, user_id)?;
        if state.deletions {
            info!("Deletion listener already active for {}", user_id);
            return Ok(());
        }
        state.deletions = true;
        self.ensure_relay(user_id, state);
        info!("Listening for deletions for {}", user_id);
        Ok(())
    }

    fn live_state<'a>(
        &self,
        users: &'a mut HashMap<String, UserState>,
        user_id: &str,
    ) -> Result<&'a mut UserState> {
        match users.get_mut(user_id) {
            Some(state) if state.session.is_some() => Ok(state),
            _ => Err(NotConnected.into()),
        }
    }

    fn ensure_relay(&self, user_id: &str, state: &mut UserState) {
        if state.relay.is_some() {
            return;
        }
        let Some(session) = state.session.as_ref() else {
            return;
        };
        state.relay = Some(RelayHandle::spawn(
            user_id.to_string(),
            Arc::clone(&session.connection),
            state.bot.subscribe(),
            self.store.clone(),
            self.pacing.clone(),
        ));
    }

    pub async fn sessions(&self) -> Vec<SessionInfo> {
        let users = self.users.lock().await;
        let mut sessions: Vec<SessionInfo> = users
            .iter()
            .map(|(user_id, state)| SessionInfo {
                user_id: user_id.clone(),
                status: state
                    .session
                    .as_ref()
                    .map(|session| session.status)
                    .unwrap_or(ConnectionStatus::Disconnected),
            })
            .collect();
        sessions.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        sessions
    }

    pub async fn is_active(&self, user_id: &str) -> bool {
        let users = self.users.lock().await;
        users
            .get(user_id)
            .is_some_and(|state| state.session.is_some())
    }

    async fn connection(&self, user_id: &str) -> Result<Arc<dyn SourceConnection>> {
        let users = self.users.lock().await;
        users
            .get(user_id)
            .and_then(|state| state.session.as_ref())
            .map(|session| Arc::clone(&session.connection))
            .ok_or_else(|| NotConnected.into())
    }

    /// First chats of the user's source account. A failing connection is
    /// restarted in the background.
    pub async fn chats(&self, user_id: &str) -> Result<Vec<ChatSummary>> {
        let connection = self.connection(user_id).await?;
        match connection.get_chats().await {
            Ok(mut chats) => {
                chats.truncate(CHAT_LIST_LIMIT);
                info!("Fetched {} chats for {}", chats.len(), user_id);
                Ok(chats)
            }
            Err(e) => {
                error!("Error fetching chats for {}: {:#}", user_id, e);
                self.request_reset(user_id, false);
                Err(e.context("Failed to fetch chats"))
            }
        }
    }

    /// Save the chat selection, bring up the secondary bot and start
    /// listening if the user is connected.
    pub async fn save_chats(&self, user_id: &str, selection: &ChatSelection) -> Result<()> {
        info!(
            "Saving chats for {}: main {} -> {:?}",
            user_id, selection.main_chat, selection.target_chats
        );
        self.store.save_chat_selection(user_id, selection).await?;

        if let Err(e) = self.ensure_bot(user_id).await {
            warn!("Secondary bot unavailable for {}: {:#}", user_id, e);
        }
        if let Err(e) = self.start_listening(user_id).await {
            warn!("Not listening for {} yet: {:#}", user_id, e);
        }
        Ok(())
    }

    /// The user's bot assignment, assigning one from the pool if needed
    pub async fn assign_bot(&self, user_id: &str) -> Result<Option<BotAssignment>> {
        self.store.assign_bot(user_id, &self.bots).await
    }

    /// Launch the user's secondary bot unless one is already running.
    pub async fn ensure_bot(&self, user_id: &str) -> Result<Option<BotAssignment>> {
        let Some(assignment) = self.assign_bot(user_id).await? else {
            info!("No secondary bot available for {}", user_id);
            return Ok(None);
        };

        {
            let mut users = self.users.lock().await;
            let state = users
                .entry(user_id.to_string())
                .or_insert_with(UserState::new);
            if state.bot.borrow().is_some() {
                debug!("Secondary bot for {} already running", user_id);
                return Ok(Some(assignment));
            }
        }

        info!("Launching secondary bot {} for {}", assignment.bot_name, user_id);
        let bot = self.launcher.launch(user_id, &assignment).await?;

        let duplicate = {
            let mut users = self.users.lock().await;
            let state = users
                .entry(user_id.to_string())
                .or_insert_with(UserState::new);
            if state.bot.borrow().is_some() {
                Some(bot)
            } else {
                state.bot.send_replace(Some(bot));
                None
            }
        };
        if let Some(bot) = duplicate {
            bot.shutdown().await;
        }
        Ok(Some(assignment))
    }

    pub async fn relay_status(&self, user_id: &str) -> Option<RelayStatus> {
        let users = self.users.lock().await;
        users
            .get(user_id)
            .and_then(|state| state.relay.as_ref())
            .map(RelayHandle::status)
    }

    /// Tear the user's session down and build a new one. A hard restart also
    /// kills the session's process by id. Queued and in-flight relay work is
    /// discarded. A reset requested while a restart is running is held and
    /// runs once the current one finishes.
    pub async fn restart_session(self: &Arc<Self>, user_id: &str, hard: bool) {
        {
            let mut users = self.users.lock().await;
            let state = users
                .entry(user_id.to_string())
                .or_insert_with(UserState::new);
            if state.restarting {
                info!("Restart already running for {}, queueing another", user_id);
                state.reset_pending = Some(state.reset_pending.unwrap_or(false) || hard);
                return;
            }
            state.restarting = true;
        }

        let mut hard = hard;
        loop {
            self.reset_once(user_id, hard).await;

            let mut users = self.users.lock().await;
            let Some(state) = users.get_mut(user_id) else {
                break;
            };
            match state.reset_pending.take() {
                Some(next) => {
                    info!("Running reset requested during restart for {}", user_id);
                    hard = next;
                }
                None => {
                    state.restarting = false;
                    break;
                }
            }
        }
    }

    async fn reset_once(self: &Arc<Self>, user_id: &str, hard: bool) {
        info!("Restarting session for {} (hard: {})", user_id, hard);

        let teardown = {
            let mut users = self.users.lock().await;
            let state = users
                .entry(user_id.to_string())
                .or_insert_with(UserState::new);
            state.generation += 1;
            state.forwarding = false;
            state.deletions = false;
            Teardown {
                session: state.session.take(),
                relay: state.relay.take(),
                bot: state.bot.send_replace(None),
            }
        };
        teardown.run(user_id, hard).await;

        let cooldown = Duration::from_millis(self.config.reset_cooldown_ms);
        if !cooldown.is_zero() {
            info!("Waiting {:?} for resources to be released", cooldown);
            tokio::time::sleep(cooldown).await;
        }

        match self.open_session(user_id).await {
            Ok((generation, connection)) => {
                self.initialize(user_id, generation, connection).await;
            }
            Err(e) => error!("Could not recreate session for {}: {:#}", user_id, e),
        }
    }

    /// Tear down every session concurrently
    pub async fn shutdown_all(&self) {
        let teardowns: Vec<(String, Teardown)> = {
            let mut users = self.users.lock().await;
            users
                .drain()
                .map(|(user_id, mut state)| {
                    let teardown = Teardown {
                        session: state.session.take(),
                        relay: state.relay.take(),
                        bot: state.bot.send_replace(None),
                    };
                    (user_id, teardown)
                })
                .collect()
        };

        info!("Shutting down {} sessions", teardowns.len());
        futures::future::join_all(
            teardowns
                .into_iter()
                .map(|(user_id, teardown)| async move { teardown.run(&user_id, false).await }),
        )
        .await;
    }
}

async fn supervise_resets(
    registry: Weak<UserRegistry>,
    mut requests: mpsc::UnboundedReceiver<ResetRequest>,
) {
    while let Some(request) = requests.recv().await {
        let Some(registry) = registry.upgrade() else {
            break;
        };
        tokio::spawn(async move {
            registry
                .restart_session(&request.user_id, request.hard)
                .await;
        });
    }
}
