//! Per-user relay engine.
//!
//! Each user gets one actor task that owns the send queue, the delete queue
//! and the mapping of forwarded copies. Commands arrive over a channel and are
//! processed strictly one at a time: sends always go first, a deletion only
//! starts once no send is queued or running.

pub mod forward;
pub mod mapping;
pub mod pacing;

use std::collections::VecDeque;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{DelayRange, PacingConfig};
use crate::platform::{InboundMessage, SecondaryBot, SourceConnection};
use crate::store::Store;

use self::forward::{ForwardContext, Forwarder};
use self::mapping::MappingStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayState {
    Idle,
    SendingOne,
    WaitingBetweenSends,
    DeletingOne,
    WaitingBetweenDeletions,
}

#[cfg(test)]
impl RelayState {
    pub fn in_flight(self) -> bool {
        matches!(self, RelayState::SendingOne | RelayState::DeletingOne)
    }
}

/// Snapshot of one user's relay engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStatus {
    pub state: RelayState,
    pub pending_sends: usize,
    pub pending_deletions: usize,
    pub tracked_source: usize,
    pub tracked_secondary: usize,
    pub forwarded: u64,
    pub retracted: u64,
}

impl Default for RelayStatus {
    fn default() -> Self {
        Self {
            state: RelayState::Idle,
            pending_sends: 0,
            pending_deletions: 0,
            tracked_source: 0,
            tracked_secondary: 0,
            forwarded: 0,
            retracted: 0,
        }
    }
}

#[derive(Debug)]
enum RelayCommand {
    Forward(InboundMessage),
    Delete(InboundMessage),
}

/// Shared handle to the user's current secondary bot, if any
pub type BotSlot = watch::Receiver<Option<Arc<dyn SecondaryBot>>>;

/// Handle to a running relay actor. Dropping it does not stop the actor;
/// `abort` does, discarding queued and in-flight work.
pub struct RelayHandle {
    commands: mpsc::UnboundedSender<RelayCommand>,
    status: watch::Receiver<RelayStatus>,
    task: JoinHandle<()>,
}

impl RelayHandle {
    pub fn spawn(
        user_id: String,
        connection: Arc<dyn SourceConnection>,
        bot: BotSlot,
        store: Store,
        pacing: PacingConfig,
    ) -> Self {
        let (commands, inbox) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(RelayStatus::default());

        let engine = RelayEngine {
            user_id,
            connection,
            bot,
            store,
            pacing,
            inbox,
            sends: VecDeque::new(),
            deletions: VecDeque::new(),
            mapping: MappingStore::new(),
            state: RelayState::Idle,
            forwarded: 0,
            retracted: 0,
            status: status_tx,
        };
        let task = tokio::spawn(engine.run());

        Self {
            commands,
            status,
            task,
        }
    }

    /// Queue a message for forwarding
    pub fn forward(&self, message: InboundMessage) {
        if self.commands.send(RelayCommand::Forward(message)).is_err() {
            warn!("Relay engine stopped; dropping message");
        }
    }

    /// Queue deletion of every forwarded copy of a message
    pub fn delete(&self, message: InboundMessage) {
        if self.commands.send(RelayCommand::Delete(message)).is_err() {
            warn!("Relay engine stopped; dropping deletion");
        }
    }

    pub fn status(&self) -> RelayStatus {
        self.status.borrow().clone()
    }

    #[cfg(test)]
    pub fn subscribe(&self) -> watch::Receiver<RelayStatus> {
        self.status.clone()
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

enum Step {
    Send(InboundMessage),
    Delete(InboundMessage),
}

struct RelayEngine {
    user_id: String,
    connection: Arc<dyn SourceConnection>,
    bot: BotSlot,
    store: Store,
    pacing: PacingConfig,
    inbox: mpsc::UnboundedReceiver<RelayCommand>,
    sends: VecDeque<InboundMessage>,
    deletions: VecDeque<InboundMessage>,
    mapping: MappingStore,
    state: RelayState,
    forwarded: u64,
    retracted: u64,
    status: watch::Sender<RelayStatus>,
}

impl RelayEngine {
    async fn run(mut self) {
        debug!("Relay engine started for {}", self.user_id);
        loop {
            self.drain_inbox();

            let step = if let Some(message) = self.sends.pop_front() {
                Step::Send(message)
            } else if let Some(message) = self.deletions.pop_front() {
                Step::Delete(message)
            } else {
                self.set_state(RelayState::Idle);
                match self.inbox.recv().await {
                    Some(command) => {
                        self.enqueue(command);
                        continue;
                    }
                    None => break,
                }
            };

            match step {
                Step::Send(message) => {
                    self.set_state(RelayState::SendingOne);
                    self.send_one(message).await;
                    self.set_state(RelayState::WaitingBetweenSends);
                    if !self.wait(self.pacing.between_sends).await {
                        break;
                    }
                }
                Step::Delete(message) => {
                    self.set_state(RelayState::DeletingOne);
                    self.delete_one(message).await;
                    self.set_state(RelayState::WaitingBetweenDeletions);
                    if !self.wait(self.pacing.between_deletions).await {
                        break;
                    }
                }
            }
        }
        debug!("Relay engine stopped for {}", self.user_id);
    }

    fn enqueue(&mut self, command: RelayCommand) {
        match command {
            RelayCommand::Forward(message) => {
                info!(
                    "Queued message {} ({}) for {}",
                    message.id,
                    String::from(message.kind.clone()),
                    self.user_id
                );
                self.sends.push_back(message);
            }
            RelayCommand::Delete(message) => {
                info!("Queued deletion of {} for {}", message.id, self.user_id);
                self.deletions.push_back(message);
            }
        }
        self.publish();
    }

    fn drain_inbox(&mut self) {
        while let Ok(command) = self.inbox.try_recv() {
            self.enqueue(command);
        }
    }

    /// Sleep a jittered delay while still accepting commands. Returns false
    /// once every handle is gone and nothing is left to do.
    async fn wait(&mut self, range: DelayRange) -> bool {
        let sleep = tokio::time::sleep(pacing::jitter(range));
        tokio::pin!(sleep);
        let mut closed = false;
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                command = self.inbox.recv(), if !closed => match command {
                    Some(command) => self.enqueue(command),
                    None => closed = true,
                },
            }
        }
        !closed || !(self.sends.is_empty() && self.deletions.is_empty())
    }

    async fn send_one(&mut self, message: InboundMessage) {
        let selection = match self.store.chat_selection(&self.user_id).await {
            Ok(Some(selection)) => selection,
            Ok(None) => {
                warn!("No chat selection for {}; dropping {}", self.user_id, message.id);
                return;
            }
            Err(e) => {
                error!("Failed to load chat selection for {}: {:#}", self.user_id, e);
                return;
            }
        };
        let suffix = match self.store.suffix(&self.user_id).await {
            Ok(suffix) => suffix,
            Err(e) => {
                warn!("Failed to load suffix for {}: {:#}", self.user_id, e);
                None
            }
        };

        let bot = self.bot.borrow().clone();
        let secondary_targets = match &bot {
            Some(_) => self
                .store
                .secondary_targets(&self.user_id)
                .await
                .unwrap_or_else(|e| {
                    warn!("Failed to load secondary targets for {}: {:#}", self.user_id, e);
                    Vec::new()
                }),
            None => Vec::new(),
        };

        let forwarder = Forwarder::for_message(message);
        let mut ctx = ForwardContext {
            connection: self.connection.as_ref(),
            bot: bot.as_deref(),
            selection: &selection,
            secondary_targets: &secondary_targets,
            suffix: suffix.as_deref(),
            pacing: &self.pacing,
            mapping: &mut self.mapping,
        };
        match forwarder.forward(&mut ctx).await {
            Ok(()) => self.forwarded += 1,
            Err(e) => error!(
                "Error forwarding {} for {}: {:#}",
                forwarder.message().id,
                self.user_id,
                e
            ),
        }
    }

    async fn delete_one(&mut self, message: InboundMessage) {
        info!("Processing deletion of {} for {}", message.id, self.user_id);
        let bot = self.bot.borrow().clone();
        let result = forward::retract(
            self.connection.as_ref(),
            bot.as_deref(),
            &self.pacing,
            &mut self.mapping,
            &message,
        )
        .await;
        info!(
            "Deleted {} source and {} secondary copies of {}",
            result.source_deleted, result.secondary_deleted, message.id
        );
        self.retracted += 1;
    }

    fn set_state(&mut self, state: RelayState) {
        self.state = state;
        self.publish();
    }

    fn publish(&self) {
        self.status.send_replace(RelayStatus {
            state: self.state,
            pending_sends: self.sends.len(),
            pending_deletions: self.deletions.len(),
            tracked_source: self.mapping.source_len(),
            tracked_secondary: self.mapping.secondary_len(),
            forwarded: self.forwarded,
            retracted: self.retracted,
        });
    }
}
