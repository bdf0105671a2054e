use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use teloxide::dispatching::ShutdownToken;
use teloxide::prelude::*;
use teloxide::types::{Chat, InputFile, InputPollOption, MessageId};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{BotAssignment, BotLauncher, SecondaryBot, SecondaryPayload};
use crate::store::Store;

const PHOTO_FILE_NAME: &str = "image.jpg";
const VIDEO_FILE_NAME: &str = "video.mp4";

/// User a bot was launched for, injected into the update handler
#[derive(Clone)]
struct BotOwner(String);

/// Display name for a chat the bot has seen
fn chat_name(chat: &Chat) -> String {
    chat.title()
        .or_else(|| chat.username())
        .or_else(|| chat.first_name())
        .map(str::to_string)
        .unwrap_or_else(|| chat.id.to_string())
}

/// Telegram bot handed to one user. Sends forwarded copies and records every
/// chat it receives a message in.
pub struct TelegramBot {
    bot: Bot,
    user_id: String,
    shutdown: ShutdownToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl TelegramBot {
    fn start(bot: Bot, user_id: &str, store: Store) -> Self {
        let handler = Update::filter_message().endpoint(record_chat);

        let mut dispatcher = Dispatcher::builder(bot.clone(), handler)
            .dependencies(dptree::deps![store, BotOwner(user_id.to_string())])
            .default_handler(|upd| async move {
                debug!("Unhandled update: {:?}", upd.id);
            })
            .error_handler(LoggingErrorHandler::with_custom_text("telegram"))
            .build();
        let shutdown = dispatcher.shutdown_token();
        let handle = tokio::spawn(async move {
            dispatcher.dispatch().await;
        });

        Self {
            bot,
            user_id: user_id.to_string(),
            shutdown,
            dispatcher: Mutex::new(Some(handle)),
        }
    }

    async fn send_once(&self, chat_id: ChatId, payload: &SecondaryPayload) -> Result<Message> {
        let message = match payload {
            SecondaryPayload::Text { text } => self.bot.send_message(chat_id, text).await?,
            SecondaryPayload::Photo { data, caption } => {
                let photo = InputFile::memory(data.clone()).file_name(PHOTO_FILE_NAME);
                let mut request = self.bot.send_photo(chat_id, photo);
                if !caption.is_empty() {
                    request = request.caption(caption);
                }
                request.await?
            }
            SecondaryPayload::Video { data, caption } => {
                let video = InputFile::memory(data.clone()).file_name(VIDEO_FILE_NAME);
                let mut request = self.bot.send_video(chat_id, video);
                if !caption.is_empty() {
                    request = request.caption(caption);
                }
                request.await?
            }
            SecondaryPayload::Poll {
                question,
                options,
                allow_multiple_answers,
            } => {
                self.bot
                    .send_poll(
                        chat_id,
                        question,
                        options.iter().map(|option| InputPollOption::new(option.as_str())),
                    )
                    .is_anonymous(true)
                    .allows_multiple_answers(*allow_multiple_answers)
                    .await?
            }
        };
        Ok(message)
    }
}

async fn record_chat(msg: Message, store: Store, owner: BotOwner) -> ResponseResult<()> {
    let name = chat_name(&msg.chat);
    info!("Detected chat {} ({}) for {}", name, msg.chat.id, owner.0);

    if let Err(e) = store.record_secondary_chat(&owner.0, msg.chat.id.0, &name).await {
        error!("Failed to record chat {} for {}: {:#}", msg.chat.id, owner.0, e);
    }
    Ok(())
}

#[async_trait]
impl SecondaryBot for TelegramBot {
    async fn send(&self, chat_id: i64, payload: &SecondaryPayload) -> Result<i32> {
        let message = self
            .send_once(ChatId(chat_id), payload)
            .await
            .with_context(|| format!("Telegram send to {} failed", chat_id))?;
        Ok(message.id.0)
    }

    async fn delete_message(&self, chat_id: i64, message_id: i32) -> Result<()> {
        self.bot
            .delete_message(ChatId(chat_id), MessageId(message_id))
            .await
            .with_context(|| format!("Failed to delete {} in {}", message_id, chat_id))?;
        Ok(())
    }

    async fn shutdown(&self) {
        match self.shutdown.shutdown() {
            Ok(stopped) => stopped.await,
            Err(_) => debug!("Dispatcher for {} was not running", self.user_id),
        }
        if let Some(handle) = self.dispatcher.lock().await.take() {
            handle.abort();
        }
        info!("Telegram bot for {} stopped", self.user_id);
    }
}

/// Launches a `TelegramBot` per user from its pool assignment
pub struct TelegramLauncher {
    store: Store,
}

impl TelegramLauncher {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl BotLauncher for TelegramLauncher {
    async fn launch(
        &self,
        user_id: &str,
        assignment: &BotAssignment,
    ) -> Result<Arc<dyn SecondaryBot>> {
        let bot = Bot::new(&assignment.bot_token);
        match bot.get_me().await {
            Ok(me) => info!("Bot @{} ready for {}", me.username(), user_id),
            Err(e) => warn!(
                "Could not verify bot {} for {}: {}",
                assignment.bot_name, user_id, e
            ),
        }
        Ok(Arc::new(TelegramBot::start(bot, user_id, self.store.clone())))
    }
}
