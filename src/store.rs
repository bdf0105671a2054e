use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::config::BotConfig;
use crate::platform::BotAssignment;

/// Which chats a user relays from and to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSelection {
    pub main_chat: String,
    pub target_chats: Vec<String>,
}

/// A secondary-platform chat the user's bot has seen
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecondaryChat {
    pub chat_id: i64,
    pub name: String,
    pub selected: bool,
}

/// Per-user relay settings backed by SQLite
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        // journal_mode PRAGMA returns the resulting mode, so use query_row
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;

        Self::run_migrations(&conn)?;

        info!("Store initialized at: {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing)
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS chat_selections (
                user_id TEXT PRIMARY KEY,
                main_chat TEXT NOT NULL,
                target_chats TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS user_settings (
                user_id TEXT PRIMARY KEY,
                suffix TEXT
            );

            CREATE TABLE IF NOT EXISTS bot_assignments (
                user_id TEXT PRIMARY KEY,
                bot_name TEXT NOT NULL UNIQUE,
                bot_token TEXT NOT NULL,
                assigned_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS secondary_chats (
                user_id TEXT NOT NULL,
                chat_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                selected INTEGER NOT NULL DEFAULT 1,
                discovered_at TEXT NOT NULL,
                PRIMARY KEY (user_id, chat_id)
            );
            ",
        )
        .context("Failed to run store migrations")?;
        Ok(())
    }

    pub async fn save_chat_selection(&self, user_id: &str, selection: &ChatSelection) -> Result<()> {
        let targets = serde_json::to_string(&selection.target_chats)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO chat_selections (user_id, main_chat, target_chats)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET
                main_chat = excluded.main_chat,
                target_chats = excluded.target_chats,
                updated_at = datetime('now')",
            rusqlite::params![user_id, selection.main_chat, targets],
        )
        .context("Failed to save chat selection")?;
        Ok(())
    }

    pub async fn chat_selection(&self, user_id: &str) -> Result<Option<ChatSelection>> {
        let conn = self.conn.lock().await;
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT main_chat, target_chats FROM chat_selections WHERE user_id = ?1",
                rusqlite::params![user_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("Failed to query chat selection")?;

        match row {
            Some((main_chat, targets)) => {
                let target_chats: Vec<String> = serde_json::from_str(&targets)
                    .with_context(|| format!("Corrupt target list for user {}", user_id))?;
                Ok(Some(ChatSelection {
                    main_chat,
                    target_chats,
                }))
            }
            None => Ok(None),
        }
    }

    /// Set the text appended to forwarded bodies. Empty clears it.
    pub async fn set_suffix(&self, user_id: &str, suffix: &str) -> Result<()> {
        let suffix = if suffix.trim().is_empty() {
            None
        } else {
            Some(suffix)
        };
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO user_settings (user_id, suffix) VALUES (?1, ?2)
             ON CONFLICT(user_id) DO UPDATE SET suffix = excluded.suffix",
            rusqlite::params![user_id, suffix],
        )
        .context("Failed to save suffix")?;
        Ok(())
    }

    pub async fn suffix(&self, user_id: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        let suffix: Option<Option<String>> = conn
            .query_row(
                "SELECT suffix FROM user_settings WHERE user_id = ?1",
                rusqlite::params![user_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query suffix")?;
        Ok(suffix.flatten())
    }

    /// Return the user's bot, assigning the first free one from `pool` if
    /// the user has none yet. `None` when the pool is exhausted.
    pub async fn assign_bot(
        &self,
        user_id: &str,
        pool: &[BotConfig],
    ) -> Result<Option<BotAssignment>> {
        let conn = self.conn.lock().await;

        let existing: Option<BotAssignment> = conn
            .query_row(
                "SELECT bot_name, bot_token FROM bot_assignments WHERE user_id = ?1",
                rusqlite::params![user_id],
                |row| {
                    Ok(BotAssignment {
                        bot_name: row.get(0)?,
                        bot_token: row.get(1)?,
                    })
                },
            )
            .optional()
            .context("Failed to query bot assignment")?;
        if existing.is_some() {
            return Ok(existing);
        }

        let mut stmt = conn
            .prepare("SELECT bot_name FROM bot_assignments")
            .context("Failed to prepare assigned bots query")?;
        let taken = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("Failed to query assigned bots")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to collect assigned bots")?;

        let Some(free) = pool.iter().find(|bot| !taken.contains(&bot.name)) else {
            return Ok(None);
        };

        conn.execute(
            "INSERT INTO bot_assignments (user_id, bot_name, bot_token) VALUES (?1, ?2, ?3)",
            rusqlite::params![user_id, free.name, free.token],
        )
        .context("Failed to save bot assignment")?;
        info!("Assigned bot {} to user {}", free.name, user_id);

        Ok(Some(BotAssignment {
            bot_name: free.name.clone(),
            bot_token: free.token.clone(),
        }))
    }

    /// Record a chat the user's bot received a message in. New chats start
    /// selected; a known chat only has its name refreshed.
    pub async fn record_secondary_chat(&self, user_id: &str, chat_id: i64, name: &str) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO secondary_chats (user_id, chat_id, name, discovered_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id, chat_id) DO UPDATE SET name = excluded.name",
            rusqlite::params![user_id, chat_id, name, now],
        )
        .context("Failed to record secondary chat")?;
        Ok(())
    }

    pub async fn secondary_chats(&self, user_id: &str) -> Result<Vec<SecondaryChat>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT chat_id, name, selected FROM secondary_chats
                 WHERE user_id = ?1 ORDER BY discovered_at ASC, chat_id ASC",
            )
            .context("Failed to prepare secondary chats query")?;
        let chats = stmt
            .query_map(rusqlite::params![user_id], |row| {
                Ok(SecondaryChat {
                    chat_id: row.get(0)?,
                    name: row.get(1)?,
                    selected: row.get::<_, i64>(2)? != 0,
                })
            })
            .context("Failed to map secondary chats")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to collect secondary chats")?;
        Ok(chats)
    }

    /// Chats forwarded copies go to on the secondary platform
    pub async fn secondary_targets(&self, user_id: &str) -> Result<Vec<i64>> {
        Ok(self
            .secondary_chats(user_id)
            .await?
            .into_iter()
            .filter(|chat| chat.selected)
            .map(|chat| chat.chat_id)
            .collect())
    }

    /// Mark exactly `selected` as forwarding targets among the known chats
    pub async fn select_secondary_chats(&self, user_id: &str, selected: &[i64]) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().context("Failed to begin transaction")?;
        tx.execute(
            "UPDATE secondary_chats SET selected = 0 WHERE user_id = ?1",
            rusqlite::params![user_id],
        )?;
        for chat_id in selected {
            tx.execute(
                "UPDATE secondary_chats SET selected = 1 WHERE user_id = ?1 AND chat_id = ?2",
                rusqlite::params![user_id, chat_id],
            )?;
        }
        tx.commit().context("Failed to save secondary chat selection")?;
        Ok(())
    }
}
