//! Document store for permission records and conversations.
//!
//! Records are kept as JSON documents keyed by their numeric id. The relay
//! only needs find-by-id, create, delete and update-by-id, which is all the
//! [`Store`] trait exposes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use async_trait::async_trait;
use log::{debug, info};
use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;

use crate::conversation::{Conversation, Message, User};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("document encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage task join error: {0}")]
    Task(String),

    #[error("conversation {0} does not exist")]
    MissingConversation(i64),
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn find_user(&self, user_id: i64) -> StoreResult<Option<User>>;

    /// Inserts `user` unless a record with its id exists. Returns whether a
    /// record was written.
    async fn create_user(&self, user: &User) -> StoreResult<bool>;

    /// Returns whether a record was removed.
    async fn delete_user(&self, user_id: i64) -> StoreResult<bool>;

    async fn find_conversation(&self, conversation_id: i64) -> StoreResult<Option<Conversation>>;

    /// Inserts `conversation` unless one with its id exists; an existing
    /// record is never overwritten. Returns whether a record was written.
    async fn create_conversation(&self, conversation: &Conversation) -> StoreResult<bool>;

    /// Replaces the stored message list of a conversation.
    async fn update_messages(&self, conversation_id: i64, messages: &[Message]) -> StoreResult<()>;

    /// Appends one message to a stored conversation.
    async fn push_message(&self, conversation_id: i64, message: &Message) -> StoreResult<()>;
}

/// Opens the store named by a database URL: `memory:` for a process-local
/// store, otherwise `sqlite://<path>` or a bare file path.
pub async fn open_store(database_url: &str) -> anyhow::Result<Arc<dyn Store>> {
    if database_url == "memory:" {
        info!("Using in-memory store; records will not survive a restart");
        return Ok(Arc::new(MemoryStore::default()));
    }
    let path = database_url
        .strip_prefix("sqlite://")
        .unwrap_or(database_url);
    info!("Opening SQLite store at {}", path);
    let store = SqliteStore::new(path);
    store
        .init()
        .await
        .with_context(|| format!("failed to initialize store at {path}"))?;
    Ok(Arc::new(store))
}

#[derive(Default)]
pub struct MemoryStore {
    users: Mutex<HashMap<i64, User>>,
    conversations: Mutex<HashMap<i64, Conversation>>,
}

impl MemoryStore {
    fn with_conversation<T>(
        &self,
        conversation_id: i64,
        func: impl FnOnce(&mut Conversation) -> T,
    ) -> StoreResult<T> {
        let mut conversations = self
            .conversations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        conversations
            .get_mut(&conversation_id)
            .map(func)
            .ok_or(StoreError::MissingConversation(conversation_id))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_user(&self, user_id: i64) -> StoreResult<Option<User>> {
        let users = self.users.lock().unwrap_or_else(|p| p.into_inner());
        Ok(users.get(&user_id).cloned())
    }

    async fn create_user(&self, user: &User) -> StoreResult<bool> {
        let mut users = self.users.lock().unwrap_or_else(|p| p.into_inner());
        if users.contains_key(&user.user_id) {
            return Ok(false);
        }
        users.insert(user.user_id, user.clone());
        Ok(true)
    }

    async fn delete_user(&self, user_id: i64) -> StoreResult<bool> {
        let mut users = self.users.lock().unwrap_or_else(|p| p.into_inner());
        Ok(users.remove(&user_id).is_some())
    }

    async fn find_conversation(&self, conversation_id: i64) -> StoreResult<Option<Conversation>> {
        let conversations = self.conversations.lock().unwrap_or_else(|p| p.into_inner());
        Ok(conversations.get(&conversation_id).cloned())
    }

    async fn create_conversation(&self, conversation: &Conversation) -> StoreResult<bool> {
        let mut conversations = self.conversations.lock().unwrap_or_else(|p| p.into_inner());
        if conversations.contains_key(&conversation.conversation_id) {
            return Ok(false);
        }
        conversations.insert(conversation.conversation_id, conversation.clone());
        Ok(true)
    }

    async fn update_messages(&self, conversation_id: i64, messages: &[Message]) -> StoreResult<()> {
        self.with_conversation(conversation_id, |conv| {
            conv.messages = messages.to_vec();
        })
    }

    async fn push_message(&self, conversation_id: i64, message: &Message) -> StoreResult<()> {
        self.with_conversation(conversation_id, |conv| {
            conv.messages.push(message.clone());
        })
    }
}

/// SQLite-backed store holding one JSON document per row.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }

    pub async fn init(&self) -> StoreResult<()> {
        self.with_connection(|connection| {
            connection.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS users (
                    user_id INTEGER PRIMARY KEY,
                    document TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS conversations (
                    conversation_id INTEGER PRIMARY KEY,
                    document TEXT NOT NULL
                );
                "#,
            )?;
            Ok(())
        })
        .await
    }

    async fn with_connection<T, F>(&self, func: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut connection = open_connection(&db_path)?;
            func(&mut connection)
        })
        .await
        .map_err(|error| StoreError::Task(error.to_string()))?
    }

    /// Read-modify-write of one conversation document inside a transaction.
    async fn modify_conversation<F>(&self, conversation_id: i64, func: F) -> StoreResult<()>
    where
        F: FnOnce(&mut Conversation) + Send + 'static,
    {
        self.with_connection(move |connection| {
            let tx = connection.transaction()?;
            let raw: Option<String> = tx
                .query_row(
                    "SELECT document FROM conversations WHERE conversation_id = ?1",
                    params![conversation_id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(raw) = raw else {
                return Err(StoreError::MissingConversation(conversation_id));
            };
            let mut conversation: Conversation = serde_json::from_str(&raw)?;
            func(&mut conversation);
            tx.execute(
                "UPDATE conversations SET document = ?2 WHERE conversation_id = ?1",
                params![conversation_id, serde_json::to_string(&conversation)?],
            )?;
            tx.commit()?;
            debug!(
                "Conversation {} now holds {} message(s)",
                conversation_id,
                conversation.messages.len()
            );
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn find_user(&self, user_id: i64) -> StoreResult<Option<User>> {
        self.with_connection(move |connection| {
            let raw: Option<String> = connection
                .query_row(
                    "SELECT document FROM users WHERE user_id = ?1",
                    params![user_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(raw.map(|raw| serde_json::from_str(&raw)).transpose()?)
        })
        .await
    }

    async fn create_user(&self, user: &User) -> StoreResult<bool> {
        let user_id = user.user_id;
        let document = serde_json::to_string(user)?;
        self.with_connection(move |connection| {
            let inserted = connection.execute(
                "INSERT OR IGNORE INTO users (user_id, document) VALUES (?1, ?2)",
                params![user_id, document],
            )?;
            Ok(inserted > 0)
        })
        .await
    }

    async fn delete_user(&self, user_id: i64) -> StoreResult<bool> {
        self.with_connection(move |connection| {
            let deleted =
                connection.execute("DELETE FROM users WHERE user_id = ?1", params![user_id])?;
            Ok(deleted > 0)
        })
        .await
    }

    async fn find_conversation(&self, conversation_id: i64) -> StoreResult<Option<Conversation>> {
        self.with_connection(move |connection| {
            let raw: Option<String> = connection
                .query_row(
                    "SELECT document FROM conversations WHERE conversation_id = ?1",
                    params![conversation_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(raw.map(|raw| serde_json::from_str(&raw)).transpose()?)
        })
        .await
    }

    async fn create_conversation(&self, conversation: &Conversation) -> StoreResult<bool> {
        let conversation_id = conversation.conversation_id;
        let document = serde_json::to_string(conversation)?;
        self.with_connection(move |connection| {
            let inserted = connection.execute(
                "INSERT OR IGNORE INTO conversations (conversation_id, document) VALUES (?1, ?2)",
                params![conversation_id, document],
            )?;
            Ok(inserted > 0)
        })
        .await
    }

    async fn update_messages(&self, conversation_id: i64, messages: &[Message]) -> StoreResult<()> {
        let messages = messages.to_vec();
        self.modify_conversation(conversation_id, move |conv| conv.messages = messages)
            .await
    }

    async fn push_message(&self, conversation_id: i64, message: &Message) -> StoreResult<()> {
        let message = message.clone();
        self.modify_conversation(conversation_id, move |conv| conv.messages.push(message))
            .await
    }
}

fn open_connection(path: &Path) -> StoreResult<Connection> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let connection = Connection::open(path)?;
    connection.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        "#,
    )?;
    Ok(connection)
}
