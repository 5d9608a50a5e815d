use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::Connection;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use copilotos_core::cache::MemoryCache;

use crate::db::init_db;
use crate::error::{Result, SessionError};
use crate::types::{
    ChatMessage, ChatSession, DateRange, NewMessage, SessionPage, SessionPatch,
};

const HISTORY_CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
    Txt,
}

impl std::str::FromStr for ExportFormat {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            "txt" => Ok(ExportFormat::Txt),
            other => Err(SessionError::InvalidInput(format!(
                "unknown export format: {other}"
            ))),
        }
    }
}

/// Thread-safe store for chat sessions and messages.
///
/// Wraps a single SQLite connection in a `Mutex`; sufficient for the
/// single-node target. Default-page history reads go through the shared
/// KV cache and are invalidated on every write to the same chat.
pub struct SessionStore {
    db: Mutex<Connection>,
    cache: Arc<MemoryCache>,
}

impl SessionStore {
    /// Wrap an already-open connection, initialising the schema.
    pub fn new(conn: Connection, cache: Arc<MemoryCache>) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
            cache,
        })
    }

    fn history_cache_key(chat_id: &str) -> String {
        format!("history:{chat_id}")
    }

    /// Create a session owned by `user_id`.
    #[instrument(skip(self))]
    pub fn create_session(&self, user_id: &str, title: Option<&str>) -> Result<ChatSession> {
        let id = Uuid::now_v7().to_string();
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO chat_sessions (id, user_id, title, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            rusqlite::params![id, user_id, title, now],
        )?;
        info!(session_id = %id, "session created");
        Ok(ChatSession {
            id,
            user_id: user_id.to_string(),
            title: title.map(String::from),
            pinned: false,
            canvas_state: None,
            message_count: 0,
            last_model: None,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    pub fn get_session(&self, id: &str) -> Result<Option<ChatSession>> {
        let db = self.db.lock().unwrap();
        Self::get_session_locked(&db, id)
    }

    fn get_session_locked(db: &Connection, id: &str) -> Result<Option<ChatSession>> {
        match db.query_row(
            "SELECT id, user_id, title, pinned, canvas_state, message_count,
                    last_model, created_at, updated_at
             FROM chat_sessions WHERE id = ?1",
            rusqlite::params![id],
            row_to_session,
        ) {
            Ok(s) => Ok(Some(s)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(SessionError::Database(e)),
        }
    }

    /// Ownership gate used by every operation below.
    fn assert_owner(db: &Connection, id: &str, user_id: &str) -> Result<ChatSession> {
        let session = Self::get_session_locked(db, id)?.ok_or_else(|| SessionError::NotFound {
            id: id.to_string(),
        })?;
        if session.user_id != user_id {
            return Err(SessionError::PermissionDenied { id: id.to_string() });
        }
        Ok(session)
    }

    /// List sessions for a user, pinned first then most recent, with an
    /// optional title search and date range.
    #[instrument(skip(self, date_range))]
    pub fn get_sessions(
        &self,
        user_id: &str,
        limit: usize,
        offset: usize,
        search: Option<&str>,
        date_range: Option<&DateRange>,
    ) -> Result<SessionPage> {
        let db = self.db.lock().unwrap();

        let mut conditions = vec!["user_id = ?1".to_string()];
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(user_id.to_string())];

        if let Some(search) = search {
            params.push(Box::new(format!("%{search}%")));
            conditions.push(format!("title LIKE ?{}", params.len()));
        }
        if let Some(range) = date_range {
            if let Some(from) = &range.from {
                params.push(Box::new(from.clone()));
                conditions.push(format!("created_at >= ?{}", params.len()));
            }
            if let Some(to) = &range.to {
                params.push(Box::new(to.clone()));
                conditions.push(format!("created_at <= ?{}", params.len()));
            }
        }
        let where_clause = conditions.join(" AND ");

        let total_count: u64 = db.query_row(
            &format!("SELECT COUNT(*) FROM chat_sessions WHERE {where_clause}"),
            rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
            |row| row.get(0),
        )?;

        params.push(Box::new(limit as i64));
        params.push(Box::new(offset as i64));
        let sql = format!(
            "SELECT id, user_id, title, pinned, canvas_state, message_count,
                    last_model, created_at, updated_at
             FROM chat_sessions WHERE {where_clause}
             ORDER BY pinned DESC, updated_at DESC
             LIMIT ?{} OFFSET ?{}",
            params.len() - 1,
            params.len()
        );
        let mut stmt = db.prepare(&sql)?;
        let sessions: Vec<ChatSession> = stmt
            .query_map(
                rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
                row_to_session,
            )?
            .filter_map(|r| r.ok())
            .collect();

        let has_more = (offset + sessions.len()) < total_count as usize;
        Ok(SessionPage {
            sessions,
            total_count,
            has_more,
        })
    }

    /// Append a message, bump the session counters and drop the cached
    /// history page for that chat.
    #[instrument(skip(self, message), fields(chat_id = %message.chat_id, role = %message.role))]
    pub fn append_message(&self, message: &NewMessage) -> Result<ChatMessage> {
        let id = Uuid::now_v7().to_string();
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();

        Self::assert_owner(&db, &message.chat_id, &message.user_id)?;

        db.execute(
            "INSERT INTO chat_messages
             (id, chat_id, user_id, role, content, model, tokens_in, tokens_out, task_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                id,
                message.chat_id,
                message.user_id,
                message.role,
                message.content,
                message.model,
                message.tokens_in,
                message.tokens_out,
                message.task_id,
                now
            ],
        )?;
        db.execute(
            "UPDATE chat_sessions
             SET message_count = message_count + 1,
                 last_model = COALESCE(?1, last_model),
                 updated_at = ?2
             WHERE id = ?3",
            rusqlite::params![message.model, now, message.chat_id],
        )?;

        self.cache
            .delete(&Self::history_cache_key(&message.chat_id));

        Ok(ChatMessage {
            id,
            chat_id: message.chat_id.clone(),
            user_id: message.user_id.clone(),
            role: message.role.clone(),
            content: message.content.clone(),
            model: message.model.clone(),
            tokens_in: message.tokens_in,
            tokens_out: message.tokens_out,
            task_id: message.task_id.clone(),
            created_at: now,
        })
    }

    /// Read messages newest-first. The default page (offset 0, no filters)
    /// is served from the KV cache when warm.
    #[instrument(skip(self))]
    pub fn get_messages(
        &self,
        chat_id: &str,
        user_id: &str,
        limit: usize,
        offset: usize,
        include_system: bool,
        role_filter: Option<&str>,
    ) -> Result<Vec<ChatMessage>> {
        // Ownership is checked before any cache read — a warm cache must
        // never leak another user's history.
        {
            let db = self.db.lock().unwrap();
            Self::assert_owner(&db, chat_id, user_id)?;
        }

        let default_page = offset == 0 && role_filter.is_none() && !include_system;
        let cache_key = Self::history_cache_key(chat_id);
        if default_page {
            if let Some(cached) = self.cache.get(&cache_key) {
                if let Ok(messages) = serde_json::from_value::<Vec<ChatMessage>>(cached) {
                    if messages.len() >= limit {
                        debug!(chat_id, "history cache hit");
                        return Ok(messages.into_iter().take(limit).collect());
                    }
                }
            }
        }

        let messages = {
            let db = self.db.lock().unwrap();

            let mut conditions = vec!["chat_id = ?1".to_string()];
            let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(chat_id.to_string())];
            if !include_system {
                conditions.push("role != 'system'".to_string());
            }
            if let Some(role) = role_filter {
                params.push(Box::new(role.to_string()));
                conditions.push(format!("role = ?{}", params.len()));
            }
            params.push(Box::new(limit as i64));
            params.push(Box::new(offset as i64));

            let sql = format!(
                "SELECT id, chat_id, user_id, role, content, model,
                        tokens_in, tokens_out, task_id, created_at
                 FROM chat_messages WHERE {}
                 ORDER BY created_at DESC
                 LIMIT ?{} OFFSET ?{}",
                conditions.join(" AND "),
                params.len() - 1,
                params.len()
            );
            let mut stmt = db.prepare(&sql)?;
            let rows: Vec<ChatMessage> = stmt
                .query_map(
                    rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
                    row_to_message,
                )?
                .filter_map(|r| r.ok())
                .collect();
            rows
        };

        if default_page {
            if let Ok(value) = serde_json::to_value(&messages) {
                self.cache.set(cache_key, value, Some(HISTORY_CACHE_TTL));
            }
        }
        Ok(messages)
    }

    /// Rename or (un)pin a session.
    #[instrument(skip(self, patch))]
    pub fn update_session(
        &self,
        id: &str,
        user_id: &str,
        patch: &SessionPatch,
    ) -> Result<ChatSession> {
        let db = self.db.lock().unwrap();
        Self::assert_owner(&db, id, user_id)?;

        let now = chrono::Utc::now().to_rfc3339();
        if let Some(title) = &patch.title {
            db.execute(
                "UPDATE chat_sessions SET title = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![title, now, id],
            )?;
        }
        if let Some(pinned) = patch.pinned {
            db.execute(
                "UPDATE chat_sessions SET pinned = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![pinned as i32, now, id],
            )?;
        }
        Self::get_session_locked(&db, id)?.ok_or_else(|| SessionError::NotFound {
            id: id.to_string(),
        })
    }

    /// Delete a session and cascade its messages; the cached history for
    /// that chat goes with it.
    #[instrument(skip(self))]
    pub fn delete_session(&self, id: &str, user_id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        Self::assert_owner(&db, id, user_id)?;

        db.execute(
            "DELETE FROM chat_messages WHERE chat_id = ?1",
            rusqlite::params![id],
        )?;
        db.execute(
            "DELETE FROM chat_sessions WHERE id = ?1",
            rusqlite::params![id],
        )?;
        self.cache.delete(&Self::history_cache_key(id));
        info!(session_id = %id, "session deleted");
        Ok(())
    }

    /// Opaque canvas blob, owner-only.
    pub fn get_canvas_state(&self, id: &str, user_id: &str) -> Result<Option<serde_json::Value>> {
        let db = self.db.lock().unwrap();
        let session = Self::assert_owner(&db, id, user_id)?;
        Ok(session.canvas_state)
    }

    /// Shallow-merge a patch into the stored canvas state. A non-object
    /// patch replaces the blob wholesale.
    pub fn patch_canvas_state(
        &self,
        id: &str,
        user_id: &str,
        patch: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let db = self.db.lock().unwrap();
        let session = Self::assert_owner(&db, id, user_id)?;

        let merged = match (session.canvas_state, &patch) {
            (Some(serde_json::Value::Object(mut current)), serde_json::Value::Object(incoming)) => {
                for (key, value) in incoming {
                    current.insert(key.clone(), value.clone());
                }
                serde_json::Value::Object(current)
            }
            _ => patch,
        };

        let now = chrono::Utc::now().to_rfc3339();
        db.execute(
            "UPDATE chat_sessions SET canvas_state = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![serde_json::to_string(&merged)?, now, id],
        )?;
        Ok(merged)
    }

    /// Export a conversation. Messages come out oldest-first for reading.
    #[instrument(skip(self))]
    pub fn export(
        &self,
        chat_id: &str,
        user_id: &str,
        format: ExportFormat,
        include_metadata: bool,
    ) -> Result<String> {
        let mut messages = self.get_messages(chat_id, user_id, 10_000, 0, true, None)?;
        messages.reverse();

        Ok(match format {
            ExportFormat::Json => {
                if include_metadata {
                    serde_json::to_string_pretty(&messages)?
                } else {
                    let slim: Vec<serde_json::Value> = messages
                        .iter()
                        .map(|m| serde_json::json!({ "role": m.role, "content": m.content }))
                        .collect();
                    serde_json::to_string_pretty(&slim)?
                }
            }
            ExportFormat::Csv => {
                let mut out = if include_metadata {
                    String::from("created_at,role,model,tokens_in,tokens_out,content\n")
                } else {
                    String::from("role,content\n")
                };
                for m in &messages {
                    let content = csv_escape(&m.content);
                    if include_metadata {
                        out.push_str(&format!(
                            "{},{},{},{},{},{}\n",
                            m.created_at,
                            m.role,
                            m.model.as_deref().unwrap_or(""),
                            m.tokens_in,
                            m.tokens_out,
                            content
                        ));
                    } else {
                        out.push_str(&format!("{},{}\n", m.role, content));
                    }
                }
                out
            }
            ExportFormat::Txt => {
                let mut out = String::new();
                for m in &messages {
                    if include_metadata {
                        out.push_str(&format!("[{} | {}]\n", m.created_at, m.role));
                    } else {
                        out.push_str(&format!("[{}]\n", m.role));
                    }
                    out.push_str(&m.content);
                    out.push_str("\n\n");
                }
                out
            }
        })
    }
}

fn csv_escape(content: &str) -> String {
    if content.contains(',') || content.contains('"') || content.contains('\n') {
        format!("\"{}\"", content.replace('"', "\"\""))
    } else {
        content.to_string()
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatSession> {
    let canvas_raw: Option<String> = row.get(4)?;
    Ok(ChatSession {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        pinned: row.get::<_, i32>(3)? != 0,
        canvas_state: canvas_raw.and_then(|raw| serde_json::from_str(&raw).ok()),
        message_count: row.get::<_, i64>(5)? as u32,
        last_model: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatMessage> {
    Ok(ChatMessage {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        user_id: row.get(2)?,
        role: row.get(3)?,
        content: row.get(4)?,
        model: row.get(5)?,
        tokens_in: row.get::<_, i64>(6)? as u32,
        tokens_out: row.get::<_, i64>(7)? as u32,
        task_id: row.get(8)?,
        created_at: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SessionStore {
        let conn = Connection::open_in_memory().expect("open");
        SessionStore::new(conn, Arc::new(MemoryCache::new())).expect("store")
    }

    fn message(chat_id: &str, user_id: &str, role: &str, content: &str) -> NewMessage {
        NewMessage {
            chat_id: chat_id.to_string(),
            user_id: user_id.to_string(),
            role: role.to_string(),
            content: content.to_string(),
            model: Some("Saptiva Cortex".to_string()),
            tokens_in: 10,
            tokens_out: 20,
            task_id: None,
        }
    }

    #[test]
    fn create_and_list_sessions() {
        let store = store();
        let a = store.create_session("u-1", Some("primera")).expect("create");
        let _b = store.create_session("u-1", Some("segunda")).expect("create");
        let _other = store.create_session("u-2", None).expect("create");

        let page = store.get_sessions("u-1", 10, 0, None, None).expect("list");
        assert_eq!(page.total_count, 2);
        assert!(!page.has_more);

        // Pinned sessions float to the top.
        store
            .update_session(
                &a.id,
                "u-1",
                &SessionPatch {
                    title: None,
                    pinned: Some(true),
                },
            )
            .expect("pin");
        let page = store.get_sessions("u-1", 10, 0, None, None).expect("list");
        assert_eq!(page.sessions[0].id, a.id);
    }

    #[test]
    fn search_filters_by_title() {
        let store = store();
        store.create_session("u-1", Some("presupuesto anual")).expect("create");
        store.create_session("u-1", Some("notas")).expect("create");
        let page = store
            .get_sessions("u-1", 10, 0, Some("presupuesto"), None)
            .expect("list");
        assert_eq!(page.total_count, 1);
    }

    #[test]
    fn pagination_has_more() {
        let store = store();
        for i in 0..5 {
            store.create_session("u-1", Some(&format!("s{i}"))).expect("create");
        }
        let page = store.get_sessions("u-1", 2, 0, None, None).expect("list");
        assert_eq!(page.sessions.len(), 2);
        assert_eq!(page.total_count, 5);
        assert!(page.has_more);

        let last = store.get_sessions("u-1", 2, 4, None, None).expect("list");
        assert_eq!(last.sessions.len(), 1);
        assert!(!last.has_more);
    }

    #[test]
    fn messages_newest_first_with_filters() {
        let store = store();
        let session = store.create_session("u-1", None).expect("create");
        store.append_message(&message(&session.id, "u-1", "user", "hola")).expect("append");
        store.append_message(&message(&session.id, "u-1", "assistant", "¿en qué ayudo?")).expect("append");
        store.append_message(&message(&session.id, "u-1", "system", "interno")).expect("append");

        let messages = store
            .get_messages(&session.id, "u-1", 10, 0, false, None)
            .expect("messages");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "assistant");

        let with_system = store
            .get_messages(&session.id, "u-1", 10, 0, true, None)
            .expect("messages");
        assert_eq!(with_system.len(), 3);

        let only_user = store
            .get_messages(&session.id, "u-1", 10, 0, true, Some("user"))
            .expect("messages");
        assert_eq!(only_user.len(), 1);
    }

    #[test]
    fn ownership_checks_everywhere() {
        let store = store();
        let session = store.create_session("owner", None).expect("create");

        assert!(matches!(
            store.get_messages(&session.id, "intruder", 10, 0, false, None),
            Err(SessionError::PermissionDenied { .. })
        ));
        assert!(matches!(
            store.delete_session(&session.id, "intruder"),
            Err(SessionError::PermissionDenied { .. })
        ));
        assert!(matches!(
            store.get_canvas_state(&session.id, "intruder"),
            Err(SessionError::PermissionDenied { .. })
        ));
        assert!(matches!(
            store.append_message(&message(&session.id, "intruder", "user", "x")),
            Err(SessionError::PermissionDenied { .. })
        ));
    }

    #[test]
    fn delete_cascades_messages() {
        let store = store();
        let session = store.create_session("u-1", None).expect("create");
        store.append_message(&message(&session.id, "u-1", "user", "hola")).expect("append");
        store.delete_session(&session.id, "u-1").expect("delete");
        assert!(store.get_session(&session.id).expect("get").is_none());
        assert!(matches!(
            store.get_messages(&session.id, "u-1", 10, 0, false, None),
            Err(SessionError::NotFound { .. })
        ));
    }

    #[test]
    fn canvas_patch_merges_shallowly() {
        let store = store();
        let session = store.create_session("u-1", None).expect("create");
        store
            .patch_canvas_state(&session.id, "u-1", serde_json::json!({"panel": "open", "zoom": 1}))
            .expect("patch");
        let merged = store
            .patch_canvas_state(&session.id, "u-1", serde_json::json!({"zoom": 2}))
            .expect("patch");
        assert_eq!(merged["panel"], "open");
        assert_eq!(merged["zoom"], 2);

        let stored = store.get_canvas_state(&session.id, "u-1").expect("get");
        assert_eq!(stored.expect("state")["zoom"], 2);
    }

    #[test]
    fn export_formats() {
        let store = store();
        let session = store.create_session("u-1", None).expect("create");
        store.append_message(&message(&session.id, "u-1", "user", "hola, mundo")).expect("append");
        store.append_message(&message(&session.id, "u-1", "assistant", "respuesta")).expect("append");

        let json_out = store
            .export(&session.id, "u-1", ExportFormat::Json, false)
            .expect("json");
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&json_out).expect("parse");
        assert_eq!(parsed[0]["role"], "user"); // oldest first

        let csv_out = store
            .export(&session.id, "u-1", ExportFormat::Csv, true)
            .expect("csv");
        assert!(csv_out.starts_with("created_at,role"));
        assert!(csv_out.contains("\"hola, mundo\""));

        let txt_out = store
            .export(&session.id, "u-1", ExportFormat::Txt, false)
            .expect("txt");
        assert!(txt_out.contains("[user]\nhola, mundo"));
    }

    #[test]
    fn append_bumps_session_stats() {
        let store = store();
        let session = store.create_session("u-1", None).expect("create");
        store.append_message(&message(&session.id, "u-1", "user", "hola")).expect("append");
        let refreshed = store.get_session(&session.id).expect("get").expect("some");
        assert_eq!(refreshed.message_count, 1);
        assert_eq!(refreshed.last_model.as_deref(), Some("Saptiva Cortex"));
    }
}
