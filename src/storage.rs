use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    Pool, QueryBuilder, Row, Sqlite,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteRow, SqliteSynchronous},
};
use uuid::Uuid;

use crate::session::{ChatMessage, MessageQuery, NewSession, Role, Session, SessionType, ToolEvent};
use crate::settings::SessionSettings;

/// Durable storage for sessions and their ordered history.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn create_session(&self, new: NewSession) -> anyhow::Result<Session>;
    async fn get_session(&self, id: &str) -> anyhow::Result<Option<Session>>;
    async fn list_sessions(&self, include_inactive: bool) -> anyhow::Result<Vec<Session>>;
    async fn update_last_active(&self, id: &str) -> anyhow::Result<()>;
    async fn update_settings(&self, id: &str, settings: &SessionSettings) -> anyhow::Result<()>;
    async fn update_session_type(&self, id: &str, session_type: SessionType) -> anyhow::Result<()>;
    async fn append_message(&self, id: &str, role: Role, content: &str) -> anyhow::Result<ChatMessage>;
    async fn query_messages(&self, id: &str, query: &MessageQuery) -> anyhow::Result<Vec<ChatMessage>>;
    async fn append_tool_event(&self, id: &str, ev: &ToolEvent) -> anyhow::Result<()>;
    async fn list_tool_events(&self, id: &str) -> anyhow::Result<Vec<ToolEvent>>;
    /// Soft delete: flips `is_active` and keeps the history.
    async fn deactivate_session(&self, id: &str) -> anyhow::Result<bool>;
    /// Hard delete: removes the row together with its messages and tool events.
    async fn delete_session_permanently(&self, id: &str) -> anyhow::Result<bool>;
}

#[derive(Clone)]
pub struct SqliteSessionRepository {
    pool: Pool<Sqlite>,
}

impl SqliteSessionRepository {
    pub async fn initialize(database_url: Option<String>) -> anyhow::Result<Self> {
        let url = match database_url {
            Some(u) => u,
            None => resolve_default_db_url()?,
        };
        let options = url
            .parse::<SqliteConnectOptions>()?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);
        let pool = Pool::<Sqlite>::connect_with(options).await?;
        sqlx::query("PRAGMA busy_timeout = 5000;").execute(&pool).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    #[cfg(test)]
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

fn resolve_default_db_url() -> anyhow::Result<String> {
    let base = std::env::var("XDG_DATA_HOME")
        .ok()
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
            PathBuf::from(home).join(".local").join("share")
        });
    let dir = base.join("parley");
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("parley.db");
    Ok(format!("sqlite://{}", path.to_string_lossy()))
}

// Fixed-width UTC text so that string order equals time order.
fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

fn row_to_session(r: &SqliteRow) -> anyhow::Result<Session> {
    let session_type: String = r.try_get("session_type")?;
    let settings_json: String = r.try_get("settings_json")?;
    let created_at: String = r.try_get("created_at")?;
    let last_active: String = r.try_get("last_active")?;
    let is_active: i64 = r.try_get("is_active")?;
    Ok(Session {
        session_id: r.try_get("id")?,
        model_name: r.try_get("model_name")?,
        session_type: session_type.parse()?,
        agent: r.try_get("agent")?,
        system_message: r.try_get("system_message")?,
        settings: serde_json::from_str(&settings_json)?,
        created_at: parse_ts(&created_at)?,
        last_active: parse_ts(&last_active)?,
        is_active: is_active != 0,
    })
}

fn row_to_message(r: &SqliteRow) -> anyhow::Result<ChatMessage> {
    let role: String = r.try_get("role")?;
    let created_at: String = r.try_get("created_at")?;
    Ok(ChatMessage {
        id: r.try_get("id")?,
        session_id: r.try_get("session_id")?,
        role: role.parse()?,
        content: r.try_get("content")?,
        timestamp: parse_ts(&created_at)?,
    })
}

const SESSION_COLUMNS: &str = "id, model_name, session_type, agent, system_message, settings_json, created_at, last_active, is_active";

#[async_trait]
impl SessionRepository for SqliteSessionRepository {
    async fn create_session(&self, new: NewSession) -> anyhow::Result<Session> {
        let now = Utc::now();
        let settings_json = serde_json::to_string(&new.settings)?;
        sqlx::query(
            "INSERT INTO sessions (id, model_name, session_type, agent, system_message, settings_json, created_at, last_active, is_active) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, 1)",
        )
        .bind(&new.session_id)
        .bind(&new.model_name)
        .bind(new.session_type.as_str())
        .bind(&new.agent)
        .bind(&new.system_message)
        .bind(settings_json)
        .bind(format_ts(now))
        .execute(&self.pool)
        .await?;
        let stored = self
            .get_session(&new.session_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("session {} vanished after insert", new.session_id))?;
        Ok(stored)
    }

    async fn get_session(&self, id: &str) -> anyhow::Result<Option<Session>> {
        let row = sqlx::query(&format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_session).transpose()
    }

    async fn list_sessions(&self, include_inactive: bool) -> anyhow::Result<Vec<Session>> {
        let sql = if include_inactive {
            format!("SELECT {SESSION_COLUMNS} FROM sessions ORDER BY last_active DESC")
        } else {
            format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE is_active = 1 ORDER BY last_active DESC")
        };
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_session).collect()
    }

    async fn update_last_active(&self, id: &str) -> anyhow::Result<()> {
        sqlx::query("UPDATE sessions SET last_active = ?1 WHERE id = ?2")
            .bind(format_ts(Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_settings(&self, id: &str, settings: &SessionSettings) -> anyhow::Result<()> {
        let settings_json = serde_json::to_string(settings)?;
        sqlx::query("UPDATE sessions SET settings_json = ?1 WHERE id = ?2")
            .bind(settings_json)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_session_type(&self, id: &str, session_type: SessionType) -> anyhow::Result<()> {
        sqlx::query("UPDATE sessions SET session_type = ?1 WHERE id = ?2")
            .bind(session_type.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn append_message(&self, id: &str, role: Role, content: &str) -> anyhow::Result<ChatMessage> {
        let mut tx = self.pool.begin().await?;
        let last: Option<String> = sqlx::query_scalar(
            "SELECT created_at FROM messages WHERE session_id = ?1 ORDER BY seq DESC LIMIT 1",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        let mut timestamp = Utc::now();
        if let Some(prev) = last.as_deref().map(parse_ts).transpose()? {
            timestamp = timestamp.max(prev);
        }
        let msg = ChatMessage {
            id: Uuid::new_v4().to_string(),
            session_id: id.to_string(),
            role,
            content: content.to_string(),
            timestamp,
        };
        sqlx::query("INSERT INTO messages (id, session_id, role, content, created_at) VALUES (?1, ?2, ?3, ?4, ?5)")
            .bind(&msg.id)
            .bind(id)
            .bind(role.as_str())
            .bind(content)
            .bind(format_ts(timestamp))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(msg)
    }

    async fn query_messages(&self, id: &str, query: &MessageQuery) -> anyhow::Result<Vec<ChatMessage>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, session_id, role, content, created_at FROM messages WHERE session_id = ",
        );
        qb.push_bind(id.to_string());
        if let Some(role) = query.role {
            qb.push(" AND role = ").push_bind(role.as_str());
        }
        if let Some(since) = query.since {
            qb.push(" AND created_at >= ").push_bind(format_ts(since));
        }
        if let Some(until) = query.until {
            qb.push(" AND created_at <= ").push_bind(format_ts(until));
        }
        qb.push(" ORDER BY seq ASC");
        match (query.limit, query.offset) {
            (Some(limit), offset) => {
                qb.push(" LIMIT ").push_bind(i64::from(limit));
                qb.push(" OFFSET ").push_bind(i64::from(offset.unwrap_or(0)));
            }
            (None, Some(offset)) => {
                qb.push(" LIMIT -1 OFFSET ").push_bind(i64::from(offset));
            }
            (None, None) => {}
        }
        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_message).collect()
    }

    async fn append_tool_event(&self, id: &str, ev: &ToolEvent) -> anyhow::Result<()> {
        sqlx::query("INSERT INTO tool_events (id, session_id, tool, arguments_json, result, status, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)")
            .bind(&ev.id)
            .bind(id)
            .bind(&ev.tool)
            .bind(serde_json::to_string(&ev.arguments)?)
            .bind(&ev.result)
            .bind(&ev.status)
            .bind(format_ts(ev.created_at))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_tool_events(&self, id: &str) -> anyhow::Result<Vec<ToolEvent>> {
        let rows = sqlx::query("SELECT id, tool, arguments_json, result, status, created_at FROM tool_events WHERE session_id = ?1 ORDER BY seq ASC")
            .bind(id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|t| {
                let arguments_json: String = t.try_get("arguments_json")?;
                let created_at: String = t.try_get("created_at")?;
                Ok(ToolEvent {
                    id: t.try_get("id")?,
                    tool: t.try_get("tool")?,
                    arguments: serde_json::from_str(&arguments_json)?,
                    result: t.try_get("result")?,
                    status: t.try_get("status")?,
                    created_at: parse_ts(&created_at)?,
                })
            })
            .collect()
    }

    async fn deactivate_session(&self, id: &str) -> anyhow::Result<bool> {
        let res = sqlx::query("UPDATE sessions SET is_active = 0 WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn delete_session_permanently(&self, id: &str) -> anyhow::Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM messages WHERE session_id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM tool_events WHERE session_id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let res = sqlx::query("DELETE FROM sessions WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(res.rows_affected() > 0)
    }
}

#[cfg(test)]
pub(crate) async fn test_repository(dir: &tempfile::TempDir) -> SqliteSessionRepository {
    let path = dir.path().join("test.db");
    let url = format!("sqlite://{}", path.to_string_lossy());
    SqliteSessionRepository::initialize(Some(url)).await.unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn create_get_list_and_hard_delete_session() {
        let dir = tempdir().unwrap();
        let repo = test_repository(&dir).await;

        let created = repo.create_session(NewSession::new("llama3.2", "chatbot")).await.unwrap();
        assert_eq!(created.session_type, SessionType::Chatbot);
        assert!(created.is_active);
        assert!(created.system_message.is_none());

        let list = repo.list_sessions(false).await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].session_id, created.session_id);

        repo.append_message(&created.session_id, Role::User, "hi").await.unwrap();
        assert!(repo.delete_session_permanently(&created.session_id).await.unwrap());
        assert!(repo.get_session(&created.session_id).await.unwrap().is_none());
        let msgs = repo
            .query_messages(&created.session_id, &MessageQuery::default())
            .await
            .unwrap();
        assert!(msgs.is_empty());
        assert!(!repo.delete_session_permanently(&created.session_id).await.unwrap());
    }

    #[tokio::test]
    async fn soft_delete_keeps_history_and_hides_from_active_list() {
        let dir = tempdir().unwrap();
        let repo = test_repository(&dir).await;
        let s = repo.create_session(NewSession::new("llama3.2", "chatbot")).await.unwrap();
        repo.append_message(&s.session_id, Role::User, "keep me").await.unwrap();

        assert!(repo.deactivate_session(&s.session_id).await.unwrap());
        let got = repo.get_session(&s.session_id).await.unwrap().unwrap();
        assert!(!got.is_active);
        assert!(repo.list_sessions(false).await.unwrap().is_empty());
        assert_eq!(repo.list_sessions(true).await.unwrap().len(), 1);
        let msgs = repo.query_messages(&s.session_id, &MessageQuery::default()).await.unwrap();
        assert_eq!(msgs.len(), 1);
    }

    #[tokio::test]
    async fn history_is_ordered_with_non_decreasing_timestamps() {
        let dir = tempdir().unwrap();
        let repo = test_repository(&dir).await;
        let s = repo.create_session(NewSession::new("llama3.2", "chatbot")).await.unwrap();
        for i in 0..20 {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            repo.append_message(&s.session_id, role, &format!("m{i}")).await.unwrap();
        }
        let first = repo.query_messages(&s.session_id, &MessageQuery::default()).await.unwrap();
        assert_eq!(first.len(), 20);
        for pair in first.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
        let contents: Vec<_> = first.iter().map(|m| m.content.clone()).collect();
        assert_eq!(contents[0], "m0");
        assert_eq!(contents[19], "m19");

        repo.append_message(&s.session_id, Role::User, "later").await.unwrap();
        let second = repo.query_messages(&s.session_id, &MessageQuery::default()).await.unwrap();
        assert_eq!(&second[..20], &first[..]);
    }

    #[tokio::test]
    async fn query_filters_by_role_and_paginates() {
        let dir = tempdir().unwrap();
        let repo = test_repository(&dir).await;
        let s = repo.create_session(NewSession::new("llama3.2", "chatbot")).await.unwrap();
        for i in 0..6 {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            repo.append_message(&s.session_id, role, &format!("m{i}")).await.unwrap();
        }
        let users = repo
            .query_messages(&s.session_id, &MessageQuery { role: Some(Role::User), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(users.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(), ["m0", "m2", "m4"]);

        let page = repo
            .query_messages(&s.session_id, &MessageQuery { limit: Some(2), offset: Some(1), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(page.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(), ["m1", "m2"]);

        let tail = repo
            .query_messages(&s.session_id, &MessageQuery { offset: Some(5), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(tail.len(), 1);

        let future = repo
            .query_messages(
                &s.session_id,
                &MessageQuery { since: Some(Utc::now() + chrono::Duration::hours(1)), ..Default::default() },
            )
            .await
            .unwrap();
        assert!(future.is_empty());
    }

    #[tokio::test]
    async fn settings_type_and_tool_events_roundtrip() {
        let dir = tempdir().unwrap();
        let repo = test_repository(&dir).await;
        let s = repo.create_session(NewSession::new("llama3.2", "tool_agent")).await.unwrap();

        let mut settings = SessionSettings::default();
        settings.retrieval_top_k = Some(2);
        repo.update_settings(&s.session_id, &settings).await.unwrap();
        repo.update_session_type(&s.session_id, SessionType::ToolClient).await.unwrap();

        let ev = ToolEvent {
            id: Uuid::new_v4().to_string(),
            tool: "echo".into(),
            arguments: serde_json::json!({"x": 1}),
            result: "1".into(),
            status: "ok".into(),
            created_at: Utc::now(),
        };
        repo.append_tool_event(&s.session_id, &ev).await.unwrap();

        let got = repo.get_session(&s.session_id).await.unwrap().unwrap();
        assert_eq!(got.settings.retrieval_top_k, Some(2));
        assert_eq!(got.session_type, SessionType::ToolClient);
        let events = repo.list_tool_events(&s.session_id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].arguments, serde_json::json!({"x": 1}));
    }

    #[tokio::test]
    async fn pragmas_and_migrations_applied() {
        let dir = tempdir().unwrap();
        let repo = test_repository(&dir).await;

        let row = sqlx::query("PRAGMA journal_mode;").fetch_one(repo.pool()).await.unwrap();
        let mode: String = row.get(0);
        assert!(mode.eq_ignore_ascii_case("wal"), "journal_mode should be WAL, got {}", mode);

        let row = sqlx::query("PRAGMA busy_timeout;").fetch_one(repo.pool()).await.unwrap();
        let timeout: i64 = row.get(0);
        assert!(timeout >= 5000, "busy_timeout should be at least 5000, got {}", timeout);

        // re-running initialize on the same file must be a no-op for migrations
        let _again = test_repository(&dir).await;
    }
}
