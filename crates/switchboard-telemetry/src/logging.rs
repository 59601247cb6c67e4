//! Persisted WARN/ERROR records, keyed by session.
//!
//! Failures that never reach a caller (dropped geocodes, webhook errors,
//! reconnect failures) end up here so an operator can pull the trail for one
//! session after the fact.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

const CREATE_LOGS: &str = "CREATE TABLE IF NOT EXISTS logs (
     id INTEGER PRIMARY KEY AUTOINCREMENT,
     timestamp TEXT NOT NULL,
     level TEXT NOT NULL,
     target TEXT NOT NULL,
     message TEXT NOT NULL,
     fields TEXT,
     session_id TEXT
 );
 CREATE INDEX IF NOT EXISTS idx_logs_level ON logs(level);
 CREATE INDEX IF NOT EXISTS idx_logs_session ON logs(session_id);
 CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp);";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: Option<String>,
    pub session_id: Option<String>,
}

/// Filters for [`SqliteLogSink::query`]. Results are newest first.
#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    pub level: Option<String>,
    /// Substring match on the event target.
    pub target: Option<String>,
    pub session_id: Option<String>,
    /// RFC 3339 lower bound, inclusive.
    pub since: Option<String>,
    pub limit: Option<u32>,
}

pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        conn.execute_batch(CREATE_LOGS)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CREATE_LOGS)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn insert(&self, record: &LogInsert) {
        let conn = self.conn.lock();
        // A failed log write must not surface as a new event.
        let _ = conn.execute(
            "INSERT INTO logs (timestamp, level, target, message, fields, session_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                record.timestamp,
                record.level,
                record.target,
                record.message,
                record.fields,
                record.session_id,
            ],
        );
    }

    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut sql = String::from(
            "SELECT id, timestamp, level, target, message, fields, session_id FROM logs WHERE 1=1",
        );
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(level) = &q.level {
            sql.push_str(&format!(" AND level = ?{}", params.len() + 1));
            params.push(Box::new(level.to_uppercase()));
        }
        if let Some(target) = &q.target {
            sql.push_str(&format!(" AND target LIKE ?{}", params.len() + 1));
            params.push(Box::new(format!("%{target}%")));
        }
        if let Some(session_id) = &q.session_id {
            sql.push_str(&format!(" AND session_id = ?{}", params.len() + 1));
            params.push(Box::new(session_id.clone()));
        }
        if let Some(since) = &q.since {
            sql.push_str(&format!(" AND timestamp >= ?{}", params.len() + 1));
            params.push(Box::new(since.clone()));
        }

        let limit = q.limit.unwrap_or(100);
        sql.push_str(&format!(" ORDER BY id DESC LIMIT {limit}"));

        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            params.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(param_refs.as_slice(), |row| {
            Ok(LogRecord {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                level: row.get(2)?,
                target: row.get(3)?,
                message: row.get(4)?,
                fields: row.get(5)?,
                session_id: row.get(6)?,
            })
        })?;

        rows.collect()
    }

    /// Most recent persisted records for one session.
    pub fn session_trail(&self, session_id: &str, limit: u32) -> Result<Vec<LogRecord>, rusqlite::Error> {
        self.query(&LogQuery {
            session_id: Some(session_id.to_string()),
            limit: Some(limit),
            ..Default::default()
        })
    }

    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))
    }
}

struct LogInsert {
    timestamp: String,
    level: String,
    target: String,
    message: String,
    fields: Option<String>,
    session_id: Option<String>,
}

/// tracing Layer that writes warn+ events to SQLite.
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
    session_id: Option<String>,
}

impl FieldVisitor {
    fn put(&mut self, field: &Field, value: serde_json::Value) {
        let _ = self.fields.insert(field.name().to_string(), value);
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let val = format!("{value:?}");
        match field.name() {
            "message" => self.message = Some(val),
            "session_id" => self.session_id = Some(val.trim_matches('"').to_string()),
            _ => self.put(field, serde_json::Value::String(val)),
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = Some(value.to_string()),
            "session_id" => self.session_id = Some(value.to_string()),
            _ => self.put(field, serde_json::Value::String(value.to_string())),
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.put(field, serde_json::Value::Number(n));
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, value.into());
    }
}

/// Stored on spans so child events inherit the session id.
struct SpanSession(String);

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > tracing::Level::WARN {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        if visitor.session_id.is_none() {
            if let Some(scope) = ctx.event_scope(event) {
                for span in scope {
                    if let Some(SpanSession(id)) = span.extensions().get::<SpanSession>() {
                        visitor.session_id = Some(id.clone());
                        break;
                    }
                }
            }
        }

        let fields = (!visitor.fields.is_empty())
            .then(|| serde_json::to_string(&visitor.fields).ok())
            .flatten();

        self.sink.insert(&LogInsert {
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string().to_uppercase(),
            target: event.metadata().target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields,
            session_id: visitor.session_id,
        });
    }

    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);

        if let (Some(session_id), Some(span)) = (visitor.session_id, ctx.span(id)) {
            span.extensions_mut().insert(SpanSession(session_id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    fn insert(sink: &SqliteLogSink, level: &str, message: &str, session: Option<&str>) {
        sink.insert(&LogInsert {
            timestamp: Utc::now().to_rfc3339(),
            level: level.into(),
            target: "switchboard_engine::reconciler".into(),
            message: message.into(),
            fields: None,
            session_id: session.map(str::to_string),
        });
    }

    #[test]
    fn file_sink_creates_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/logs.db");
        let sink = SqliteLogSink::new(&path).unwrap();
        insert(&sink, "WARN", "geocode failed", Some("s1"));
        assert!(path.exists());
        assert_eq!(sink.count().unwrap(), 1);
    }

    #[test]
    fn query_by_level() {
        let sink = SqliteLogSink::in_memory().unwrap();
        insert(&sink, "WARN", "warning msg", None);
        insert(&sink, "ERROR", "error msg", None);

        let results = sink
            .query(&LogQuery {
                level: Some("error".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].message, "error msg");
    }

    #[test]
    fn session_trail_is_scoped_and_newest_first() {
        let sink = SqliteLogSink::in_memory().unwrap();
        insert(&sink, "WARN", "first", Some("s1"));
        insert(&sink, "WARN", "other", Some("s2"));
        insert(&sink, "ERROR", "second", Some("s1"));

        let trail = sink.session_trail("s1", 10).unwrap();
        let messages: Vec<_> = trail.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["second", "first"]);
    }

    #[test]
    fn query_by_target_substring_and_limit() {
        let sink = SqliteLogSink::in_memory().unwrap();
        for i in 0..5 {
            insert(&sink, "WARN", &format!("m{i}"), None);
        }
        let results = sink
            .query(&LogQuery {
                target: Some("reconciler".into()),
                limit: Some(2),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].message, "m4");
    }

    #[test]
    fn layer_persists_warn_and_skips_info() {
        let sink = Arc::new(SqliteLogSink::in_memory().unwrap());
        let subscriber =
            tracing_subscriber::registry().with(SqliteLogLayer::new(sink.clone()));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(session_id = "s1", "routine");
            tracing::warn!(session_id = "s1", attempt = 2u64, "reconnect failed");
        });

        let records = sink.query(&LogQuery::default()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].level, "WARN");
        assert_eq!(records[0].session_id.as_deref(), Some("s1"));
        assert_eq!(records[0].fields.as_deref(), Some(r#"{"attempt":2}"#));
    }

    #[test]
    fn layer_inherits_session_from_span() {
        let sink = Arc::new(SqliteLogSink::in_memory().unwrap());
        let subscriber =
            tracing_subscriber::registry().with(SqliteLogLayer::new(sink.clone()));

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("pump", session_id = "s9");
            let _enter = span.enter();
            tracing::error!("stream ended unexpectedly");
        });

        let trail = sink.session_trail("s9", 10).unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].message, "stream ended unexpectedly");
    }
}
