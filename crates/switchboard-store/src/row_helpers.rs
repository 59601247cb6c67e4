use chrono::{DateTime, Utc};

use crate::error::StoreError;

/// Get a column value from a row, returning CorruptRow on failure.
pub fn get<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Parse a JSON text column.
pub fn parse_json(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<serde_json::Value, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: format!("invalid JSON: {e}"),
    })
}

/// Parse an RFC 3339 timestamp column.
pub fn parse_time(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::CorruptRow {
            table,
            column,
            detail: format!("invalid timestamp: {e}"),
        })
}

pub fn parse_time_opt(
    raw: Option<String>,
    table: &'static str,
    column: &'static str,
) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.map(|s| parse_time(&s, table, column)).transpose()
}

/// Parse a `Display`/`FromStr` enum column.
pub fn parse_enum<T>(raw: &str, table: &'static str, column: &'static str) -> Result<T, StoreError>
where
    T: std::str::FromStr<Err = String>,
{
    raw.parse().map_err(|detail| StoreError::CorruptRow {
        table,
        column,
        detail,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_core::SessionStatus;

    #[test]
    fn parse_time_roundtrip() {
        let now = Utc::now();
        let parsed = parse_time(&now.to_rfc3339(), "sessions", "created_at").unwrap();
        assert_eq!(parsed, now);
    }

    #[test]
    fn parse_time_rejects_garbage() {
        let err = parse_time("yesterday", "sessions", "last_seen").unwrap_err();
        assert!(err.to_string().contains("sessions.last_seen"), "got: {err}");
    }

    #[test]
    fn parse_enum_status() {
        let s: SessionStatus = parse_enum("QR_REQUIRED", "sessions", "status").unwrap();
        assert_eq!(s, SessionStatus::QrRequired);
        assert!(parse_enum::<SessionStatus>("nope", "sessions", "status").is_err());
    }

    #[test]
    fn parse_json_rejects_garbage() {
        assert!(parse_json("{", "messages", "content").is_err());
        assert_eq!(parse_json("[]", "chat_groups", "participants").unwrap(), serde_json::json!([]));
    }
}
