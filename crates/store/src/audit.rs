//! The append-only audit log. Every mutating operation records what it
//! did; nothing ever deletes from here.

use crate::error::Error;
use crate::sql::time_to_sql;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub time: DateTime<Utc>,
    pub kind: String,
    pub body: serde_json::Value,
}

pub(crate) fn append(
    conn: &Connection,
    kind: &str,
    body: serde_json::Value,
) -> Result<(), Error> {
    conn.prepare_cached("INSERT INTO logs (time, kind, body) VALUES (?1, ?2, ?3)")?
        .execute(params![time_to_sql(&Utc::now()), kind, body.to_string()])?;
    Ok(())
}

pub(crate) fn list(conn: &Connection) -> Result<Vec<AuditEntry>, Error> {
    let mut stmt =
        conn.prepare_cached("SELECT time, kind, body FROM logs ORDER BY id")?;
    let entries = stmt
        .query_map([], |row| {
            let time: String = row.get(0)?;
            let kind: String = row.get(1)?;
            let body: String = row.get(2)?;
            Ok((time, kind, body))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    entries
        .into_iter()
        .map(|(time, kind, body)| {
            Ok(AuditEntry {
                time: DateTime::parse_from_rfc3339(&time)
                    .map_err(|err| {
                        Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, err))
                    })?
                    .with_timezone(&Utc),
                kind,
                body: serde_json::from_str(&body)?,
            })
        })
        .collect()
}
