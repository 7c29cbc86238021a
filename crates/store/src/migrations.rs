//! Startup schema migrations. Each migration has a stable name and an
//! idempotent function; executed names are recorded in the `migrations`
//! table, where `INSERT OR IGNORE` provides the commutative add-to-set
//! concurrent starters rely on. Obsolete migrations stay listed as
//! name-only stubs forever so old databases are never mistaken for
//! corrupt ones.

use crate::error::Error;
use crate::sql::time_to_sql;
use charmurl::CharmUrl;
use chrono::Utc;
use rusqlite::{params, Connection};
use std::collections::BTreeSet;
use std::io::Cursor;

pub(crate) struct MigrationCtx<'a> {
    pub conn: &'a Connection,
    pub blobs: &'a blobstore::Store,
}

type MigrationFn = fn(&MigrationCtx) -> Result<(), Error>;

pub(crate) struct Migration {
    pub name: &'static str,
    /// None marks an obsolete migration kept only so its name stays
    /// known.
    pub run: Option<MigrationFn>,
}

pub(crate) const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "initial-collections",
        run: Some(initial_collections),
    },
    Migration {
        name: "entity-ids-denormalization",
        run: Some(denormalize_entity_ids),
    },
    Migration {
        name: "base-entities",
        run: Some(create_base_entities),
    },
    Migration {
        name: "add-supported-series",
        run: Some(add_supported_series),
    },
    Migration {
        name: "add-development",
        run: Some(add_development),
    },
    Migration {
        name: "fix-promulgated-url-channels",
        run: Some(fix_promulgated_urls),
    },
    Migration {
        name: "dedupe-promulgated-bases",
        run: Some(dedupe_promulgated_bases),
    },
    Migration {
        name: "add-pre-v5-compat-blobs",
        run: Some(add_compat_blobs),
    },
    // Superseded by computing the secondary hash at upload time.
    Migration {
        name: "content-hash-256",
        run: None,
    },
];

/// Run every pending migration in declared order. Safe to call from any
/// number of concurrent starters: functions are idempotent and tolerate
/// partial application by a peer, and the executed-set write commutes.
pub(crate) fn run(conn: &Connection, blobs: &blobstore::Store) -> Result<(), Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS migrations (\
             name TEXT PRIMARY KEY, \
             executed_at TEXT NOT NULL);",
    )?;

    let executed: BTreeSet<String> = conn
        .prepare("SELECT name FROM migrations")?
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;

    let known: BTreeSet<&str> = MIGRATIONS.iter().map(|m| m.name).collect();
    if let Some(unknown) = executed.iter().find(|name| !known.contains(name.as_str())) {
        return Err(Error::UnknownMigration(unknown.clone()));
    }

    let ctx = MigrationCtx { conn, blobs };
    for migration in MIGRATIONS {
        if executed.contains(migration.name) {
            continue;
        }
        let Some(run) = migration.run else {
            continue;
        };
        run(&ctx).map_err(|err| Error::MigrationFailed {
            name: migration.name.to_string(),
            message: err.to_string(),
        })?;
        conn.execute(
            "INSERT OR IGNORE INTO migrations (name, executed_at) VALUES (?1, ?2)",
            params![migration.name, time_to_sql(&Utc::now())],
        )?;
        tracing::info!(name = migration.name, "migration executed");
    }
    Ok(())
}

// ALTER TABLE ADD COLUMN cannot be made conditional, so a re-run (or a
// concurrent peer) surfaces as a duplicate-column error to swallow.
fn add_column(conn: &Connection, table: &str, definition: &str) -> Result<(), Error> {
    match conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {definition};")) {
        Ok(()) => Ok(()),
        Err(err) if err.to_string().contains("duplicate column name") => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn initial_collections(ctx: &MigrationCtx) -> Result<(), Error> {
    ctx.conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS entities (\
             url TEXT PRIMARY KEY, \
             kind TEXT NOT NULL, \
             blob_hash TEXT NOT NULL, \
             blob_hash_256 TEXT NOT NULL DEFAULT '', \
             blob_size INTEGER NOT NULL, \
             blob_name TEXT NOT NULL, \
             upload_time TEXT NOT NULL, \
             promulgated_url TEXT, \
             promulgated_revision INTEGER NOT NULL DEFAULT -1, \
             stable INTEGER NOT NULL DEFAULT 0, \
             charm_meta TEXT, \
             charm_config TEXT, \
             charm_actions TEXT, \
             provided_interfaces TEXT NOT NULL DEFAULT '[]', \
             required_interfaces TEXT NOT NULL DEFAULT '[]', \
             bundle_data TEXT, \
             bundle_charms TEXT, \
             bundle_machine_count INTEGER, \
             bundle_unit_count INTEGER, \
             extra_info TEXT NOT NULL DEFAULT '{}', \
             contents TEXT NOT NULL DEFAULT '{}'); \
         CREATE TABLE IF NOT EXISTS logs (\
             id INTEGER PRIMARY KEY AUTOINCREMENT, \
             time TEXT NOT NULL, \
             kind TEXT NOT NULL, \
             body TEXT NOT NULL);",
    )?;
    Ok(())
}

fn denormalize_entity_ids(ctx: &MigrationCtx) -> Result<(), Error> {
    for definition in [
        "username TEXT",
        "name TEXT",
        "revision INTEGER",
        "series TEXT",
        "base_url TEXT",
    ] {
        add_column(ctx.conn, "entities", definition)?;
    }

    let urls: Vec<String> = ctx
        .conn
        .prepare("SELECT url FROM entities")?
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;
    for url in urls {
        let parsed: CharmUrl = url.parse()?;
        ctx.conn.execute(
            "UPDATE entities SET username = ?2, name = ?3, revision = ?4, series = ?5, \
                 base_url = ?6 WHERE url = ?1",
            params![
                url,
                parsed.user,
                parsed.name,
                parsed.revision,
                parsed.series,
                parsed.base().to_string(),
            ],
        )?;
    }

    ctx.conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_entities_base_url ON entities (base_url); \
         CREATE INDEX IF NOT EXISTS idx_entities_name ON entities (name); \
         CREATE INDEX IF NOT EXISTS idx_entities_promulgated_url ON entities (promulgated_url); \
         CREATE INDEX IF NOT EXISTS idx_entities_upload_time ON entities (upload_time);",
    )?;
    Ok(())
}

fn create_base_entities(ctx: &MigrationCtx) -> Result<(), Error> {
    ctx.conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS base_entities (\
             base_url TEXT PRIMARY KEY, \
             username TEXT NOT NULL, \
             name TEXT NOT NULL, \
             promulgated INTEGER NOT NULL DEFAULT 0, \
             acls TEXT NOT NULL DEFAULT '{}'); \
         CREATE INDEX IF NOT EXISTS idx_base_entities_name ON base_entities (name); \
         CREATE INDEX IF NOT EXISTS idx_base_entities_promulgated \
             ON base_entities (name) WHERE promulgated = 1;",
    )?;

    // One base per (user, name) seen among entities, with the era's
    // single owner-only ACL shape. Multiple promulgated bases per name
    // can result here; the dedupe migration below restores uniqueness.
    ctx.conn.execute_batch(
        "INSERT OR IGNORE INTO base_entities (base_url, username, name, promulgated, acls) \
         SELECT DISTINCT e.base_url, e.username, e.name, \
             EXISTS (SELECT 1 FROM entities p \
                     WHERE p.base_url = e.base_url AND p.promulgated_url IS NOT NULL), \
             json_object('read', json_array(e.username), 'write', json_array(e.username)) \
         FROM entities e WHERE e.base_url IS NOT NULL;",
    )?;
    Ok(())
}

fn add_supported_series(ctx: &MigrationCtx) -> Result<(), Error> {
    add_column(ctx.conn, "entities", "supported_series TEXT NOT NULL DEFAULT '[]'")?;
    ctx.conn.execute_batch(
        "UPDATE entities SET supported_series = CASE \
             WHEN kind = 'bundle' THEN '[]' \
             WHEN series IS NOT NULL AND series <> '' THEN json_array(series) \
             ELSE COALESCE(json_extract(charm_meta, '$.series'), '[]') END;",
    )?;
    Ok(())
}

fn add_development(ctx: &MigrationCtx) -> Result<(), Error> {
    add_column(ctx.conn, "entities", "development INTEGER NOT NULL DEFAULT 0")?;
    add_column(
        ctx.conn,
        "base_entities",
        "channel_current TEXT NOT NULL DEFAULT '{}'",
    )?;

    // Rewrite single {read, write} ACL documents into the per-channel
    // shape, preserving already-converted rows.
    let rows: Vec<(String, String)> = ctx
        .conn
        .prepare("SELECT base_url, acls FROM base_entities")?
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<_>>()?;
    for (base_url, acls) in rows {
        let doc: serde_json::Value = serde_json::from_str(&acls)?;
        if !doc.get("read").map(|v| v.is_array()).unwrap_or(false) {
            continue;
        }
        let per_channel = serde_json::json!({
            "unpublished": doc,
            "development": doc,
            "stable": doc,
        });
        ctx.conn.execute(
            "UPDATE base_entities SET acls = ?2 WHERE base_url = ?1",
            params![base_url, per_channel.to_string()],
        )?;
    }
    Ok(())
}

fn fix_promulgated_urls(ctx: &MigrationCtx) -> Result<(), Error> {
    let rows: Vec<(String, String)> = ctx
        .conn
        .prepare(
            "SELECT url, promulgated_url FROM entities \
             WHERE promulgated_url LIKE '%development/%'",
        )?
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<_>>()?;
    for (url, promulgated) in rows {
        // Parsing strips the channel token; rendering restores the
        // canonical form.
        let normalized = CharmUrl::parse(&promulgated)?.url.to_string();
        ctx.conn.execute(
            "UPDATE entities SET promulgated_url = ?2 WHERE url = ?1",
            params![url, normalized],
        )?;
        tracing::debug!(%url, %promulgated, %normalized, "fixed promulgated url");
    }
    Ok(())
}

// Historical data holds names with several promulgated bases. Keep the
// lexicographically-lowest user; deterministic regardless of which
// starter runs it.
fn dedupe_promulgated_bases(ctx: &MigrationCtx) -> Result<(), Error> {
    let names: Vec<String> = ctx
        .conn
        .prepare(
            "SELECT name FROM base_entities WHERE promulgated = 1 \
             GROUP BY name HAVING COUNT(*) > 1",
        )?
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;
    for name in names {
        let cleared = ctx.conn.execute(
            "UPDATE base_entities SET promulgated = 0 \
             WHERE name = ?1 AND promulgated = 1 AND username <> \
                 (SELECT MIN(username) FROM base_entities \
                  WHERE name = ?1 AND promulgated = 1)",
            params![name],
        )?;
        tracing::info!(%name, cleared, "deduplicated promulgated bases");
    }
    Ok(())
}

fn add_compat_blobs(ctx: &MigrationCtx) -> Result<(), Error> {
    for definition in [
        "prev5_blob_hash TEXT NOT NULL DEFAULT ''",
        "prev5_blob_hash_256 TEXT NOT NULL DEFAULT ''",
        "prev5_blob_size INTEGER NOT NULL DEFAULT 0",
        "prev5_blob_name TEXT NOT NULL DEFAULT ''",
    ] {
        add_column(ctx.conn, "entities", definition)?;
    }

    // Restartable: rows with populated compat fields are skipped, so a
    // re-run never writes a second blob.
    let rows: Vec<(String, String, String, String)> = ctx
        .conn
        .prepare(
            "SELECT url, kind, series, blob_name FROM entities \
             WHERE prev5_blob_hash = ''",
        )?
        .query_map([], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })?
        .collect::<rusqlite::Result<_>>()?;

    for (url, kind, series, blob_name) in rows {
        if kind == "charm" && series.is_empty() {
            let (reader, _) = ctx.blobs.open(&blob_name).map_err(Error::from)?;
            let mut rewritten = Cursor::new(Vec::new());
            archive::rewrite_compat(reader, &mut rewritten)?;
            let rewritten = rewritten.into_inner();
            let put = ctx
                .blobs
                .put(
                    rewritten.as_slice(),
                    &blobstore::hash_of(&rewritten),
                    rewritten.len() as u64,
                )
                .map_err(Error::from)?;
            ctx.conn.execute(
                "UPDATE entities SET prev5_blob_hash = ?2, prev5_blob_hash_256 = ?3, \
                     prev5_blob_size = ?4, prev5_blob_name = ?5 WHERE url = ?1",
                params![url, put.hash, put.hash_256, put.size as i64, put.name],
            )?;
            tracing::info!(%url, "wrote pre-v5 compat blob");
        } else {
            ctx.conn.execute(
                "UPDATE entities SET prev5_blob_hash = blob_hash, \
                     prev5_blob_hash_256 = blob_hash_256, \
                     prev5_blob_size = blob_size, \
                     prev5_blob_name = blob_name WHERE url = ?1",
                params![url],
            )?;
        }
    }
    Ok(())
}
