//! Row mapping and queries over the `entities` and `base_entities`
//! tables. Rich nested fields live in JSON columns; everything the
//! queries filter on is denormalized into real columns.

use crate::entity::{Acl, BaseEntity, Channel, Entity, Kind};
use crate::error::Error;
use archive::ZipPart;
use charmurl::CharmUrl;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;

pub(crate) const ENTITY_COLUMNS: &str = "url, base_url, kind, \
     blob_hash, blob_hash_256, blob_size, blob_name, \
     prev5_blob_hash, prev5_blob_hash_256, prev5_blob_size, prev5_blob_name, \
     upload_time, promulgated_url, promulgated_revision, development, stable, \
     charm_meta, charm_config, charm_actions, supported_series, \
     provided_interfaces, required_interfaces, \
     bundle_data, bundle_charms, bundle_machine_count, bundle_unit_count, \
     extra_info, contents";

const BASE_COLUMNS: &str = "base_url, promulgated, acls, channel_current";

pub(crate) fn time_to_sql(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_err(idx: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn json_col<T: serde::de::DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|err| conversion_err(idx, err))
}

fn json_col_opt<T: serde::de::DeserializeOwned>(
    row: &Row,
    idx: usize,
) -> rusqlite::Result<Option<T>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| serde_json::from_str(&t).map_err(|err| conversion_err(idx, err)))
        .transpose()
}

fn url_col(row: &Row, idx: usize) -> rusqlite::Result<CharmUrl> {
    let text: String = row.get(idx)?;
    text.parse().map_err(|err| conversion_err(idx, err))
}

fn url_col_opt(row: &Row, idx: usize) -> rusqlite::Result<Option<CharmUrl>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| t.parse().map_err(|err| conversion_err(idx, err)))
        .transpose()
}

fn time_col(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|err| conversion_err(idx, err))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, Error> {
    Ok(serde_json::to_string(value)?)
}

pub(crate) fn entity_from_row(row: &Row) -> rusqlite::Result<Entity> {
    let kind_name: String = row.get(2)?;
    let kind = match kind_name.as_str() {
        "charm" => Kind::Charm {
            meta: json_col(row, 16)?,
            config: json_col_opt(row, 17)?,
            actions: json_col_opt(row, 18)?,
            supported_series: json_col(row, 19)?,
            provided_interfaces: json_col(row, 20)?,
            required_interfaces: json_col(row, 21)?,
        },
        "bundle" => Kind::Bundle {
            data: json_col(row, 22)?,
            charms: json_col(row, 23)?,
            machine_count: row.get(24)?,
            unit_count: row.get(25)?,
        },
        other => {
            return Err(conversion_err(
                2,
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("unknown entity kind {other:?}"),
                ),
            ))
        }
    };
    Ok(Entity {
        url: url_col(row, 0)?,
        base_url: url_col(row, 1)?,
        blob_hash: row.get(3)?,
        blob_hash_256: row.get(4)?,
        blob_size: row.get(5)?,
        blob_name: row.get(6)?,
        prev5_blob_hash: row.get(7)?,
        prev5_blob_hash_256: row.get(8)?,
        prev5_blob_size: row.get(9)?,
        prev5_blob_name: row.get(10)?,
        upload_time: time_col(row, 11)?,
        promulgated_url: url_col_opt(row, 12)?,
        promulgated_revision: row.get(13)?,
        development: row.get(14)?,
        stable: row.get(15)?,
        extra_info: json_col(row, 26)?,
        contents: json_col(row, 27)?,
        kind,
    })
}

pub(crate) fn insert_entity(conn: &Connection, entity: &Entity) -> Result<(), Error> {
    let (charm_meta, charm_config, charm_actions, supported, provided, required) =
        match &entity.kind {
            Kind::Charm {
                meta,
                config,
                actions,
                supported_series,
                provided_interfaces,
                required_interfaces,
            } => (
                Some(to_json(meta)?),
                config.as_ref().map(to_json).transpose()?,
                actions.as_ref().map(to_json).transpose()?,
                to_json(supported_series)?,
                to_json(provided_interfaces)?,
                to_json(required_interfaces)?,
            ),
            Kind::Bundle { .. } => (
                None,
                None,
                None,
                "[]".to_string(),
                "[]".to_string(),
                "[]".to_string(),
            ),
        };
    let (bundle_data, bundle_charms, machine_count, unit_count) = match &entity.kind {
        Kind::Bundle {
            data,
            charms,
            machine_count,
            unit_count,
        } => (
            Some(to_json(data)?),
            Some(to_json(charms)?),
            Some(*machine_count),
            Some(*unit_count),
        ),
        Kind::Charm { .. } => (None, None, None, None),
    };

    conn.prepare_cached(
        "INSERT INTO entities (\
             url, username, name, revision, series, base_url, kind, \
             blob_hash, blob_hash_256, blob_size, blob_name, \
             prev5_blob_hash, prev5_blob_hash_256, prev5_blob_size, prev5_blob_name, \
             upload_time, promulgated_url, promulgated_revision, development, stable, \
             charm_meta, charm_config, charm_actions, supported_series, \
             provided_interfaces, required_interfaces, \
             bundle_data, bundle_charms, bundle_machine_count, bundle_unit_count, \
             extra_info, contents) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
                 ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30, \
                 ?31, ?32)",
    )?
    .execute(params![
        entity.url.to_string(),
        entity.url.user,
        entity.url.name,
        entity.url.revision,
        entity.url.series,
        entity.base_url.to_string(),
        entity.kind.name(),
        entity.blob_hash,
        entity.blob_hash_256,
        entity.blob_size,
        entity.blob_name,
        entity.prev5_blob_hash,
        entity.prev5_blob_hash_256,
        entity.prev5_blob_size,
        entity.prev5_blob_name,
        time_to_sql(&entity.upload_time),
        entity.promulgated_url.as_ref().map(|u| u.to_string()),
        entity.promulgated_revision,
        entity.development,
        entity.stable,
        charm_meta,
        charm_config,
        charm_actions,
        supported,
        provided,
        required,
        bundle_data,
        bundle_charms,
        machine_count,
        unit_count,
        to_json(&entity.extra_info)?,
        to_json(&entity.contents)?,
    ])?;
    Ok(())
}

pub(crate) fn entity_exists(conn: &Connection, url: &CharmUrl) -> Result<bool, Error> {
    let exists = conn
        .prepare_cached("SELECT 1 FROM entities WHERE url = ?1")?
        .query_row(params![url.to_string()], |_| Ok(()))
        .optional()?
        .is_some();
    Ok(exists)
}

pub(crate) fn get_entity(conn: &Connection, url: &CharmUrl) -> Result<Option<Entity>, Error> {
    let entity = conn
        .prepare_cached(&format!(
            "SELECT {ENTITY_COLUMNS} FROM entities WHERE url = ?1"
        ))?
        .query_row(params![url.to_string()], entity_from_row)
        .optional()?;
    Ok(entity)
}

pub(crate) fn entities_by_base(
    conn: &Connection,
    base_url: &CharmUrl,
) -> Result<Vec<Entity>, Error> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {ENTITY_COLUMNS} FROM entities WHERE base_url = ?1 \
         ORDER BY series, revision"
    ))?;
    let entities = stmt
        .query_map(params![base_url.to_string()], entity_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(entities)
}

/// All entities whose identity matches the pattern under the identifier
/// match rule: empty user or series and revision -1 are wildcards.
pub(crate) fn find_entities(
    conn: &Connection,
    pattern: &CharmUrl,
) -> Result<Vec<Entity>, Error> {
    let mut sql = format!("SELECT {ENTITY_COLUMNS} FROM entities WHERE name = ?1");
    let mut binds: Vec<Value> = vec![pattern.name.clone().into()];
    if !pattern.user.is_empty() {
        binds.push(pattern.user.clone().into());
        sql.push_str(&format!(" AND username = ?{}", binds.len()));
    }
    if !pattern.series.is_empty() {
        binds.push(pattern.series.clone().into());
        sql.push_str(&format!(" AND series = ?{}", binds.len()));
    }
    if pattern.revision != -1 {
        binds.push(i64::from(pattern.revision).into());
        sql.push_str(&format!(" AND revision = ?{}", binds.len()));
    }
    sql.push_str(" ORDER BY url");

    let mut stmt = conn.prepare(&sql)?;
    let entities = stmt
        .query_map(params_from_iter(binds), entity_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(entities)
}

/// Candidate entities for resolution: by name, optionally narrowed to one
/// user; without a user only promulgated entities participate.
pub(crate) fn candidates_by_name(
    conn: &Connection,
    name: &str,
    user: Option<&str>,
) -> Result<Vec<Entity>, Error> {
    let (sql, binds): (String, Vec<Value>) = match user {
        Some(user) => (
            format!(
                "SELECT {ENTITY_COLUMNS} FROM entities \
                 WHERE name = ?1 AND username = ?2 ORDER BY url"
            ),
            vec![name.to_string().into(), user.to_string().into()],
        ),
        None => (
            format!(
                "SELECT {ENTITY_COLUMNS} FROM entities \
                 WHERE name = ?1 AND promulgated_url IS NOT NULL ORDER BY url"
            ),
            vec![name.to_string().into()],
        ),
    };
    let mut stmt = conn.prepare_cached(&sql)?;
    let entities = stmt
        .query_map(params_from_iter(binds), entity_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(entities)
}

/// Entities providing any of `provided` and requiring any of `required`,
/// for relation-based discovery.
pub(crate) fn matching_interfaces(
    conn: &Connection,
    required: &[&str],
    provided: &[&str],
) -> Result<Vec<Entity>, Error> {
    if required.is_empty() || provided.is_empty() {
        return Ok(Vec::new());
    }
    let mut binds: Vec<Value> = Vec::new();
    let provided_marks = placeholders(provided, &mut binds);
    let required_marks = placeholders(required, &mut binds);
    let sql = format!(
        "SELECT {ENTITY_COLUMNS} FROM entities WHERE kind = 'charm' \
         AND EXISTS (SELECT 1 FROM json_each(entities.provided_interfaces) \
                     WHERE json_each.value IN ({provided_marks})) \
         AND EXISTS (SELECT 1 FROM json_each(entities.required_interfaces) \
                     WHERE json_each.value IN ({required_marks})) \
         ORDER BY url"
    );
    let mut stmt = conn.prepare(&sql)?;
    let entities = stmt
        .query_map(params_from_iter(binds), entity_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(entities)
}

fn placeholders(values: &[&str], binds: &mut Vec<Value>) -> String {
    let mut marks = Vec::new();
    for value in values {
        binds.push(value.to_string().into());
        marks.push(format!("?{}", binds.len()));
    }
    marks.join(", ")
}

/// The URL of an entity under `base_url` of a different kind, if any; the
/// oldest one names the conflict in error messages.
pub(crate) fn kind_conflict(
    conn: &Connection,
    base_url: &CharmUrl,
    kind_name: &str,
) -> Result<Option<CharmUrl>, Error> {
    let url: Option<String> = conn
        .prepare_cached(
            "SELECT url FROM entities WHERE base_url = ?1 AND kind <> ?2 \
             ORDER BY upload_time, url LIMIT 1",
        )?
        .query_row(params![base_url.to_string(), kind_name], |row| row.get(0))
        .optional()?;
    Ok(url.map(|u| u.parse()).transpose().map_err(Error::MalformedId)?)
}

/// The latest multi-series charm under `base_url` covering `series`, if
/// any.
pub(crate) fn multi_series_covering(
    conn: &Connection,
    base_url: &CharmUrl,
    series: &str,
) -> Result<Option<CharmUrl>, Error> {
    let url: Option<String> = conn
        .prepare_cached(
            "SELECT url FROM entities \
             WHERE base_url = ?1 AND kind = 'charm' AND series = '' \
               AND EXISTS (SELECT 1 FROM json_each(entities.supported_series) \
                           WHERE json_each.value = ?2) \
             ORDER BY revision DESC LIMIT 1",
        )?
        .query_row(params![base_url.to_string(), series], |row| row.get(0))
        .optional()?;
    Ok(url.map(|u| u.parse()).transpose().map_err(Error::MalformedId)?)
}

pub(crate) fn update_entity_flags(
    conn: &Connection,
    url: &CharmUrl,
    development: bool,
    stable: bool,
) -> Result<(), Error> {
    let n = conn
        .prepare_cached("UPDATE entities SET development = ?2, stable = ?3 WHERE url = ?1")?
        .execute(params![url.to_string(), development, stable])?;
    if n == 0 {
        return Err(Error::not_found(url));
    }
    Ok(())
}

pub(crate) fn update_entity_promulgated(
    conn: &Connection,
    url: &CharmUrl,
    promulgated_url: Option<&CharmUrl>,
    promulgated_revision: i32,
) -> Result<(), Error> {
    let n = conn
        .prepare_cached(
            "UPDATE entities SET promulgated_url = ?2, promulgated_revision = ?3 \
             WHERE url = ?1",
        )?
        .execute(params![
            url.to_string(),
            promulgated_url.map(|u| u.to_string()),
            promulgated_revision,
        ])?;
    if n == 0 {
        return Err(Error::not_found(url));
    }
    Ok(())
}

pub(crate) fn update_entity_contents(
    conn: &Connection,
    url: &CharmUrl,
    contents: &BTreeMap<String, Option<ZipPart>>,
) -> Result<(), Error> {
    conn.prepare_cached("UPDATE entities SET contents = ?2 WHERE url = ?1")?
        .execute(params![url.to_string(), to_json(contents)?])?;
    Ok(())
}

/// Set (Some) or remove (None) one key of an entity's extra-info bag.
pub(crate) fn update_extra_info(
    conn: &Connection,
    url: &CharmUrl,
    key: &str,
    value: Option<&serde_json::Value>,
) -> Result<(), Error> {
    let mut extra: BTreeMap<String, serde_json::Value> = conn
        .prepare_cached("SELECT extra_info FROM entities WHERE url = ?1")?
        .query_row(params![url.to_string()], |row| json_col(row, 0))
        .optional()?
        .ok_or_else(|| Error::not_found(url))?;
    match value {
        Some(value) => extra.insert(key.to_string(), value.clone()),
        None => extra.remove(key),
    };
    conn.prepare_cached("UPDATE entities SET extra_info = ?2 WHERE url = ?1")?
        .execute(params![url.to_string(), to_json(&extra)?])?;
    Ok(())
}

/// Entities of one base still lacking a promulgated URL, oldest first.
pub(crate) fn entities_without_promulgated_url(
    conn: &Connection,
    base_url: &CharmUrl,
) -> Result<Vec<Entity>, Error> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {ENTITY_COLUMNS} FROM entities \
         WHERE base_url = ?1 AND promulgated_url IS NULL \
         ORDER BY upload_time, revision"
    ))?;
    let entities = stmt
        .query_map(params![base_url.to_string()], entity_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(entities)
}

/// The highest promulgated revision ever assigned for `(name, series)`
/// across all owners, or -1 when none was.
pub(crate) fn max_promulgated_revision(
    conn: &Connection,
    name: &str,
    series: &str,
) -> Result<i32, Error> {
    let max: Option<i32> = conn
        .prepare_cached(
            "SELECT MAX(promulgated_revision) FROM entities \
             WHERE name = ?1 AND series = ?2",
        )?
        .query_row(params![name, series], |row| row.get(0))?;
    Ok(max.unwrap_or(-1))
}

fn base_from_row(row: &Row) -> rusqlite::Result<BaseEntity> {
    Ok(BaseEntity {
        url: url_col(row, 0)?,
        promulgated: row.get(1)?,
        acls: json_col(row, 2)?,
        channel_current: json_col(row, 3)?,
    })
}

// Upsert semantics: two uploads racing to create the first entity for a
// (user, name) pair both succeed, converging on one base row.
pub(crate) fn insert_base(conn: &Connection, base: &BaseEntity) -> Result<(), Error> {
    conn.prepare_cached(
        "INSERT OR IGNORE INTO base_entities \
             (base_url, username, name, promulgated, acls, channel_current) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?
    .execute(params![
        base.url.to_string(),
        base.url.user,
        base.url.name,
        base.promulgated,
        to_json(&base.acls)?,
        to_json(&base.channel_current)?,
    ])?;
    Ok(())
}

pub(crate) fn get_base(
    conn: &Connection,
    base_url: &CharmUrl,
) -> Result<Option<BaseEntity>, Error> {
    let base = conn
        .prepare_cached(&format!(
            "SELECT {BASE_COLUMNS} FROM base_entities WHERE base_url = ?1"
        ))?
        .query_row(params![base_url.to_string()], base_from_row)
        .optional()?;
    Ok(base)
}

pub(crate) fn bases_by_name(conn: &Connection, name: &str) -> Result<Vec<BaseEntity>, Error> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {BASE_COLUMNS} FROM base_entities WHERE name = ?1 ORDER BY base_url"
    ))?;
    let bases = stmt
        .query_map(params![name], base_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(bases)
}

pub(crate) fn all_base_urls(conn: &Connection) -> Result<Vec<CharmUrl>, Error> {
    let mut stmt = conn.prepare_cached("SELECT base_url FROM base_entities ORDER BY base_url")?;
    let urls = stmt
        .query_map([], |row| url_col(row, 0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(urls)
}

pub(crate) fn update_base_acls(
    conn: &Connection,
    base_url: &CharmUrl,
    acls: &BTreeMap<Channel, Acl>,
) -> Result<(), Error> {
    let n = conn
        .prepare_cached("UPDATE base_entities SET acls = ?2 WHERE base_url = ?1")?
        .execute(params![base_url.to_string(), to_json(acls)?])?;
    if n == 0 {
        return Err(Error::not_found(base_url));
    }
    Ok(())
}

pub(crate) fn update_base_channels(
    conn: &Connection,
    base_url: &CharmUrl,
    channel_current: &BTreeMap<Channel, BTreeMap<String, CharmUrl>>,
) -> Result<(), Error> {
    let n = conn
        .prepare_cached("UPDATE base_entities SET channel_current = ?2 WHERE base_url = ?1")?
        .execute(params![base_url.to_string(), to_json(channel_current)?])?;
    if n == 0 {
        return Err(Error::not_found(base_url));
    }
    Ok(())
}

pub(crate) fn set_base_promulgated(
    conn: &Connection,
    base_url: &CharmUrl,
    promulgated: bool,
) -> Result<(), Error> {
    let n = conn
        .prepare_cached("UPDATE base_entities SET promulgated = ?2 WHERE base_url = ?1")?
        .execute(params![base_url.to_string(), promulgated])?;
    if n == 0 {
        return Err(Error::not_found(base_url));
    }
    Ok(())
}

/// Clear the promulgated flag from every base of `name` except `keep`,
/// returning how many lost it.
pub(crate) fn clear_other_promulgated(
    conn: &Connection,
    name: &str,
    keep: &CharmUrl,
) -> Result<usize, Error> {
    let n = conn
        .prepare_cached(
            "UPDATE base_entities SET promulgated = 0 \
             WHERE name = ?1 AND base_url <> ?2 AND promulgated = 1",
        )?
        .execute(params![name, keep.to_string()])?;
    Ok(n)
}
