//! Projection of entities into the side search index. Submission is
//! best-effort: a failure is logged and the foreground operation
//! proceeds; the full re-sync at startup repairs whatever was missed.

use crate::entity::{BaseEntity, Entity, Kind};
use crate::error::Error;
use crate::{sql, Store};
use charmurl::CharmUrl;
use rusqlite::Connection;
use search::{ensure_version, Index, SearchDoc, Version};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

const INDEX_PREFIX: &str = "entities";

pub(crate) struct SyncHandle {
    index: Arc<dyn Index>,
    version: Mutex<Option<Version>>,
}

impl SyncHandle {
    pub(crate) fn new(index: Arc<dyn Index>) -> SyncHandle {
        SyncHandle {
            index,
            version: Mutex::new(None),
        }
    }

    // The active version is resolved lazily and cached: the cluster may
    // be unreachable at startup and become reachable later.
    fn version(&self) -> Result<Version, search::Error> {
        let mut guard = self.version.lock().unwrap();
        if let Some(version) = &*guard {
            return Ok(version.clone());
        }
        let version = ensure_version(self.index.as_ref(), INDEX_PREFIX)?;
        *guard = Some(version.clone());
        Ok(version)
    }
}

fn search_doc(entity: &Entity, base: &BaseEntity) -> SearchDoc {
    let (summary, description) = match &entity.kind {
        Kind::Charm { meta, .. } => (meta.summary.clone(), meta.description.clone()),
        Kind::Bundle { .. } => (String::new(), String::new()),
    };
    let read_acls = base
        .acls
        .iter()
        .map(|(channel, acl)| (channel.as_str().to_string(), acl.read.clone()))
        .collect();
    SearchDoc {
        url: entity.url.to_string(),
        base_url: entity.base_url.to_string(),
        user: entity.url.user.clone(),
        name: entity.url.name.clone(),
        kind: entity.kind.name().to_string(),
        series: entity.all_series(),
        provided_interfaces: match &entity.kind {
            Kind::Charm {
                provided_interfaces,
                ..
            } => provided_interfaces.clone(),
            Kind::Bundle { .. } => Vec::new(),
        },
        required_interfaces: match &entity.kind {
            Kind::Charm {
                required_interfaces,
                ..
            } => required_interfaces.clone(),
            Kind::Bundle { .. } => Vec::new(),
        },
        summary,
        description,
        promulgated_url: entity.promulgated_url.as_ref().map(|u| u.to_string()),
        read_acls,
        development: entity.development,
        stable: entity.stable,
        upload_time: entity.upload_time,
    }
}

impl Store {
    pub(crate) fn sync_base_best_effort(&self, conn: &Connection, base_url: &CharmUrl) {
        if self.sync.is_none() {
            return;
        }
        if let Err(err) = self.sync_base(conn, base_url) {
            tracing::warn!(%base_url, error = %err, "search index update failed; continuing");
        }
    }

    /// Re-project every base sharing `name` (promulgation moves state
    /// across owners).
    pub(crate) fn sync_name_best_effort(&self, conn: &Connection, name: &str) {
        if self.sync.is_none() {
            return;
        }
        let bases = match sql::bases_by_name(conn, name) {
            Ok(bases) => bases,
            Err(err) => {
                tracing::warn!(name, error = %err, "search index update failed; continuing");
                return;
            }
        };
        for base in bases {
            self.sync_base_best_effort(conn, &base.url);
        }
    }

    // Only the most recent entity per series cohort is indexed;
    // superseded revisions are removed from the index.
    fn sync_base(&self, conn: &Connection, base_url: &CharmUrl) -> Result<usize, Error> {
        let Some(sync) = &self.sync else { return Ok(0) };
        let version = sync.version()?;

        let Some(base) = sql::get_base(conn, base_url)? else {
            return Ok(0);
        };
        let entities = sql::entities_by_base(conn, base_url)?;

        let mut latest: BTreeMap<&str, &Entity> = BTreeMap::new();
        for entity in &entities {
            let slot = latest.entry(entity.series()).or_insert(entity);
            if entity.revision() > slot.revision() {
                *slot = entity;
            }
        }

        let mut indexed = 0;
        for entity in &entities {
            let id = entity.url.to_string();
            if latest.get(entity.series()).map(|e| &e.url) == Some(&entity.url) {
                sync.index
                    .update(&version.index, &id, &search_doc(entity, &base))?;
                indexed += 1;
            } else {
                sync.index.delete(&version.index, &id)?;
            }
        }
        Ok(indexed)
    }

    /// Walk every base entity and re-project it, returning how many
    /// documents were submitted. Run at startup to converge the index
    /// after missed best-effort updates.
    pub fn sync_search(&self) -> Result<usize, Error> {
        if self.sync.is_none() {
            return Ok(0);
        }
        let deadline = self.deadline();
        let session = self.session()?;
        let mut total = 0;
        for base_url in sql::all_base_urls(&session)? {
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            total += self.sync_base(&session, &base_url)?;
        }
        Ok(total)
    }
}
