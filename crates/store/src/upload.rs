//! The upload pipeline: blob first, then archive validation, then the
//! invariant-checked insert. Any failure after the blob write deletes the
//! freshly written blobs so no future request can observe them.

use crate::entity::{BaseEntity, Entity, Kind};
use crate::error::Error;
use crate::resolve::resolve_in;
use crate::{audit, sql, Store};
use charmurl::{CharmUrl, ResolvedUrl};
use chrono::Utc;
use rusqlite::Connection;
use std::io::{Cursor, Read};

/// One upload: a resolved identity plus the archive stream and its
/// declared primary hash and size.
pub struct AddParams<R> {
    pub id: ResolvedUrl,
    pub reader: R,
    pub blob_hash: String,
    pub blob_size: u64,
}

impl Store {
    /// Ingest an uploaded archive as a new entity.
    pub fn add<R: Read>(&self, params: AddParams<R>) -> Result<Entity, Error> {
        let AddParams {
            id,
            reader,
            blob_hash,
            blob_size,
        } = params;
        if id.url.user.is_empty() {
            return Err(Error::IdNotAllowed(format!(
                "entity id {} has no user",
                id.url
            )));
        }
        if id.url.revision < 0 {
            return Err(Error::IdNotAllowed(format!(
                "entity id {} has no revision",
                id.url
            )));
        }

        let put = self.blobs.put(reader, &blob_hash, blob_size)?;
        let mut created = vec![put.name.clone()];
        match self.ingest(&id, &put, &mut created) {
            Ok(entity) => {
                tracing::info!(id = %entity.url, kind = entity.kind.name(), "added entity");
                Ok(entity)
            }
            Err(err) => {
                // Roll back: validation and invariant failures must not
                // leave blobs any future request could see.
                for name in created {
                    if let Err(del) = self.blobs.delete(&name) {
                        tracing::warn!(%name, error = %del, "rollback blob delete failed");
                    }
                }
                Err(err)
            }
        }
    }

    fn ingest(
        &self,
        id: &ResolvedUrl,
        put: &blobstore::PutResult,
        created: &mut Vec<String>,
    ) -> Result<Entity, Error> {
        let session = self.session()?;
        let url = &id.url;

        let (kind, prev5) = if url.is_bundle() {
            (self.read_bundle_kind(&session, put)?, None)
        } else {
            self.read_charm_kind(url, put, created)?
        };

        let (prev5_hash, prev5_hash_256, prev5_size, prev5_name) = match prev5 {
            Some(compat) => (compat.hash, compat.hash_256, compat.size, compat.name),
            None => (
                put.hash.clone(),
                put.hash_256.clone(),
                put.size,
                put.name.clone(),
            ),
        };

        let entity = Entity {
            url: url.clone(),
            base_url: url.base(),
            blob_hash: put.hash.clone(),
            blob_hash_256: put.hash_256.clone(),
            blob_size: put.size as i64,
            blob_name: put.name.clone(),
            prev5_blob_hash: prev5_hash,
            prev5_blob_hash_256: prev5_hash_256,
            prev5_blob_size: prev5_size as i64,
            prev5_blob_name: prev5_name,
            upload_time: Utc::now(),
            promulgated_url: id.promulgated(),
            promulgated_revision: id.promulgated_revision,
            development: false,
            stable: false,
            extra_info: Default::default(),
            contents: Default::default(),
            kind,
        };

        let tx = session.unchecked_transaction()?;
        {
            let conn: &Connection = &tx;
            if sql::entity_exists(conn, url)? {
                return Err(Error::DuplicateUpload(url.to_string()));
            }
            if let Some(other) = sql::kind_conflict(conn, &entity.base_url, entity.kind.name())? {
                let other_kind = match entity.kind {
                    Kind::Charm { .. } => "bundle",
                    Kind::Bundle { .. } => "charm",
                };
                return Err(Error::InvalidEntity(format!(
                    "{} name duplicates {} name {}",
                    entity.kind.name(),
                    other_kind,
                    other,
                )));
            }
            if !entity.is_bundle() && !url.series.is_empty() {
                if let Some(multi) =
                    sql::multi_series_covering(conn, &entity.base_url, &url.series)?
                {
                    return Err(Error::InvalidEntity(format!(
                        "charm name duplicates multi-series charm name {multi}",
                    )));
                }
            }

            sql::insert_base(conn, &BaseEntity::new(entity.base_url.clone()))?;
            // The primary key backstops the existence check above when
            // two uploads of one id race.
            if let Err(err) = sql::insert_entity(conn, &entity) {
                return Err(match err {
                    Error::Db(ref db)
                        if db.to_string().contains("UNIQUE constraint failed: entities.url") =>
                    {
                        Error::DuplicateUpload(url.to_string())
                    }
                    other => other,
                });
            }
            if id.promulgated_revision >= 0 {
                sql::clear_other_promulgated(conn, &url.name, &entity.base_url)?;
                sql::set_base_promulgated(conn, &entity.base_url, true)?;
            }
            audit::append(
                conn,
                "upload",
                serde_json::json!({
                    "id": url.to_string(),
                    "kind": entity.kind.name(),
                    "promulgated-revision": id.promulgated_revision,
                }),
            )?;
        }
        tx.commit()?;

        self.sync_base_best_effort(&session, &entity.base_url);
        Ok(entity)
    }

    fn read_bundle_kind(
        &self,
        conn: &Connection,
        put: &blobstore::PutResult,
    ) -> Result<Kind, Error> {
        let (reader, _) = self.blobs.open(&put.name).map_err(Error::from)?;
        let bundle = archive::read_bundle(reader, |charm| resolve_in(conn, charm).is_ok())
            .map_err(|err| match err {
                archive::Error::MissingFile("bundle.yaml") => {
                    Error::InvalidEntity("bundle archive expected".to_string())
                }
                other => Error::InvalidArchive(other),
            })?;

        let counts = archive::derived_counts(&bundle.data);
        let mut charms: Vec<CharmUrl> = bundle
            .data
            .applications
            .values()
            .filter_map(|app| CharmUrl::parse(&app.charm).ok().map(|p| p.url))
            .collect();
        charms.sort();
        charms.dedup();

        Ok(Kind::Bundle {
            data: bundle.data,
            charms,
            machine_count: counts.machines,
            unit_count: counts.units,
        })
    }

    // Returns the charm kind plus the compat blob written for
    // multi-series charms; `created` tracks blobs for rollback.
    fn read_charm_kind(
        &self,
        url: &CharmUrl,
        put: &blobstore::PutResult,
        created: &mut Vec<String>,
    ) -> Result<(Kind, Option<blobstore::PutResult>), Error> {
        let (reader, _) = self.blobs.open(&put.name).map_err(Error::from)?;
        let charm = archive::read_charm(reader).map_err(|err| match err {
            archive::Error::MissingFile("metadata.yaml") => {
                Error::InvalidEntity("charm archive expected".to_string())
            }
            other => Error::InvalidArchive(other),
        })?;

        let (supported_series, compat) = if url.series.is_empty() {
            if charm.meta.series.is_empty() {
                return Err(Error::IdNotAllowed(format!(
                    "entity id {url} has no series and the charm does not declare any",
                )));
            }
            // Multi-series: also store the rewrite served to clients that
            // cannot read multi-series metadata.
            let (reader, _) = self.blobs.open(&put.name).map_err(Error::from)?;
            let mut rewritten = Cursor::new(Vec::new());
            archive::rewrite_compat(reader, &mut rewritten)?;
            let rewritten = rewritten.into_inner();
            let compat = self
                .blobs
                .put(
                    rewritten.as_slice(),
                    &blobstore::hash_of(&rewritten),
                    rewritten.len() as u64,
                )
                .map_err(Error::from)?;
            created.push(compat.name.clone());
            (charm.meta.series.clone(), Some(compat))
        } else {
            if !archive::known_series(&url.series) {
                return Err(Error::InvalidEntity(format!(
                    "unrecognized series {:?} in entity id",
                    url.series,
                )));
            }
            if !charm.meta.series.is_empty() && !charm.meta.series.contains(&url.series) {
                return Err(Error::InvalidEntity(format!(
                    "series {:?} not listed in charm metadata",
                    url.series,
                )));
            }
            (vec![url.series.clone()], None)
        };

        let provided_interfaces = charm.meta.provided_interfaces();
        let required_interfaces = charm.meta.required_interfaces();
        Ok((
            Kind::Charm {
                meta: charm.meta,
                config: charm.config,
                actions: charm.actions,
                provided_interfaces,
                required_interfaces,
                supported_series,
            },
            compat,
        ))
    }
}
