mod audit;
mod blobs;
mod config;
mod entity;
mod error;
pub mod logging;
mod migrations;
mod pool;
mod promulgate;
mod publish;
mod resolve;
mod search_sync;
mod sql;
mod upload;

pub use audit::AuditEntry;
pub use blobs::{FILE_ICON, FILE_README};
pub use config::{Config, ConfigError};
pub use entity::{Acl, BaseEntity, Channel, Entity, Kind};
pub use error::{Error, ErrorCode};
pub use upload::AddParams;

use charmurl::CharmUrl;
use pool::{Pool, Session};
use search_sync::SyncHandle;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

// The authoritative store: entities and base entities over the document
// database, the archive blobs beside them, and the side search index kept
// loosely in step. Every public operation draws a session from the
// bounded pool at entry and releases it on every exit path.

/// Everything needed to open a store.
pub struct StoreParams {
    /// Path of the document database file.
    pub database: PathBuf,
    /// Root directory of the blob store.
    pub blob_root: PathBuf,
    /// The external search index, if one is configured.
    pub index: Option<Arc<dyn search::Index>>,
    pub max_sessions: usize,
    pub request_timeout: Duration,
}

impl StoreParams {
    /// Derive store parameters from the service configuration: the
    /// configured database location is a directory holding both the
    /// database file and the blob root.
    pub fn from_config(config: &Config, index: Option<Arc<dyn search::Index>>) -> StoreParams {
        StoreParams {
            database: config.mongo_url.join("charmstore.db"),
            blob_root: config.mongo_url.join("blobs"),
            index,
            max_sessions: config.max_mgo_sessions,
            request_timeout: config.request_timeout,
        }
    }
}

pub struct Store {
    pool: Pool,
    pub(crate) blobs: blobstore::Store,
    pub(crate) sync: Option<SyncHandle>,
    timeout: Duration,
}

impl Store {
    /// Open the store: run pending schema migrations, then re-sync the
    /// search index (best-effort) so that it catches up with anything
    /// missed while the indexer was unreachable.
    pub fn open(params: StoreParams) -> Result<Store, Error> {
        let pool = Pool::new(&params.database, params.max_sessions)?;
        let blobs = blobstore::Store::new(&params.blob_root).map_err(Error::from)?;

        let store = Store {
            pool,
            blobs,
            sync: params.index.map(SyncHandle::new),
            timeout: params.request_timeout,
        };
        {
            // Migrations run outside the request deadline; starting up
            // may legitimately take longer than serving.
            let session = store
                .pool
                .acquire(Instant::now() + Duration::from_secs(300))?;
            migrations::run(&session, &store.blobs)?;
        }
        if store.sync.is_some() {
            if let Err(err) = store.sync_search() {
                tracing::warn!(error = %err, "initial search re-sync failed; continuing");
            }
        }
        Ok(store)
    }

    /// Close the session pool. Idempotent; operations after close fail
    /// with `Closed`.
    pub fn close(&self) {
        self.pool.close();
    }

    pub(crate) fn deadline(&self) -> Instant {
        Instant::now() + self.timeout
    }

    pub(crate) fn session(&self) -> Result<Session, Error> {
        self.pool.acquire(self.deadline())
    }

    /// The entity with exactly this identity.
    pub fn find_entity(&self, url: &CharmUrl) -> Result<Entity, Error> {
        let session = self.session()?;
        sql::get_entity(&session, url)?.ok_or_else(|| Error::not_found(url))
    }

    /// The base entity for this identity's `(user, name)` pair.
    pub fn find_base_entity(&self, url: &CharmUrl) -> Result<BaseEntity, Error> {
        let session = self.session()?;
        let base_url = url.base();
        sql::get_base(&session, &base_url)?.ok_or_else(|| Error::not_found(&base_url))
    }

    /// All entities matching the pattern: empty user or series and
    /// revision -1 act as wildcards.
    pub fn find_entities(&self, pattern: &CharmUrl) -> Result<Vec<Entity>, Error> {
        let session = self.session()?;
        sql::find_entities(&session, pattern)
    }

    /// Entities providing any of `provided` and requiring any of
    /// `required`, for relation-based discovery.
    pub fn matching_interfaces(
        &self,
        required: &[&str],
        provided: &[&str],
    ) -> Result<Vec<Entity>, Error> {
        let session = self.session()?;
        sql::matching_interfaces(&session, required, provided)
    }

    /// Set (or with None, remove) one key of an entity's extra-info bag.
    pub fn update_extra_info(
        &self,
        url: &CharmUrl,
        key: &str,
        value: Option<&serde_json::Value>,
    ) -> Result<(), Error> {
        let session = self.session()?;
        sql::update_extra_info(&session, url, key, value)?;
        audit::append(
            &session,
            "set-extra-info",
            serde_json::json!({ "id": url.to_string(), "key": key }),
        )?;
        Ok(())
    }

    /// Replace the ACL for one channel of a base entity and re-project
    /// the affected entities into the search index.
    pub fn set_channel_acl(
        &self,
        url: &CharmUrl,
        channel: Channel,
        acl: Acl,
    ) -> Result<(), Error> {
        let session = self.session()?;
        let base_url = url.base();
        let mut base =
            sql::get_base(&session, &base_url)?.ok_or_else(|| Error::not_found(&base_url))?;
        base.acls.insert(channel, acl);
        sql::update_base_acls(&session, &base.url, &base.acls)?;
        audit::append(
            &session,
            "set-acl",
            serde_json::json!({ "id": base.url.to_string(), "channel": channel.as_str() }),
        )?;
        self.sync_base_best_effort(&session, &base_url);
        Ok(())
    }

    /// The audit log, oldest first.
    pub fn list_audit_log(&self) -> Result<Vec<AuditEntry>, Error> {
        let session = self.session()?;
        audit::list(&session)
    }
}
