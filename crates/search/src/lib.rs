use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

// The side search index mirrors entities from the authoritative store.
// This crate defines the sync contract only: the projected document, the
// operations the store drives the index with, and the two-version scheme
// under which concurrent starters converge on one active index.

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("search index request failed")]
    Http(#[from] reqwest::Error),
    #[error("search index returned status {0}")]
    Status(u16),
    #[error("search index is unavailable")]
    Unavailable,
}

/// The version record naming the active index. The counter only grows;
/// replacing the active index requires a compare-and-set on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub index: String,
    pub counter: i64,
}

/// The projection of one entity submitted to the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchDoc {
    pub url: String,
    pub base_url: String,
    pub user: String,
    pub name: String,
    pub kind: String,
    /// The series this entity serves: its identity series, or the declared
    /// list for multi-series charms.
    pub series: Vec<String>,
    #[serde(default)]
    pub provided_interfaces: Vec<String>,
    #[serde(default)]
    pub required_interfaces: Vec<String>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub description: String,
    pub promulgated_url: Option<String>,
    /// Per-channel read ACLs, so access filtering happens index-side.
    #[serde(default)]
    pub read_acls: BTreeMap<String, Vec<String>>,
    pub development: bool,
    pub stable: bool,
    pub upload_time: chrono::DateTime<chrono::Utc>,
}

/// The operations the store drives the external index with. All calls are
/// synchronous; callers treat failures as best-effort and re-sync later.
pub trait Index: Send + Sync {
    fn version(&self) -> Result<Option<Version>, Error>;
    /// Compare-and-set the version record: succeeds only when the stored
    /// counter equals `expect` (0 meaning no record yet).
    fn set_version(&self, version: &Version, expect: i64) -> Result<bool, Error>;
    /// Idempotently create an index.
    fn ensure_index(&self, name: &str) -> Result<(), Error>;
    fn update(&self, index: &str, id: &str, doc: &SearchDoc) -> Result<(), Error>;
    fn delete(&self, index: &str, id: &str) -> Result<(), Error>;
}

/// Resolve the active index version, creating the first one if none
/// exists. Candidate names derive deterministically from the counter and
/// creation is idempotent, so two racing starters converge on a single
/// index: the CAS loser re-reads and adopts the winner's version.
pub fn ensure_version(index: &dyn Index, prefix: &str) -> Result<Version, Error> {
    loop {
        if let Some(version) = index.version()? {
            index.ensure_index(&version.index)?;
            return Ok(version);
        }
        let candidate = Version {
            index: format!("{prefix}-1"),
            counter: 1,
        };
        index.ensure_index(&candidate.index)?;
        if index.set_version(&candidate, 0)? {
            return Ok(candidate);
        }
        // Lost the race: loop to observe the winner's version.
    }
}

/// HTTP implementation of the contract against the external cluster.
pub struct HttpIndex {
    base: url::Url,
    client: reqwest::blocking::Client,
}

impl HttpIndex {
    pub fn new(base: url::Url) -> HttpIndex {
        HttpIndex {
            base,
            client: reqwest::blocking::Client::new(),
        }
    }

    // Doc ids carry ':' and '/', so URLs are built segment-wise to get
    // them percent-encoded.
    fn url(&self, segments: &[&str]) -> Result<url::Url, Error> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Unavailable)?
            .extend(segments);
        Ok(url)
    }
}

impl Index for HttpIndex {
    fn version(&self) -> Result<Option<Version>, Error> {
        let resp = self.client.get(self.url(&["version"])?).send()?;
        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(Error::Status(resp.status().as_u16()));
        }
        Ok(Some(resp.json()?))
    }

    fn set_version(&self, version: &Version, expect: i64) -> Result<bool, Error> {
        let mut url = self.url(&["version"])?;
        url.query_pairs_mut()
            .append_pair("expect", &expect.to_string());
        let resp = self.client.put(url).json(version).send()?;
        match resp.status().as_u16() {
            200 | 201 => Ok(true),
            409 => Ok(false),
            status => Err(Error::Status(status)),
        }
    }

    fn ensure_index(&self, name: &str) -> Result<(), Error> {
        let resp = self.client.put(self.url(&["indexes", name])?).send()?;
        match resp.status().as_u16() {
            200 | 201 => Ok(()),
            status => Err(Error::Status(status)),
        }
    }

    fn update(&self, index: &str, id: &str, doc: &SearchDoc) -> Result<(), Error> {
        let resp = self
            .client
            .put(self.url(&["indexes", index, "docs", id])?)
            .json(doc)
            .send()?;
        match resp.status().as_u16() {
            200 | 201 => Ok(()),
            status => Err(Error::Status(status)),
        }
    }

    fn delete(&self, index: &str, id: &str) -> Result<(), Error> {
        let resp = self
            .client
            .delete(self.url(&["indexes", index, "docs", id])?)
            .send()?;
        match resp.status().as_u16() {
            200 | 404 => Ok(()),
            status => Err(Error::Status(status)),
        }
    }
}

/// In-memory implementation used by tests, with an unreachability switch
/// for exercising best-effort paths.
#[derive(Default)]
pub struct MemIndex {
    state: Mutex<MemState>,
}

#[derive(Default)]
struct MemState {
    version: Option<Version>,
    indexes: BTreeSet<String>,
    docs: BTreeMap<String, BTreeMap<String, SearchDoc>>,
    failing: bool,
}

impl MemIndex {
    pub fn new() -> MemIndex {
        MemIndex::default()
    }

    /// Make every subsequent call fail, as an unreachable cluster would.
    pub fn set_failing(&self, failing: bool) {
        self.state.lock().unwrap().failing = failing;
    }

    pub fn docs(&self, index: &str) -> BTreeMap<String, SearchDoc> {
        self.state
            .lock()
            .unwrap()
            .docs
            .get(index)
            .cloned()
            .unwrap_or_default()
    }

    pub fn doc_ids(&self, index: &str) -> Vec<String> {
        self.docs(index).into_keys().collect()
    }

    pub fn indexes(&self) -> Vec<String> {
        self.state.lock().unwrap().indexes.iter().cloned().collect()
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, MemState>, Error> {
        let state = self.state.lock().unwrap();
        if state.failing {
            return Err(Error::Unavailable);
        }
        Ok(state)
    }
}

impl Index for MemIndex {
    fn version(&self) -> Result<Option<Version>, Error> {
        Ok(self.state()?.version.clone())
    }

    fn set_version(&self, version: &Version, expect: i64) -> Result<bool, Error> {
        let mut state = self.state()?;
        let current = state.version.as_ref().map(|v| v.counter).unwrap_or(0);
        if current != expect {
            return Ok(false);
        }
        state.version = Some(version.clone());
        Ok(true)
    }

    fn ensure_index(&self, name: &str) -> Result<(), Error> {
        let mut state = self.state()?;
        state.indexes.insert(name.to_string());
        state.docs.entry(name.to_string()).or_default();
        Ok(())
    }

    fn update(&self, index: &str, id: &str, doc: &SearchDoc) -> Result<(), Error> {
        self.state()?
            .docs
            .entry(index.to_string())
            .or_default()
            .insert(id.to_string(), doc.clone());
        Ok(())
    }

    fn delete(&self, index: &str, id: &str) -> Result<(), Error> {
        self.state()?
            .docs
            .entry(index.to_string())
            .or_default()
            .remove(id);
        Ok(())
    }
}
