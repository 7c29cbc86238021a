//! The documents the store is authoritative for: entities (one immutable
//! revision of a charm or bundle) and base entities (the cross-revision
//! record for a `(user, name)` pair).

use archive::{Actions, BundleData, CharmMeta, ConfigSchema, ZipPart};
use charmurl::{CharmUrl, ResolvedUrl, BUNDLE_SERIES};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A release channel. Entities start in `unpublished` and are published
/// into `development` and `stable`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Unpublished,
    Development,
    Stable,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Unpublished, Channel::Development, Channel::Stable];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Unpublished => "unpublished",
            Channel::Development => "development",
            Channel::Stable => "stable",
        }
    }

    /// Parse a channel name; unrecognized names yield None so callers can
    /// drop them.
    pub fn from_name(name: &str) -> Option<Channel> {
        match name {
            "unpublished" => Some(Channel::Unpublished),
            "development" => Some(Channel::Development),
            "stable" => Some(Channel::Stable),
            _ => None,
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Principals allowed to read and write under one channel.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Acl {
    #[serde(default)]
    pub read: Vec<String>,
    #[serde(default)]
    pub write: Vec<String>,
}

impl Acl {
    pub fn owner_only(user: &str) -> Acl {
        Acl {
            read: vec![user.to_string()],
            write: vec![user.to_string()],
        }
    }
}

/// The kind-specific payload of an entity.
#[derive(Debug, Clone, PartialEq)]
pub enum Kind {
    Charm {
        meta: CharmMeta,
        config: Option<ConfigSchema>,
        actions: Option<Actions>,
        /// Sorted, de-duplicated interface names from `provides`.
        provided_interfaces: Vec<String>,
        /// Sorted, de-duplicated interface names from `requires`.
        required_interfaces: Vec<String>,
        /// The series this charm may deploy to. For a single-series charm
        /// this is exactly the identity's series.
        supported_series: Vec<String>,
    },
    Bundle {
        data: BundleData,
        /// The charms the bundle references, parsed and de-duplicated.
        charms: Vec<CharmUrl>,
        machine_count: i64,
        unit_count: i64,
    },
}

impl Kind {
    pub fn name(&self) -> &'static str {
        match self {
            Kind::Charm { .. } => "charm",
            Kind::Bundle { .. } => "bundle",
        }
    }
}

/// One immutable revision of a charm or bundle. The identity, blob
/// fields, kind payload, and upload time never change after insert; the
/// channel booleans, promulgated fields, `extra_info`, and `contents`
/// cache are the only mutable parts.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    /// The owned identity: user non-empty, revision >= 0. Series is empty
    /// for multi-series charms and `bundle` for bundles.
    pub url: CharmUrl,
    pub base_url: CharmUrl,

    /// Primary content hash (SHA-384, hex) of the archive blob.
    pub blob_hash: String,
    pub blob_hash_256: String,
    pub blob_size: i64,
    pub blob_name: String,

    // The compatibility blob served to clients that cannot read
    // multi-series metadata. Equal to the primary fields unless the
    // entity is a multi-series charm.
    pub prev5_blob_hash: String,
    pub prev5_blob_hash_256: String,
    pub prev5_blob_size: i64,
    pub prev5_blob_name: String,

    pub upload_time: DateTime<Utc>,

    pub promulgated_url: Option<CharmUrl>,
    /// -1 when not promulgated.
    pub promulgated_revision: i32,

    pub development: bool,
    pub stable: bool,

    /// Opaque key to raw-JSON bag maintained by clients.
    pub extra_info: BTreeMap<String, serde_json::Value>,
    /// Located in-archive files by logical id; None records that a prior
    /// scan found no matching entry.
    pub contents: BTreeMap<String, Option<ZipPart>>,

    pub kind: Kind,
}

impl Entity {
    pub fn user(&self) -> &str {
        &self.url.user
    }

    pub fn name(&self) -> &str {
        &self.url.name
    }

    pub fn revision(&self) -> i32 {
        self.url.revision
    }

    pub fn series(&self) -> &str {
        &self.url.series
    }

    pub fn is_bundle(&self) -> bool {
        matches!(self.kind, Kind::Bundle { .. })
    }

    pub fn is_multi_series(&self) -> bool {
        matches!(self.kind, Kind::Charm { .. }) && self.url.series.is_empty()
    }

    /// The series this entity can be published for: its identity series,
    /// the declared list for multi-series charms, or `bundle`.
    pub fn all_series(&self) -> Vec<String> {
        match &self.kind {
            Kind::Bundle { .. } => vec![BUNDLE_SERIES.to_string()],
            Kind::Charm {
                supported_series, ..
            } => {
                if self.url.series.is_empty() {
                    supported_series.clone()
                } else {
                    vec![self.url.series.clone()]
                }
            }
        }
    }

    pub fn supported_series(&self) -> &[String] {
        match &self.kind {
            Kind::Charm {
                supported_series, ..
            } => supported_series,
            Kind::Bundle { .. } => &[],
        }
    }

    pub fn resolved(&self) -> ResolvedUrl {
        ResolvedUrl::new(self.url.clone(), self.promulgated_revision)
    }

    /// Whether this entity is currently in the given channel.
    pub fn in_channel(&self, channel: Channel) -> bool {
        match channel {
            Channel::Unpublished => true,
            Channel::Development => self.development,
            Channel::Stable => self.stable,
        }
    }
}

/// The per-`(user, name)` record holding ACLs, channel pointers, and the
/// promulgation flag. Created on first upload, mutated thereafter.
#[derive(Debug, Clone, PartialEq)]
pub struct BaseEntity {
    /// The base form: series and revision dropped.
    pub url: CharmUrl,
    pub promulgated: bool,
    pub acls: BTreeMap<Channel, Acl>,
    /// Per channel, per series: the latest entity published there.
    pub channel_current: BTreeMap<Channel, BTreeMap<String, CharmUrl>>,
}

impl BaseEntity {
    /// The base entity as created by a first upload: owner-only ACLs on
    /// every channel, nothing published, not promulgated.
    pub fn new(base_url: CharmUrl) -> BaseEntity {
        let acls = Channel::ALL
            .iter()
            .map(|c| (*c, Acl::owner_only(&base_url.user)))
            .collect();
        BaseEntity {
            url: base_url,
            promulgated: false,
            acls,
            channel_current: BTreeMap::new(),
        }
    }

    pub fn user(&self) -> &str {
        &self.url.user
    }

    pub fn name(&self) -> &str {
        &self.url.name
    }

    /// The entity currently published on `channel` for `series`.
    pub fn current(&self, channel: Channel, series: &str) -> Option<&CharmUrl> {
        self.channel_current.get(&channel)?.get(series)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn channel_names_round_trip() {
        for channel in Channel::ALL {
            assert_eq!(Channel::from_name(channel.as_str()), Some(channel));
        }
        assert_eq!(Channel::from_name("beta"), None);

        let key = serde_json::to_string(&Channel::Stable).unwrap();
        assert_eq!(key, "\"stable\"");
    }

    #[test]
    fn new_base_entity_has_owner_acls_on_every_channel() {
        let base = BaseEntity::new("cs:~charmers/wordpress".parse().unwrap());
        assert!(!base.promulgated);
        for channel in Channel::ALL {
            assert_eq!(base.acls[&channel], Acl::owner_only("charmers"));
        }
        assert!(base.channel_current.is_empty());
    }
}
