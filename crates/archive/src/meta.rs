//! Charm document structures: `metadata.yaml`, `config.yaml`, and
//! `actions.yaml`, together with the structural validation applied at
//! ingest.

use crate::series::{known_series, os_family, OsFamily};
use crate::Error;
use charmurl::BUNDLE_SERIES;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// Placeholder names carried by freshly generated charm templates. An
// archive still declaring one has not been filled in and is rejected.
const RESERVED_RELATION_NAME: &str = "relation-name";
const RESERVED_INTERFACE_NAME: &str = "interface-name";

/// The parsed `metadata.yaml` document. Unknown fields are ignored, as
/// charm authors carry tool-specific extras.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharmMeta {
    pub name: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub description: String,
    /// The declared supported series. Empty for single-series charms,
    /// whose target comes from their identifier.
    #[serde(default)]
    pub series: Vec<String>,
    #[serde(default)]
    pub provides: BTreeMap<String, Relation>,
    #[serde(default)]
    pub requires: BTreeMap<String, Relation>,
    #[serde(default)]
    pub peers: BTreeMap<String, Relation>,
    #[serde(default)]
    pub subordinate: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub terms: Vec<String>,
    #[serde(default, rename = "min-juju-version")]
    pub min_juju_version: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RelationScope {
    #[default]
    Global,
    Container,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Relation {
    pub interface: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub scope: RelationScope,
}

// metadata.yaml allows the shorthand `name: interface` next to the full
// mapping form.
impl<'de> Deserialize<'de> for Relation {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Interface(String),
            Full {
                interface: String,
                #[serde(default)]
                limit: Option<u32>,
                #[serde(default)]
                optional: bool,
                #[serde(default)]
                scope: RelationScope,
            },
        }
        Ok(match Repr::deserialize(deserializer)? {
            Repr::Interface(interface) => Relation {
                interface,
                limit: None,
                optional: false,
                scope: RelationScope::Global,
            },
            Repr::Full {
                interface,
                limit,
                optional,
                scope,
            } => Relation {
                interface,
                limit,
                optional,
                scope,
            },
        })
    }
}

impl CharmMeta {
    /// Interface names provided by this charm, sorted and de-duplicated.
    pub fn provided_interfaces(&self) -> Vec<String> {
        sorted_interfaces(&self.provides)
    }

    /// Interface names required by this charm, sorted and de-duplicated.
    pub fn required_interfaces(&self) -> Vec<String> {
        sorted_interfaces(&self.requires)
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        for relations in [&self.provides, &self.requires, &self.peers] {
            for (name, relation) in relations {
                if name == RESERVED_RELATION_NAME {
                    return Err(Error::BannedRelation(name.clone()));
                }
                if relation.interface == RESERVED_INTERFACE_NAME {
                    return Err(Error::BannedInterface(relation.interface.clone()));
                }
            }
        }

        let mut family: Option<OsFamily> = None;
        for series in &self.series {
            if series == BUNDLE_SERIES || !known_series(series) {
                return Err(Error::UnrecognizedSeries(series.clone()));
            }
            let os = os_family(series).unwrap();
            match family {
                None => family = Some(os),
                Some(prev) if prev != os => return Err(Error::MixedOsFamilies),
                Some(_) => {}
            }
        }
        Ok(())
    }
}

fn sorted_interfaces(relations: &BTreeMap<String, Relation>) -> Vec<String> {
    let mut interfaces: Vec<String> = relations
        .values()
        .map(|r| r.interface.clone())
        .collect();
    interfaces.sort();
    interfaces.dedup();
    interfaces
}

/// The parsed `config.yaml` document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSchema {
    pub options: BTreeMap<String, ConfigOption>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigOption {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

/// The parsed `actions.yaml` document: action name to specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Actions(pub BTreeMap<String, ActionSpec>);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
}
