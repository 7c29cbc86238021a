//! Bundle document structures (`bundle.yaml`), structural verification,
//! and the placement rules from which machine and unit counts derive.

use crate::Error;
use charmurl::CharmUrl;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The parsed `bundle.yaml` document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleData {
    /// Application name to specification. Older documents use the key
    /// `services`; both forms are accepted.
    #[serde(alias = "services")]
    pub applications: BTreeMap<String, ApplicationSpec>,
    #[serde(default)]
    pub machines: BTreeMap<MachineId, Option<MachineSpec>>,
    /// Relation pairs, each endpoint `application[:relation]`.
    #[serde(default)]
    pub relations: Vec<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationSpec {
    pub charm: String,
    #[serde(default)]
    pub num_units: u32,
    /// Placement directives, one per unit; a short list is extended by
    /// replicating its last entry.
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<String>,
    #[serde(default)]
    pub expose: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MachineSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// A machine key in the `machines` section. Documents write these both
/// quoted and as bare integers, so deserialization accepts either.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct MachineId(pub String);

impl<'de> Deserialize<'de> for MachineId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct V;
        impl serde::de::Visitor<'_> for V {
            type Value = MachineId;
            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a machine id")
            }
            fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<MachineId, E> {
                Ok(MachineId(v.to_string()))
            }
            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<MachineId, E> {
                Ok(MachineId(v.to_string()))
            }
        }
        deserializer.deserialize_any(V)
    }
}

/// One parsed placement directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    /// `lxc`, `lxd`, or `kvm` when the directive has a container prefix.
    pub container: Option<String>,
    pub target: Target,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A fresh machine.
    New,
    /// An existing machine from the `machines` section.
    Machine(String),
    /// Co-located with a unit of another application.
    Application { name: String, unit: Option<u32> },
}

const CONTAINER_KINDS: [&str; 3] = ["lxc", "lxd", "kvm"];

pub fn parse_placement(s: &str) -> Result<Placement, String> {
    let (container, target) = match s.split_once(':') {
        Some((container, target)) => {
            if !CONTAINER_KINDS.contains(&container) {
                return Err(format!("invalid container {container:?} in placement {s:?}"));
            }
            (Some(container.to_string()), target)
        }
        None => (None, s),
    };
    if target.is_empty() {
        return Err(format!("invalid placement {s:?}"));
    }
    let target = if target == "new" {
        Target::New
    } else if target.bytes().all(|b| b.is_ascii_digit()) {
        Target::Machine(target.to_string())
    } else {
        match target.split_once('/') {
            Some((name, unit)) => {
                let unit = unit
                    .parse::<u32>()
                    .map_err(|_| format!("invalid unit in placement {s:?}"))?;
                Target::Application {
                    name: name.to_string(),
                    unit: Some(unit),
                }
            }
            None => Target::Application {
                name: target.to_string(),
                unit: None,
            },
        }
    };
    Ok(Placement { container, target })
}

/// Structurally verify a bundle, collecting every problem found. The
/// `charm_exists` callback answers whether a referenced charm is known to
/// the host store.
pub fn verify(
    data: &BundleData,
    mut charm_exists: impl FnMut(&CharmUrl) -> bool,
) -> Result<(), Error> {
    let mut errors = Vec::new();

    if data.applications.is_empty() {
        errors.push("bundle declares no applications".to_string());
    }
    for (name, app) in &data.applications {
        match CharmUrl::parse(&app.charm) {
            Ok(parsed) => {
                if !charm_exists(&parsed.url) {
                    errors.push(format!(
                        "charm {:?} referred to by application {name:?} not found",
                        app.charm
                    ));
                }
            }
            Err(err) => {
                errors.push(format!(
                    "invalid charm URL {:?} in application {name:?}: {err}",
                    app.charm
                ));
            }
        }
        for to in &app.to {
            match parse_placement(to) {
                Ok(placement) => match placement.target {
                    Target::Machine(id) => {
                        if !data.machines.contains_key(&MachineId(id.clone())) {
                            errors.push(format!(
                                "placement of application {name:?} refers to machine {id:?} not defined in this bundle"
                            ));
                        }
                    }
                    Target::Application { name: other, .. } => {
                        if !data.applications.contains_key(&other) {
                            errors.push(format!(
                                "placement of application {name:?} refers to application {other:?} not defined in this bundle"
                            ));
                        }
                    }
                    Target::New => {}
                },
                Err(err) => errors.push(err),
            }
        }
    }
    for relation in &data.relations {
        for endpoint in relation {
            let application = endpoint.split(':').next().unwrap_or(endpoint);
            if !data.applications.contains_key(application) {
                errors.push(format!(
                    "relation endpoint {endpoint:?} refers to application {application:?} not defined in this bundle"
                ));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::Verification(errors.iter().join("\n")))
    }
}

/// Derived deployment size of a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counts {
    pub machines: i64,
    pub units: i64,
}

/// Compute how many machines and units deploying this bundle creates.
///
/// Units are the sum of `num_units`. Machines start from the explicit
/// machine specs; an application with no placement adds one machine per
/// unit; a placed application adds one machine per `new` directive, the
/// last directive being replicated for units beyond the placement list.
/// Directives naming an existing machine or another application's unit add
/// nothing, and a container prefix does not change the count.
pub fn derived_counts(data: &BundleData) -> Counts {
    let mut machines = data.machines.len() as i64;
    let mut units: i64 = 0;

    for app in data.applications.values() {
        let n = app.num_units as i64;
        units += n;

        if app.to.is_empty() {
            machines += n;
            continue;
        }
        for to in &app.to {
            if let Ok(Placement {
                target: Target::New,
                ..
            }) = parse_placement(to)
            {
                machines += 1;
            }
        }
        let l = app.to.len() as i64;
        if n > l {
            if let Ok(Placement {
                target: Target::New,
                ..
            }) = parse_placement(app.to.last().unwrap())
            {
                machines += n - l;
            }
        }
    }
    Counts { machines, units }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn bundle(doc: &str) -> BundleData {
        serde_yaml::from_str(doc).unwrap()
    }

    const WORDPRESS_SIMPLE: &str = r#"
applications:
  wordpress:
    charm: cs:precise/wordpress-20
    num_units: 1
  mysql:
    charm: cs:precise/mysql-28
    num_units: 1
relations:
  - [wordpress:db, mysql:server]
"#;

    #[test]
    fn parse_accepts_services_alias() {
        let data = bundle(&WORDPRESS_SIMPLE.replace("applications:", "services:"));
        assert_eq!(data.applications.len(), 2);
    }

    #[test]
    fn verify_ok() {
        let data = bundle(WORDPRESS_SIMPLE);
        verify(&data, |_| true).unwrap();
    }

    #[test]
    fn verify_collects_all_errors() {
        let data = bundle(
            r#"
applications:
  wordpress:
    charm: "cs:precise/Bad_Wolf"
  mysql:
    charm: cs:precise/mysql-28
    num_units: 2
    to: ["0", "nginx/0"]
relations:
  - [wordpress:db, postgres:server]
"#,
        );
        let err = verify(&data, |_| false).unwrap_err();
        let message = err.to_string();
        for want in [
            "invalid charm URL \"cs:precise/Bad_Wolf\"",
            "charm \"cs:precise/mysql-28\" referred to by application \"mysql\" not found",
            "refers to machine \"0\" not defined in this bundle",
            "refers to application \"nginx\" not defined in this bundle",
            "relation endpoint \"postgres:server\" refers to application \"postgres\" not defined in this bundle",
        ] {
            assert!(message.contains(want), "missing {want:?} in {message:?}");
        }
    }

    #[test]
    fn verify_rejects_empty_bundle() {
        let data = bundle("applications: {}\n");
        let err = verify(&data, |_| true).unwrap_err();
        assert!(err.to_string().contains("no applications"));
    }

    #[test]
    fn placement_grammar() {
        assert_eq!(
            parse_placement("new").unwrap(),
            Placement {
                container: None,
                target: Target::New
            }
        );
        assert_eq!(
            parse_placement("lxc:1").unwrap(),
            Placement {
                container: Some("lxc".to_string()),
                target: Target::Machine("1".to_string())
            }
        );
        assert_eq!(
            parse_placement("kvm:new").unwrap().target,
            Target::New
        );
        assert_eq!(
            parse_placement("wordpress/0").unwrap().target,
            Target::Application {
                name: "wordpress".to_string(),
                unit: Some(0)
            }
        );
        assert!(parse_placement("rkt:1").is_err());
        assert!(parse_placement("wordpress/x").is_err());
        assert!(parse_placement("").is_err());
    }

    #[test]
    fn counts_unplaced_units_get_own_machines() {
        let data = bundle(
            r#"
applications:
  wordpress:
    charm: cs:trusty/wordpress
    num_units: 3
  mysql:
    charm: cs:trusty/mysql
    num_units: 2
"#,
        );
        assert_eq!(
            derived_counts(&data),
            Counts {
                machines: 5,
                units: 5
            }
        );
    }

    #[test]
    fn counts_placements() {
        // Machines: 2 declared, one new for mysql, wordpress replicates its
        // trailing "new" for 3 - 2 extra units, haproxy co-locates.
        let data = bundle(
            r#"
machines:
  "1": {}
  "2":
    constraints: mem=8G
applications:
  wordpress:
    charm: cs:trusty/wordpress
    num_units: 3
    to: ["1", "new"]
  mysql:
    charm: cs:trusty/mysql
    num_units: 1
    to: ["lxc:new"]
  haproxy:
    charm: cs:trusty/haproxy
    num_units: 2
    to: ["wordpress/0", "wordpress/1"]
"#,
        );
        assert_eq!(
            derived_counts(&data),
            Counts {
                machines: 2 + 1 + 1 + 1,
                units: 6
            }
        );
    }

    #[test]
    fn counts_container_prefix_on_existing_machine_adds_nothing() {
        let data = bundle(
            r#"
machines:
  "1": {}
applications:
  app:
    charm: cs:trusty/app
    num_units: 2
    to: ["lxc:1", "kvm:1"]
"#,
        );
        assert_eq!(
            derived_counts(&data),
            Counts {
                machines: 1,
                units: 2
            }
        );
    }
}
