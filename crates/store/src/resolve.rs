//! Resolution of user-supplied, possibly partial identifiers to the
//! single best matching entity. Read-only; the only failure is a miss.

use crate::entity::{BaseEntity, Channel, Entity, Kind};
use crate::error::Error;
use crate::{sql, Store};
use charmurl::{CharmUrl, ResolvedUrl, BUNDLE_SERIES};
use rusqlite::Connection;
use std::collections::BTreeMap;

impl Store {
    /// Resolve a query to the best matching entity. Any of user, series,
    /// and revision may be unset; without a user only promulgated
    /// entities are considered, against the canonical numbering.
    pub fn resolve(&self, query: &CharmUrl) -> Result<(ResolvedUrl, Entity), Error> {
        let session = self.session()?;
        resolve_in(&session, query)
    }
}

pub(crate) fn resolve_in(
    conn: &Connection,
    query: &CharmUrl,
) -> Result<(ResolvedUrl, Entity), Error> {
    let user = (!query.user.is_empty()).then_some(query.user.as_str());
    let candidates = sql::candidates_by_name(conn, &query.name, user)?;

    let mut bases: BTreeMap<String, Option<BaseEntity>> = BTreeMap::new();
    let mut best: Option<((u8, u8, i32), Entity)> = None;
    for entity in candidates {
        if !eligible(query, &entity) {
            continue;
        }
        let key = rank(conn, query, &entity, &mut bases)?;
        let better = match &best {
            None => true,
            Some((best_key, _)) => key > *best_key,
        };
        if better {
            best = Some((key, entity));
        }
    }
    best.map(|(_, entity)| (entity.resolved(), entity))
        .ok_or_else(|| Error::not_found(query))
}

fn eligible(query: &CharmUrl, entity: &Entity) -> bool {
    // User handled by the candidate query; revisions compare against the
    // owned or promulgated numbering depending on how we were asked.
    if query.revision != -1 {
        let revision = if query.user.is_empty() {
            entity.promulgated_revision
        } else {
            entity.url.revision
        };
        if revision != query.revision {
            return false;
        }
    }

    if !query.series.is_empty() {
        match &entity.kind {
            Kind::Bundle { .. } => query.series == BUNDLE_SERIES,
            Kind::Charm {
                supported_series, ..
            } if entity.url.series.is_empty() => supported_series.contains(&query.series),
            Kind::Charm { .. } => entity.url.series == query.series,
        }
    } else if query.revision != -1 {
        // Fully qualified by revision but series-less: only entities
        // that are themselves series-less qualify.
        entity.is_multi_series() || entity.is_bundle()
    } else {
        // A bare name matches only entities published somewhere.
        entity.development || entity.stable
    }
}

// The winner is picked by channel (stable > development > unpublished),
// then by serving the requested series, then by the highest relevant
// revision.
fn rank(
    conn: &Connection,
    query: &CharmUrl,
    entity: &Entity,
    bases: &mut BTreeMap<String, Option<BaseEntity>>,
) -> Result<(u8, u8, i32), Error> {
    let channel_rank = if entity.stable {
        2
    } else if entity.development {
        1
    } else {
        0
    };

    let series_rank = if query.series.is_empty() {
        0
    } else if entity.is_multi_series() {
        // A multi-series charm serves the requested series best when its
        // base currently publishes it for that series.
        let base_key = entity.base_url.to_string();
        if !bases.contains_key(&base_key) {
            let loaded = sql::get_base(conn, &entity.base_url)?;
            bases.insert(base_key.clone(), loaded);
        }
        let base = bases.get(&base_key).unwrap();
        let published = [Channel::Stable, Channel::Development]
            .iter()
            .filter(|channel| entity.in_channel(**channel))
            .any(|channel| {
                base.as_ref()
                    .and_then(|b| b.current(*channel, &query.series))
                    == Some(&entity.url)
            });
        u8::from(published)
    } else {
        // Single-series charms and bundles serve exactly their series.
        1
    };

    let revision = if query.user.is_empty() {
        entity.promulgated_revision
    } else {
        entity.url.revision
    };

    Ok((channel_rank, series_rank, revision))
}
