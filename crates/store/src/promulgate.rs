//! The promulgation engine: at most one base entity per name owns the
//! canonical numbering at a time. Promoting a base assigns fresh
//! promulgated revisions to its entities that never had one, continuing
//! each series cohort's numbering past the highest ever used; demoting
//! clears the flag but reclaims nothing.

use crate::error::Error;
use crate::{audit, sql, Store};
use charmurl::CharmUrl;
use rusqlite::Connection;
use std::collections::BTreeMap;

impl Store {
    pub fn set_promulgated(&self, url: &CharmUrl, promote: bool) -> Result<(), Error> {
        let session = self.session()?;
        let base_url = url.base();

        let tx = session.unchecked_transaction()?;
        {
            let conn: &Connection = &tx;
            let base =
                sql::get_base(conn, &base_url)?.ok_or_else(|| Error::not_found(&base_url))?;

            if promote {
                let demoted = sql::clear_other_promulgated(conn, base.name(), &base.url)?;
                sql::set_base_promulgated(conn, &base.url, true)?;
                assign_promulgated_urls(conn, &base.url)?;
                tracing::info!(base = %base.url, demoted, "promulgated");
            } else {
                // Entities keep their historical promulgated URLs.
                sql::set_base_promulgated(conn, &base.url, false)?;
            }
            audit::append(
                conn,
                "set-promulgated",
                serde_json::json!({ "id": base.url.to_string(), "promulgated": promote }),
            )?;
        }
        tx.commit()?;

        // Every entity of every base sharing the name may render a
        // different promulgated state now.
        self.sync_name_best_effort(&session, &url.name);
        Ok(())
    }
}

// Assign promulgated URLs to entities of this base that lack one. Each
// series cohort numbers independently, continuing above the highest
// revision any owner ever held, in upload order.
fn assign_promulgated_urls(conn: &Connection, base_url: &CharmUrl) -> Result<(), Error> {
    let pending = sql::entities_without_promulgated_url(conn, base_url)?;

    let mut next_by_series: BTreeMap<String, i32> = BTreeMap::new();
    for entity in &pending {
        let series = entity.url.series.clone();
        if !next_by_series.contains_key(&series) {
            let max = sql::max_promulgated_revision(conn, &entity.url.name, &series)?;
            next_by_series.insert(series.clone(), max + 1);
        }
        let next = next_by_series.get_mut(&series).unwrap();
        let promulgated = CharmUrl {
            user: String::new(),
            series,
            name: entity.url.name.clone(),
            revision: *next,
        };
        sql::update_entity_promulgated(conn, &entity.url, Some(&promulgated), *next)?;
        *next += 1;
    }
    Ok(())
}
