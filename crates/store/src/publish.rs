//! The channel publication engine. Publication is monotonic per
//! channel/series: pointers only move to the entity being published, and
//! publishing to stable also carries the entity into development without
//! stealing pointers an explicit development publish has placed.

use crate::entity::Channel;
use crate::error::Error;
use crate::{audit, sql, Store};
use charmurl::CharmUrl;
use rusqlite::Connection;

impl Store {
    /// Publish an entity to the named channels. Unknown channel names are
    /// dropped; if none remain the call fails with `NoChannels`.
    pub fn publish(&self, url: &CharmUrl, channels: &[&str]) -> Result<(), Error> {
        let session = self.session()?;
        let tx = session.unchecked_transaction()?;
        let base_url = {
            let conn: &Connection = &tx;
            let entity = sql::get_entity(conn, url)?.ok_or_else(|| Error::not_found(url))?;

            let mut requested: Vec<Channel> = channels
                .iter()
                .filter_map(|name| Channel::from_name(name))
                .filter(|channel| *channel != Channel::Unpublished)
                .collect();
            requested.sort();
            requested.dedup();
            if requested.is_empty() {
                return Err(Error::NoChannels);
            }

            let stable_requested = requested.contains(&Channel::Stable);
            let development_requested = requested.contains(&Channel::Development);
            sql::update_entity_flags(
                conn,
                url,
                entity.development || development_requested || stable_requested,
                entity.stable || stable_requested,
            )?;

            let mut base = sql::get_base(conn, &entity.base_url)?
                .ok_or_else(|| Error::not_found(&entity.base_url))?;
            for channel in &requested {
                let pointers = base.channel_current.entry(*channel).or_default();
                for series in entity.all_series() {
                    pointers.insert(series, entity.url.clone());
                }
            }
            sql::update_base_channels(conn, &base.url, &base.channel_current)?;

            audit::append(
                conn,
                "publish",
                serde_json::json!({
                    "id": url.to_string(),
                    "channels": requested.iter().map(Channel::as_str).collect::<Vec<_>>(),
                }),
            )?;
            entity.base_url
        };
        tx.commit()?;

        self.sync_base_best_effort(&session, &base_url);
        Ok(())
    }
}
