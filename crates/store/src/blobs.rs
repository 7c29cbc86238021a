//! Blob access for stored entities: whole-archive reads (primary and
//! pre-compat), and range reads of single in-archive files through the
//! per-entity `contents` cache.

use crate::error::Error;
use crate::{sql, Store};
use charmurl::CharmUrl;
use std::fs::File;

/// Logical id of the cached icon file.
pub const FILE_ICON: &str = "icon";
/// Logical id of the cached README file.
pub const FILE_README: &str = "readme";

impl Store {
    /// Open the entity's archive blob, returning the reader with the
    /// stored hash and size.
    pub fn open_blob(&self, url: &CharmUrl) -> Result<(File, String, i64), Error> {
        let session = self.session()?;
        let entity = sql::get_entity(&session, url)?.ok_or_else(|| Error::not_found(url))?;
        let (file, _) = self.blobs.open(&entity.blob_name).map_err(Error::from)?;
        Ok((file, entity.blob_hash, entity.blob_size))
    }

    /// Open the blob served to clients that cannot read multi-series
    /// metadata. Identical to the primary blob except for multi-series
    /// charms.
    pub fn open_blob_pre_v5(&self, url: &CharmUrl) -> Result<(File, String, i64), Error> {
        let session = self.session()?;
        let entity = sql::get_entity(&session, url)?.ok_or_else(|| Error::not_found(url))?;
        let (file, _) = self
            .blobs
            .open(&entity.prev5_blob_name)
            .map_err(Error::from)?;
        Ok((file, entity.prev5_blob_hash, entity.prev5_blob_size))
    }

    /// Stream one file out of an entity's archive, locating it with
    /// `predicate` on first use and caching the location (or its absence)
    /// under `file_id`. Once a miss is recorded, later calls
    /// short-circuit without re-running the predicate.
    pub fn open_cached_file(
        &self,
        url: &CharmUrl,
        file_id: &str,
        predicate: impl FnMut(&str) -> bool,
    ) -> Result<archive::PartReader<File>, Error> {
        let session = self.session()?;
        let entity = sql::get_entity(&session, url)?.ok_or_else(|| Error::not_found(url))?;

        let part = match entity.contents.get(file_id) {
            Some(Some(part)) => part.clone(),
            Some(None) => {
                return Err(Error::not_found(format_args!("file {file_id:?} in {url}")))
            }
            None => {
                let (file, _) = self.blobs.open(&entity.blob_name).map_err(Error::from)?;
                let located = archive::locate_entry(file, predicate)?;

                let mut contents = entity.contents.clone();
                contents.insert(file_id.to_string(), located.clone());
                sql::update_entity_contents(&session, url, &contents)?;

                located.ok_or_else(|| {
                    Error::not_found(format_args!("file {file_id:?} in {url}"))
                })?
            }
        };

        let (file, _) = self.blobs.open(&entity.blob_name).map_err(Error::from)?;
        Ok(archive::part_reader(file, &part)?)
    }

    /// The entity's icon (`icon.svg` at the archive root).
    pub fn open_icon(&self, url: &CharmUrl) -> Result<archive::PartReader<File>, Error> {
        self.open_cached_file(url, FILE_ICON, |name| name == "icon.svg")
    }

    /// The entity's README (any root file named `README*`).
    pub fn open_readme(&self, url: &CharmUrl) -> Result<archive::PartReader<File>, Error> {
        self.open_cached_file(url, FILE_README, |name| {
            !name.contains('/') && name.to_ascii_uppercase().starts_with("README")
        })
    }
}
