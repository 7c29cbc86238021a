mod bundle;
mod meta;
mod series;

pub use bundle::{
    derived_counts, parse_placement, verify as verify_bundle, ApplicationSpec, BundleData,
    Counts, MachineId, MachineSpec, Placement, Target,
};
pub use meta::{
    ActionSpec, Actions, CharmMeta, ConfigOption, ConfigSchema, Relation, RelationScope,
};
pub use series::{known_series, os_family, OsFamily};

use charmurl::CharmUrl;
use serde::{Deserialize, Serialize};
use std::io::{Read, Seek, Write};
use zip::result::ZipError;
use zip::{CompressionMethod, ZipArchive};

// Entities arrive as zip containers. This crate decides whether a
// container is a charm or a bundle, extracts and validates the documents
// inside, rewrites multi-series archives for older clients, and locates
// entries for direct range reads out of stored blobs.

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("cannot read archive: {0}")]
    ZipFormat(String),
    #[error("unsupported compression algorithm for {0:?}")]
    ZipAlgorithm(String),
    #[error("checksum mismatch reading {0:?}")]
    ZipChecksum(String),
    #[error("archive has no {0:?} file")]
    MissingFile(&'static str),
    #[error("relation {0:?} uses a reserved template name")]
    BannedRelation(String),
    #[error("interface {0:?} uses a reserved template name")]
    BannedInterface(String),
    #[error("unrecognized series {0:?} in metadata")]
    UnrecognizedSeries(String),
    #[error("cannot mix series of different operating systems")]
    MixedOsFamilies,
    #[error("bundle verification failed: {0}")]
    Verification(String),
    #[error("cannot parse {name}: {source}")]
    Document {
        name: &'static str,
        #[source]
        source: serde_yaml::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A charm read out of its container.
#[derive(Debug, Clone, PartialEq)]
pub struct CharmArchive {
    pub meta: CharmMeta,
    pub config: Option<ConfigSchema>,
    pub actions: Option<Actions>,
}

/// A bundle read out of its container.
#[derive(Debug, Clone, PartialEq)]
pub struct BundleArchive {
    pub data: BundleData,
    pub readme: String,
}

/// The location of one file inside a stored archive blob, sufficient for a
/// direct range read without re-parsing the central directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZipPart {
    pub offset: u64,
    pub compressed_size: u64,
    pub size: u64,
    pub deflated: bool,
}

/// Read and validate a charm container: `metadata.yaml` is required,
/// `config.yaml` and `actions.yaml` are optional, and every entry must use
/// a supported compression method with an intact checksum.
pub fn read_charm<R: Read + Seek>(reader: R) -> Result<CharmArchive, Error> {
    let mut zip = open_container(reader)?;
    validate_entries(&mut zip)?;

    let meta = match read_entry(&mut zip, "metadata.yaml")? {
        Some(body) => parse_document::<CharmMeta>("metadata.yaml", &body)?,
        None => return Err(Error::MissingFile("metadata.yaml")),
    };
    let config = read_entry(&mut zip, "config.yaml")?
        .map(|body| parse_document::<ConfigSchema>("config.yaml", &body))
        .transpose()?;
    let actions = read_entry(&mut zip, "actions.yaml")?
        .map(|body| parse_document::<Actions>("actions.yaml", &body))
        .transpose()?;

    meta.validate()?;
    Ok(CharmArchive {
        meta,
        config,
        actions,
    })
}

/// Read and verify a bundle container: `bundle.yaml` and a root README are
/// required. `charm_exists` answers whether a charm referenced by the
/// bundle is known to the host store; verification collects every problem
/// before failing.
pub fn read_bundle<R: Read + Seek>(
    reader: R,
    charm_exists: impl FnMut(&CharmUrl) -> bool,
) -> Result<BundleArchive, Error> {
    let mut zip = open_container(reader)?;
    validate_entries(&mut zip)?;

    let data = match read_entry(&mut zip, "bundle.yaml")? {
        Some(body) => parse_document::<BundleData>("bundle.yaml", &body)?,
        None => return Err(Error::MissingFile("bundle.yaml")),
    };

    let readme_name = (0..zip.len())
        .filter_map(|i| {
            let entry = zip.by_index_raw(i).ok()?;
            let name = entry.name();
            (!name.contains('/') && name.to_ascii_uppercase().starts_with("README"))
                .then(|| name.to_string())
        })
        .next()
        .ok_or(Error::MissingFile("README"))?;
    let readme = read_entry(&mut zip, &readme_name)?.unwrap_or_default();
    let readme = String::from_utf8_lossy(&readme).into_owned();

    verify_bundle(&data, charm_exists)?;
    Ok(BundleArchive { data, readme })
}

/// Find the first central-directory entry whose name satisfies the
/// predicate, returning where its (possibly compressed) bytes live.
pub fn locate_entry<R: Read + Seek>(
    reader: R,
    mut predicate: impl FnMut(&str) -> bool,
) -> Result<Option<ZipPart>, Error> {
    let mut zip = open_container(reader)?;
    for i in 0..zip.len() {
        let entry = zip
            .by_index_raw(i)
            .map_err(|err| map_zip_error(err, "<entry>"))?;
        if entry.is_dir() || !predicate(entry.name()) {
            continue;
        }
        let deflated = match entry.compression() {
            CompressionMethod::Stored => false,
            CompressionMethod::Deflated => true,
            _ => return Err(Error::ZipAlgorithm(entry.name().to_string())),
        };
        return Ok(Some(ZipPart {
            offset: entry.data_start(),
            compressed_size: entry.compressed_size(),
            size: entry.size(),
            deflated,
        }));
    }
    Ok(None)
}

/// A range read over one archive entry previously found by `locate_entry`.
#[derive(Debug)]
pub enum PartReader<R: Read> {
    Stored(std::io::Take<R>),
    Deflated(flate2::read::DeflateDecoder<std::io::Take<R>>),
}

impl<R: Read> Read for PartReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            PartReader::Stored(r) => r.read(buf),
            PartReader::Deflated(r) => r.read(buf),
        }
    }
}

/// Open a reader over the entry bytes recorded in `part`, inflating when
/// the entry was stored deflated.
pub fn part_reader<R: Read + Seek>(mut reader: R, part: &ZipPart) -> Result<PartReader<R>, Error> {
    reader.seek(std::io::SeekFrom::Start(part.offset))?;
    let raw = reader.take(part.compressed_size);
    Ok(if part.deflated {
        PartReader::Deflated(flate2::read::DeflateDecoder::new(raw))
    } else {
        PartReader::Stored(raw)
    })
}

/// Rewrite a multi-series charm archive for clients that do not understand
/// multi-series metadata: entries are copied through unchanged except for
/// `metadata.yaml`, which loses its `series` list. Output is deterministic
/// for a given input.
pub fn rewrite_compat<R: Read + Seek, W: Write + Seek>(
    reader: R,
    writer: W,
) -> Result<(), Error> {
    let mut zip = open_container(reader)?;
    let mut out = zip::ZipWriter::new(writer);

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).map_err(|err| map_zip_error(err, "<entry>"))?;
        let name = entry.name().to_string();
        let method = match entry.compression() {
            CompressionMethod::Stored => CompressionMethod::Stored,
            CompressionMethod::Deflated => CompressionMethod::Deflated,
            _ => return Err(Error::ZipAlgorithm(name)),
        };
        let options = zip::write::FileOptions::default()
            .compression_method(method)
            .last_modified_time(zip::DateTime::default());

        if entry.is_dir() {
            out.add_directory(name, options).map_err(map_write_error)?;
            continue;
        }
        if name == "metadata.yaml" {
            let mut body = String::new();
            entry
                .read_to_string(&mut body)
                .map_err(|err| map_entry_read_error(err, "metadata.yaml"))?;
            let mut doc: serde_yaml::Value = serde_yaml::from_str(&body).map_err(|source| {
                Error::Document {
                    name: "metadata.yaml",
                    source,
                }
            })?;
            if let Some(mapping) = doc.as_mapping_mut() {
                mapping.remove(&serde_yaml::Value::String("series".to_string()));
            }
            let body = serde_yaml::to_string(&doc).map_err(|source| Error::Document {
                name: "metadata.yaml",
                source,
            })?;
            out.start_file(name, options).map_err(map_write_error)?;
            out.write_all(body.as_bytes())?;
        } else {
            out.start_file(name.clone(), options).map_err(map_write_error)?;
            std::io::copy(&mut entry, &mut out)
                .map_err(|err| map_entry_read_error(err, &name))?;
        }
    }
    out.finish().map_err(map_write_error)?;
    Ok(())
}

fn map_write_error(err: ZipError) -> Error {
    match err {
        ZipError::Io(err) => Error::Io(err),
        other => Error::ZipFormat(other.to_string()),
    }
}

fn open_container<R: Read + Seek>(reader: R) -> Result<ZipArchive<R>, Error> {
    ZipArchive::new(reader).map_err(|err| match err {
        ZipError::Io(err) => Error::Io(err),
        other => Error::ZipFormat(other.to_string()),
    })
}

// Every entry must use a supported method and carry an intact checksum.
fn validate_entries<R: Read + Seek>(zip: &mut ZipArchive<R>) -> Result<(), Error> {
    for i in 0..zip.len() {
        let name = {
            let entry = zip
                .by_index_raw(i)
                .map_err(|err| map_zip_error(err, "<entry>"))?;
            match entry.compression() {
                CompressionMethod::Stored | CompressionMethod::Deflated => {}
                _ => return Err(Error::ZipAlgorithm(entry.name().to_string())),
            }
            entry.name().to_string()
        };
        let mut entry = zip.by_index(i).map_err(|err| map_zip_error(err, &name))?;
        let mut sink = std::io::sink();
        std::io::copy(&mut entry, &mut sink)
            .map_err(|err| map_entry_read_error(err, &name))?;
    }
    Ok(())
}

fn read_entry<R: Read + Seek>(
    zip: &mut ZipArchive<R>,
    name: &str,
) -> Result<Option<Vec<u8>>, Error> {
    let mut entry = match zip.by_name(name) {
        Ok(entry) => entry,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(err) => return Err(map_zip_error(err, name)),
    };
    let mut body = Vec::new();
    entry
        .read_to_end(&mut body)
        .map_err(|err| map_entry_read_error(err, name))?;
    Ok(Some(body))
}

fn parse_document<T: serde::de::DeserializeOwned>(
    name: &'static str,
    body: &[u8],
) -> Result<T, Error> {
    serde_yaml::from_slice(body).map_err(|source| Error::Document { name, source })
}

fn map_zip_error(err: ZipError, name: &str) -> Error {
    match err {
        ZipError::UnsupportedArchive(_) => Error::ZipAlgorithm(name.to_string()),
        ZipError::Io(err) => map_entry_read_error(err, name),
        other => Error::ZipFormat(other.to_string()),
    }
}

// The container reader surfaces CRC mismatches as io errors at entry EOF.
fn map_entry_read_error(err: std::io::Error, name: &str) -> Error {
    if err.to_string().to_ascii_lowercase().contains("checksum") {
        Error::ZipChecksum(name.to_string())
    } else {
        Error::Io(err)
    }
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    //! Zip fixture builders shared by this crate's tests and by crates
    //! testing against real archives.

    use std::io::{Cursor, Write};
    use zip::write::FileOptions;
    use zip::CompressionMethod;

    pub struct ZipBuilder {
        files: Vec<(String, Vec<u8>, CompressionMethod)>,
    }

    impl ZipBuilder {
        pub fn new() -> ZipBuilder {
            ZipBuilder { files: Vec::new() }
        }

        pub fn file(mut self, name: &str, body: impl AsRef<[u8]>) -> ZipBuilder {
            self.files.push((
                name.to_string(),
                body.as_ref().to_vec(),
                CompressionMethod::Deflated,
            ));
            self
        }

        pub fn stored_file(mut self, name: &str, body: impl AsRef<[u8]>) -> ZipBuilder {
            self.files.push((
                name.to_string(),
                body.as_ref().to_vec(),
                CompressionMethod::Stored,
            ));
            self
        }

        pub fn build(self) -> Vec<u8> {
            let mut out = zip::ZipWriter::new(Cursor::new(Vec::new()));
            for (name, body, method) in self.files {
                let options = FileOptions::default()
                    .compression_method(method)
                    .last_modified_time(zip::DateTime::default());
                out.start_file(name, options).unwrap();
                out.write_all(&body).unwrap();
            }
            out.finish().unwrap().into_inner()
        }
    }

    impl Default for ZipBuilder {
        fn default() -> Self {
            Self::new()
        }
    }

    /// A minimal charm archive around the given `metadata.yaml` body.
    pub fn charm_archive(metadata: &str) -> Vec<u8> {
        ZipBuilder::new()
            .file("metadata.yaml", metadata)
            .file("README.md", "A charm.\n")
            .file("hooks/install", "#!/bin/sh\nexit 0\n")
            .build()
    }

    /// A minimal bundle archive around the given `bundle.yaml` body.
    pub fn bundle_archive(bundle: &str, readme: &str) -> Vec<u8> {
        ZipBuilder::new()
            .file("bundle.yaml", bundle)
            .file("README.md", readme)
            .build()
    }
}
