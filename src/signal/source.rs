use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::debug;

use crate::signal::HolterError;

/// Something raw capture blobs can be fetched from by object key.
pub trait BlobSource {
    fn fetch(&self, key: &str) -> Result<Vec<u8>, HolterError>;
}

/// Something processed artifacts can be written to by object key.
pub trait ArtifactSink {
    fn put(&mut self, key: &str, content_type: &str, bytes: &[u8]) -> Result<(), HolterError>;
}

/// Keys map to paths below `root`.
#[derive(Clone, Debug)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl BlobSource for DirectorySource {
    fn fetch(&self, key: &str) -> Result<Vec<u8>, HolterError> {
        let path = key_path(&self.root, key)?;
        debug!("reading blob {}", path.display());
        Ok(fs::read(path)?)
    }
}

#[derive(Clone, Debug, Default)]
pub struct MemorySource {
    blobs: HashMap<String, Vec<u8>>,
}

impl MemorySource {
    pub fn new(blobs: impl IntoIterator<Item = (String, Vec<u8>)>) -> Self {
        Self {
            blobs: blobs.into_iter().collect(),
        }
    }
    pub fn insert(&mut self, key: impl Into<String>, bytes: Vec<u8>) {
        self.blobs.insert(key.into(), bytes);
    }
}

impl BlobSource for MemorySource {
    fn fetch(&self, key: &str) -> Result<Vec<u8>, HolterError> {
        self.blobs.get(key).cloned().ok_or_else(|| {
            HolterError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no blob stored under {key}"),
            ))
        })
    }
}

#[derive(Clone, Debug)]
pub struct DirectorySink {
    root: PathBuf,
}

impl DirectorySink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ArtifactSink for DirectorySink {
    fn put(&mut self, key: &str, content_type: &str, bytes: &[u8]) -> Result<(), HolterError> {
        let path = key_path(&self.root, key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, bytes)?;
        debug!("wrote {} ({content_type}, {} bytes)", path.display(), bytes.len());
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredArtifact {
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// Keeps everything in memory, ordered by key.
#[derive(Clone, Debug, Default)]
pub struct MemorySink {
    pub objects: BTreeMap<String, StoredArtifact>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn get(&self, key: &str) -> Option<&StoredArtifact> {
        self.objects.get(key)
    }
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.objects.keys().map(String::as_str)
    }
}

impl ArtifactSink for MemorySink {
    fn put(&mut self, key: &str, content_type: &str, bytes: &[u8]) -> Result<(), HolterError> {
        self.objects.insert(
            key.to_string(),
            StoredArtifact {
                content_type: content_type.to_string(),
                bytes: bytes.to_vec(),
            },
        );
        Ok(())
    }
}

fn key_path(root: &Path, key: &str) -> Result<PathBuf, HolterError> {
    let relative = Path::new(key);
    let escapes = relative.components().any(|component| {
        !matches!(component, std::path::Component::Normal(_))
    });
    if key.is_empty() || escapes {
        return Err(HolterError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("object key {key:?} is not a plain relative path"),
        )));
    }
    Ok(root.join(relative))
}

/// `raw/YYYY/MM/DD/<device>/<session>.bin`, dated in UTC.
pub fn raw_object_key(start_epoch_s: i64, device: &str, session: &str) -> String {
    let date: DateTime<Utc> = DateTime::from_timestamp(start_epoch_s, 0).unwrap_or_default();
    format!("raw/{}/{device}/{session}.bin", date.format("%Y/%m/%d"))
}

/// Prefix for processed artifacts derived from a raw key.
pub fn processed_base_key(raw_key: &str) -> String {
    let stem = raw_key.strip_suffix(".bin").unwrap_or(raw_key);
    match stem.strip_prefix("raw/") {
        Some(rest) => format!("processed/{rest}"),
        None => stem.to_string(),
    }
}
