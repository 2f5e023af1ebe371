//! Durable allocation table and the versioned JSON files behind it.
//!
//! The table is written as versioned JSON next to the agent state:
//!
//! ```json
//! {"version": 1, "entries": [{"instance_id": "...", "handles": [...]}]}
//! ```
//!
//! Writes go to `<path>.tmp` first and are renamed over the previous file, so a crash
//! mid-write leaves either the old table or the new one on disk.

use std::fs;
use std::io;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use api_types::AllocationEntry;
use error_stack::Report;
use error_stack::ResultExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::table::AllocationTable;
use super::table::DeviceHandle;

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to serialize state file")]
    Serialize,
    #[error("failed to write state file {path}")]
    Write { path: String },
}

/// Result of reading a versioned state file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome<T> {
    Loaded(T),
    Missing,
    Corrupt(String),
    UnsupportedVersion(u32),
}

impl<T> LoadOutcome<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> LoadOutcome<U> {
        match self {
            LoadOutcome::Loaded(value) => LoadOutcome::Loaded(f(value)),
            LoadOutcome::Missing => LoadOutcome::Missing,
            LoadOutcome::Corrupt(reason) => LoadOutcome::Corrupt(reason),
            LoadOutcome::UnsupportedVersion(version) => LoadOutcome::UnsupportedVersion(version),
        }
    }

    /// The loaded value, or `T::default()` after logging why nothing was loaded.
    pub fn or_empty(self, path: &Path) -> T
    where
        T: Default,
    {
        match self {
            LoadOutcome::Loaded(value) => value,
            LoadOutcome::Missing => {
                info!(path = %path.display(), "no state file on disk, starting empty");
                T::default()
            }
            LoadOutcome::Corrupt(reason) => {
                error!(path = %path.display(), reason = %reason, "state file is unreadable, starting empty");
                T::default()
            }
            LoadOutcome::UnsupportedVersion(version) => {
                warn!(path = %path.display(), version, "state file has unsupported version, starting empty");
                T::default()
            }
        }
    }
}

#[derive(Serialize)]
struct Versioned<'a, T> {
    version: u32,
    #[serde(flatten)]
    body: &'a T,
}

#[derive(Deserialize)]
struct VersionHeader {
    version: u32,
}

/// Read a `{"version": 1, ...}` file. The remaining fields decode into `T`.
pub fn read_versioned<T: DeserializeOwned>(path: &Path) -> LoadOutcome<T> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return LoadOutcome::Missing,
        Err(e) => return LoadOutcome::Corrupt(e.to_string()),
    };

    let header: VersionHeader = match serde_json::from_str(&raw) {
        Ok(header) => header,
        Err(e) => return LoadOutcome::Corrupt(e.to_string()),
    };
    if header.version != FORMAT_VERSION {
        return LoadOutcome::UnsupportedVersion(header.version);
    }

    match serde_json::from_str::<T>(&raw) {
        Ok(value) => LoadOutcome::Loaded(value),
        Err(e) => LoadOutcome::Corrupt(e.to_string()),
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Replace `path` with `body` plus the format version, through `<path>.tmp`.
///
/// # Errors
///
/// - [`StoreError::Serialize`] if `body` cannot be encoded
/// - [`StoreError::Write`] if the temporary file cannot be written or renamed
pub fn write_versioned<T: Serialize>(path: &Path, body: &T) -> Result<(), Report<StoreError>> {
    let bytes = serde_json::to_vec_pretty(&Versioned {
        version: FORMAT_VERSION,
        body,
    })
    .change_context(StoreError::Serialize)?;

    let write_error = || StoreError::Write {
        path: path.display().to_string(),
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).change_context_lazy(write_error)?;
    }

    let tmp = tmp_path(path);
    {
        let mut file = fs::File::create(&tmp).change_context_lazy(write_error)?;
        file.write_all(&bytes).change_context_lazy(write_error)?;
        file.sync_all().change_context_lazy(write_error)?;
    }
    fs::rename(&tmp, path).change_context_lazy(write_error)?;
    Ok(())
}

#[derive(Serialize)]
struct PersistedTableRef<'a, H> {
    entries: Vec<AllocationEntryRef<'a, H>>,
}

#[derive(Serialize)]
struct AllocationEntryRef<'a, H> {
    instance_id: &'a str,
    handles: &'a [H],
}

#[derive(Deserialize)]
struct PersistedTable<H> {
    entries: Vec<AllocationEntry<H>>,
}

/// File-backed allocation table.
#[derive(Debug, Clone)]
pub struct AllocationStore {
    path: PathBuf,
}

impl AllocationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the table and say what was found.
    pub fn load_outcome<H: DeviceHandle>(&self) -> LoadOutcome<AllocationTable<H>> {
        read_versioned::<PersistedTable<H>>(&self.path).map(|table| {
            table
                .entries
                .into_iter()
                .map(|entry| (entry.instance_id, entry.handles))
                .collect()
        })
    }

    /// Read the table, treating anything unreadable as empty.
    pub fn load<H: DeviceHandle>(&self) -> AllocationTable<H> {
        let table = self.load_outcome::<H>().or_empty(&self.path);
        info!(path = %self.path.display(), entries = table.len(), "loaded allocation table");
        table
    }

    /// Replace the table on disk.
    ///
    /// # Errors
    ///
    /// See [`write_versioned`].
    pub fn save<H: DeviceHandle>(&self, table: &AllocationTable<H>) -> Result<(), Report<StoreError>> {
        write_versioned(
            &self.path,
            &PersistedTableRef {
                entries: table
                    .iter()
                    .map(|(instance_id, handles)| AllocationEntryRef {
                        instance_id,
                        handles,
                    })
                    .collect(),
            },
        )
    }
}
