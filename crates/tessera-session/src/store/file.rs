//! One file per session under a configured directory.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{RecordMeta, StoreBackend};
use crate::error::{Error, Result};

/// Default file extension for session records.
pub const DEFAULT_EXTENSION: &str = "session";

#[derive(Debug, Clone)]
pub struct FileStoreConfig {
    /// Directory holding session files. Relative paths are resolved
    /// against `work_dir`, or the current directory when unset.
    pub directory: PathBuf,

    pub work_dir: Option<PathBuf>,

    /// Extension appended to the session id, without the dot.
    pub extension: String,
}

impl FileStoreConfig {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            work_dir: None,
            extension: DEFAULT_EXTENSION.to_string(),
        }
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    fn resolved_directory(&self) -> Result<PathBuf> {
        if self.directory.is_absolute() {
            return Ok(self.directory.clone());
        }
        let base = match &self.work_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()?,
        };
        Ok(base.join(&self.directory))
    }
}

/// Stores each session as `<directory>/<id>.<extension>`.
pub struct FileStore {
    directory: PathBuf,
    extension: String,
    /// Serializes all file operations.
    io: Mutex<()>,
}

impl FileStore {
    /// Create a store. The directory is created on first write.
    pub fn new(config: FileStoreConfig) -> Result<Self> {
        let directory = config.resolved_directory()?;
        debug!(directory = %directory.display(), "File session store configured");
        Ok(Self {
            directory,
            extension: config.extension,
            io: Mutex::new(()),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn file_for(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty()
            || id.starts_with('.')
            || id.contains(['/', '\\'])
            || id.contains("..")
        {
            return Err(Error::InvalidId(id.to_string()));
        }
        Ok(self.directory.join(format!("{id}.{}", self.extension)))
    }
}

impl StoreBackend for FileStore {
    fn name(&self) -> &str {
        "file"
    }

    fn keys(&self) -> Result<Vec<String>> {
        let _io = self.io.lock();
        let entries = match fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let suffix = format!(".{}", self.extension);
        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            if let Some(id) = name.to_str().and_then(|n| n.strip_suffix(&suffix))
                && !id.is_empty()
            {
                keys.push(id.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn clear(&self) -> Result<()> {
        for id in self.keys()? {
            self.remove(&id)?;
        }
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<()> {
        let path = self.file_for(id)?;
        let _io = self.io.lock();
        match fs::remove_file(&path) {
            Ok(()) => {
                trace!(path = %path.display(), "Removed session file");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn read(&self, id: &str) -> Result<Option<Vec<u8>>> {
        let path = self.file_for(id)?;
        let _io = self.io.lock();
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, meta: &RecordMeta, data: &[u8]) -> Result<()> {
        let path = self.file_for(&meta.id)?;
        let _io = self.io.lock();
        fs::create_dir_all(&self.directory)?;
        let tmp = path.with_extension(format!("{}.tmp", self.extension));
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        trace!(path = %path.display(), bytes = data.len(), "Wrote session file");
        Ok(())
    }
}
