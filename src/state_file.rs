use std::fs;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::Result;

/// JSON-on-disk persistence for small pieces of device-local state (the
/// session token cache, the favorites mirror). Writes go through a tmp file
/// and a rename where the filesystem allows it.
#[derive(Debug, Clone)]
pub struct StateFile<T> {
    path: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T> StateFile<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file reads as `T::default()`.
    pub fn load(&self) -> Result<T> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(T::default());
            }
            Err(err) => return Err(err.into()),
        };
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn save(&self, value: &T) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let payload = serde_json::to_vec_pretty(value)?;
        let tmp_path = self.path.with_extension("tmp");

        if fs::write(&tmp_path, &payload).is_err() {
            fs::write(&self.path, &payload)?;
            return Ok(());
        }

        match fs::rename(&tmp_path, &self.path) {
            Ok(()) => Ok(()),
            Err(_) => {
                fs::write(&self.path, &payload)?;
                let _ = fs::remove_file(&tmp_path);
                Ok(())
            }
        }
    }

    /// Removes the file; a missing file is not an error.
    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
