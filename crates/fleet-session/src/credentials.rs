//! Directory-backed credential persistence.
//!
//! The protocol layer hands over credentials as an opaque set of named blobs.
//! Each blob is stored as one file inside the instance's credentials
//! directory; rotations only rewrite the entries they carry.

use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};

use tracing::debug;

use crate::{fsio, SessionError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialSet {
    entries: BTreeMap<String, Vec<u8>>,
}

impl CredentialSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.entries.insert(name.into(), bytes.into());
    }

    pub fn with_entry(mut self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.insert(name, bytes);
        self
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.entries.get(name).map(Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries
            .iter()
            .map(|(name, bytes)| (name.as_str(), bytes.as_slice()))
    }

    /// Overlays `other` onto this set; entries absent from `other` are kept.
    pub fn merge(&mut self, other: &CredentialSet) {
        for (name, bytes) in other.iter() {
            self.entries.insert(name.to_string(), bytes.to_vec());
        }
    }
}

#[derive(Debug, Clone)]
pub struct CredentialStore {
    dir: PathBuf,
}

impl CredentialStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns `None` when no credentials were ever stored, which means the
    /// next connection has to go through pairing.
    pub fn load(&self) -> Result<Option<CredentialSet>, SessionError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(SessionError::io(&self.dir, err)),
        };

        let mut set = CredentialSet::new();
        for entry in entries {
            let entry = entry.map_err(|err| SessionError::io(&self.dir, err))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let bytes = fs::read(&path).map_err(|err| SessionError::io(&path, err))?;
            set.insert(name, bytes);
        }

        if set.is_empty() {
            Ok(None)
        } else {
            debug!(dir = %self.dir.display(), entries = set.len(), "loaded credentials");
            Ok(Some(set))
        }
    }

    /// Writes every entry of `set`. Entries already on disk but absent from
    /// `set` are left untouched.
    pub fn save(&self, set: &CredentialSet) -> Result<(), SessionError> {
        for (name, _) in set.iter() {
            validate_entry_name(name)?;
        }
        fs::create_dir_all(&self.dir).map_err(|err| SessionError::io(&self.dir, err))?;
        for (name, bytes) in set.iter() {
            fsio::write_atomic(&self.dir.join(name), bytes)?;
        }
        Ok(())
    }

    pub fn has_credentials(&self) -> bool {
        matches!(self.load(), Ok(Some(_)))
    }

    /// Removes the whole store. Clearing an absent store is not an error.
    pub fn clear(&self) -> Result<(), SessionError> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(SessionError::io(&self.dir, err)),
        }
    }
}

fn validate_entry_name(name: &str) -> Result<(), SessionError> {
    let invalid = name.is_empty()
        || name.starts_with('.')
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0');
    if invalid {
        Err(SessionError::InvalidCredentialName(name.to_string()))
    } else {
        Ok(())
    }
}
