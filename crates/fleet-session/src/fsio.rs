use std::{fs, io, path::Path};

use crate::SessionError;

/// Writes `bytes` next to `path` and renames it into place so readers never
/// observe a partially written file.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), SessionError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|err| SessionError::io(parent, err))?;
        }
    }
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));
    fs::write(&tmp, bytes).map_err(|err| SessionError::io(&tmp, err))?;
    fs::rename(&tmp, path).map_err(|err| SessionError::io(path, err))
}

/// Removes a file, treating an already-absent file as success.
pub(crate) fn remove_if_exists(path: &Path) -> Result<(), SessionError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(SessionError::io(path, err)),
    }
}
