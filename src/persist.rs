use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::{self, Write};
use std::path::Path;

use tempfile::NamedTempFile;

use crate::error::{io_context, ForgeError};

/// Writes `contents` next to `path` and renames it into place, so readers
/// only ever observe the old file or the complete new one.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), ForgeError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)
        .map_err(io_context(format!("Failed to create {}", parent.display())))?;
    let mut temp = NamedTempFile::new_in(parent)
        .map_err(io_context(format!("Failed to stage {}", path.display())))?;
    temp.write_all(contents)
        .and_then(|_| temp.as_file().sync_all())
        .map_err(io_context(format!("Failed to write {}", path.display())))?;
    temp.persist(path).map_err(|err| ForgeError::Io {
        context: format!("Failed to replace {}", path.display()),
        source: err.error,
    })?;
    Ok(())
}

pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), ForgeError> {
    let mut rendered = serde_json::to_vec_pretty(value).map_err(|err| ForgeError::Io {
        context: format!("Failed to serialize {}", path.display()),
        source: io::Error::new(io::ErrorKind::InvalidData, err),
    })?;
    rendered.push(b'\n');
    write_atomic(path, &rendered)
}

/// Reads a JSON document, returning `None` when the file does not exist.
pub(crate) fn read_json_opt<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, ForgeError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(ForgeError::Io {
                context: format!("Failed to read {}", path.display()),
                source: err,
            })
        }
    };
    let mut deserializer = serde_json::Deserializer::from_str(&content);
    let value = serde_path_to_error::deserialize(&mut deserializer).map_err(|err| {
        ForgeError::Io {
            context: format!("Failed to parse {} at {}", path.display(), err.path()),
            source: io::Error::new(io::ErrorKind::InvalidData, err.into_inner()),
        }
    })?;
    Ok(Some(value))
}
