use std::path::Path;

use crate::{Error, Result};

/// Fails with [`Error::Configuration`] unless `path` points to an existing file.
pub fn ensure_file(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if path.is_file() {
        Ok(())
    } else {
        Err(Error::configuration(format!(
            "file not found: {}",
            path.display()
        )))
    }
}
