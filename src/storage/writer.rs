//! Cassette file creation

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};

use crate::Result;

/// Create a new cassette file, never overwriting an existing one
///
/// `stem` is tried first, then `stem_1`, `stem_2`, ... until an exclusive
/// create succeeds.
///
/// # Errors
///
/// Returns error if creating the file fails for a reason other than the name
/// being taken
pub async fn create_cassette(dir: &Path, stem: &str) -> Result<(PathBuf, File)> {
    let mut attempt = 0u32;
    loop {
        let name = if attempt == 0 {
            stem.to_string()
        } else {
            format!("{stem}_{attempt}")
        };
        let path = dir.join(name);

        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => attempt += 1,
            Err(e) => return Err(e.into()),
        }
    }
}
