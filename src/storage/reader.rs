//! Scenario directory loading

use std::io;
use std::path::Path;

use futures_util::future::join_all;
use tracing::{debug, warn};

use super::format::{parse_file_name, parse_interaction};
use crate::interaction::Interaction;
use crate::{Result, StenoError};

/// Load every cassette in a scenario directory, ordered by capture time
///
/// Files that fail to parse are skipped. Ties are broken by file name.
///
/// # Errors
///
/// Returns [`StenoError::ScenarioNotFound`] if the directory does not exist,
/// or the I/O error if it cannot be listed
pub async fn load_dir(dir: &Path) -> Result<Vec<Interaction>> {
    let mut entries = tokio::fs::read_dir(dir).await.map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            StenoError::ScenarioNotFound(dir.to_path_buf())
        } else {
            StenoError::Io(e)
        }
    })?;

    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }

    let loaded = join_all(names.into_iter().map(|name| async move {
        let result = load_file(dir, &name).await;
        (name, result)
    }))
    .await;

    let mut interactions: Vec<(String, Interaction)> = loaded
        .into_iter()
        .filter_map(|(name, result)| match result {
            Ok(interaction) => Some((name, interaction)),
            Err(e) => {
                warn!("Skipping {}: {}", name, e);
                None
            }
        })
        .collect();

    interactions.sort_by(|(a_name, a), (b_name, b)| {
        a.timestamp.cmp(&b.timestamp).then_with(|| a_name.cmp(b_name))
    });

    debug!("Loaded {} interactions from {}", interactions.len(), dir.display());
    Ok(interactions.into_iter().map(|(_, i)| i).collect())
}

async fn load_file(dir: &Path, name: &str) -> Result<Interaction> {
    let (timestamp, direction) = parse_file_name(name)?;
    let contents = tokio::fs::read_to_string(dir.join(name)).await?;
    parse_interaction(&contents, timestamp, direction)
}
