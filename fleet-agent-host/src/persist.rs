//! Per-instance durable state: identity and the sequence number, bumped on
//! every process start so the kernel's ordering filter never sees a restart
//! as a replay.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("cannot access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt state file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentState {
    pub agent_identity: String,
    pub sequence_number: u64,
}

pub fn state_path(dir: &Path, agent_name: &str) -> PathBuf {
    dir.join(format!("{}.json", agent_name))
}

/// Loads the instance state, increments the sequence number and writes it
/// back. First start creates the file with sequence number 1.
pub async fn load_and_bump(dir: &Path, agent_name: &str) -> Result<PersistentState, PersistError> {
    let path = state_path(dir, agent_name);
    let io_err = |source: std::io::Error| PersistError::Io { path: path.clone(), source };

    let state = match tokio::fs::read(&path).await {
        Ok(raw) => {
            let mut prev: PersistentState = serde_json::from_slice(&raw)
                .map_err(|source| PersistError::Corrupt { path: path.clone(), source })?;
            prev.sequence_number += 1;
            debug!("{}: sequence number bumped to {}", agent_name, prev.sequence_number);
            prev
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("{}: first start, creating {}", agent_name, path.display());
            PersistentState {
                agent_identity: uuid::Uuid::new_v4().to_string(),
                sequence_number: 1,
            }
        }
        Err(e) => return Err(io_err(e)),
    };

    tokio::fs::create_dir_all(dir).await.map_err(io_err)?;
    let data = serde_json::to_vec_pretty(&state)
        .map_err(|source| PersistError::Corrupt { path: path.clone(), source })?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, data).await.map_err(io_err)?;
    tokio::fs::rename(&tmp, &path).await.map_err(io_err)?;
    Ok(state)
}
