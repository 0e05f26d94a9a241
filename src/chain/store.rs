//! Durable header store: `headers.json` in the datadir.
//!
//! Only raw headers are persisted; heights, chain work and the active chain
//! are recomputed through the normal accept path on load. Writes are atomic
//! (temp file + rename). A corrupt header store aborts startup; it is the
//! one file the operator must look at.

use crate::chain::chainstate::{AcceptOutcome, ChainstateManager};
use crate::errors::{NodeResult, StorageError};
use crate::primitives::header::{BlockHeader, HEADER_SIZE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const HEADERS_FILE: &str = "headers.json";

#[derive(Serialize, Deserialize)]
struct HeaderFile {
    headers: Vec<String>,
}

/// Write `bytes` to `path` atomically: write a sibling temp file, fsync,
/// rename over the target.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    {
        use std::io::Write;
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp, path)
}

pub struct HeaderStore {
    path: PathBuf,
}

impl HeaderStore {
    pub fn new(datadir: &Path) -> Self {
        Self {
            path: datadir.join(HEADERS_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load persisted headers, parents-first. A missing file is an empty
    /// chain; anything unreadable is fatal.
    pub fn load(&self) -> Result<Vec<BlockHeader>, StorageError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::CorruptHeaders(e.to_string())),
        };
        let file: HeaderFile = serde_json::from_slice(&bytes)
            .map_err(|e| StorageError::CorruptHeaders(e.to_string()))?;
        let mut out = Vec::with_capacity(file.headers.len());
        for (i, hexed) in file.headers.iter().enumerate() {
            let raw = hex::decode(hexed)
                .map_err(|e| StorageError::CorruptHeaders(format!("entry {i}: {e}")))?;
            if raw.len() != HEADER_SIZE {
                return Err(StorageError::CorruptHeaders(format!(
                    "entry {i}: {} bytes",
                    raw.len()
                )));
            }
            let header = BlockHeader::decode(&raw)
                .map_err(|e| StorageError::CorruptHeaders(format!("entry {i}: {e}")))?;
            out.push(header);
        }
        Ok(out)
    }

    pub fn save(&self, headers: &[BlockHeader]) -> Result<(), StorageError> {
        let file = HeaderFile {
            headers: headers.iter().map(|h| hex::encode(h.encode())).collect(),
        };
        let bytes = serde_json::to_vec(&file)
            .map_err(|e| StorageError::CorruptHeaders(e.to_string()))?;
        atomic_write(&self.path, &bytes)?;
        Ok(())
    }
}

/// Feed stored headers back through validation. Any header the chain no
/// longer accepts means the store does not describe a valid chain: abort.
pub fn restore_chain(store: &HeaderStore, chainstate: &ChainstateManager) -> NodeResult<()> {
    let headers = store.load()?;
    if headers.is_empty() {
        info!("no stored headers; starting from genesis");
        return Ok(());
    }
    chainstate.prevalidate_pow_batch(&headers);
    for (i, header) in headers.iter().enumerate() {
        match chainstate.accept_header(header, None) {
            AcceptOutcome::Accepted | AcceptOutcome::Duplicate => {}
            outcome => {
                warn!(entry = i, ?outcome, "stored header failed validation");
                return Err(StorageError::CorruptHeaders(format!(
                    "entry {i} rejected: {outcome:?}"
                ))
                .into());
            }
        }
    }
    chainstate.activate_best_chain();
    let tip = chainstate.tip();
    info!(height = tip.height, tip = %tip.id, "header store restored");
    Ok(())
}
