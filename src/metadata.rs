//! Run metadata and reproducibility tracking.
//!
//! Metadata carries content hashes only, never timestamps or random
//! identifiers, so identical inputs produce identical artifacts.

use crate::data::Panel;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use tracing::warn;

/// Size and content digest of the input file a run was loaded from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputFingerprint {
    pub path: String,
    pub bytes: u64,
    pub sha256: String,
}

/// Reproducibility record written next to a run's artifacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub crate_version: String,
    /// Digest of the resolved configuration snapshot.
    pub config_hash: String,
    /// Digest over every observation in (symbol, date) order.
    pub panel_hash: String,
    pub input: Option<InputFingerprint>,
    pub symbols: usize,
    pub dates: usize,
    pub strategy_ids: Vec<String>,
}

impl RunMetadata {
    pub fn new<T: Serialize>(config: &T, panel: &Panel, strategy_ids: Vec<String>) -> Self {
        Self {
            crate_version: env!("CARGO_PKG_VERSION").to_string(),
            config_hash: hash_serialized(config),
            panel_hash: hash_panel(panel),
            input: None,
            symbols: panel.symbols().len(),
            dates: panel.len(),
            strategy_ids,
        }
    }

    pub fn with_input(mut self, input: InputFingerprint) -> Self {
        self.input = Some(input);
        self
    }
}

fn hex(digest: impl AsRef<[u8]>) -> String {
    digest.as_ref().iter().map(|b| format!("{:02x}", b)).collect()
}

/// Hex SHA-256 of a byte slice.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex(Sha256::digest(bytes))
}

/// Hex SHA-256 of any serializable value's JSON form.
///
/// A value that fails to serialize hashes to the empty string.
pub fn hash_serialized<T: Serialize>(value: &T) -> String {
    match serde_json::to_vec(value) {
        Ok(bytes) => sha256_hex(&bytes),
        Err(e) => {
            warn!("Configuration snapshot not hashable: {}", e);
            String::new()
        }
    }
}

/// Digest of the panel contents, independent of the file layout they came from.
pub fn hash_panel(panel: &Panel) -> String {
    let mut hasher = Sha256::new();
    for symbol in panel.symbols() {
        for obs in (0..panel.len()).filter_map(|idx| panel.observation(symbol, idx)) {
            match serde_json::to_vec(obs) {
                Ok(bytes) => hasher.update(&bytes),
                Err(e) => warn!("Observation {} {} not hashable: {}", obs.symbol, obs.date, e),
            }
        }
    }
    hex(hasher.finalize())
}

/// Stream a file through SHA-256 and record its size.
pub fn fingerprint_file(path: impl AsRef<Path>) -> io::Result<InputFingerprint> {
    let path = path.as_ref();
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let bytes = io::copy(&mut reader, &mut hasher)?;
    Ok(InputFingerprint {
        path: path.display().to_string(),
        bytes,
        sha256: hex(hasher.finalize()),
    })
}
