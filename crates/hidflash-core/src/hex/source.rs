//! Read-only hex file buffer.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, instrument};

use super::record::HexRecords;
use super::walker::RunWalker;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Could not open hex file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Could not query size of hex file {path}: {source}")]
    Stat {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Could not read hex file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Whole hex file held in memory for the duration of a programming session.
///
/// Every pass walks the same immutable bytes; the buffer is released when the
/// source is dropped.
#[derive(Debug)]
pub struct HexSource {
    path: PathBuf,
    data: Vec<u8>,
}

impl HexSource {
    #[instrument(level = "debug", fields(path = %path.as_ref().display()))]
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SourceError> {
        let path = path.as_ref().to_path_buf();

        let mut file = File::open(&path).map_err(|source| SourceError::Open {
            path: path.clone(),
            source,
        })?;
        let size = file
            .metadata()
            .map_err(|source| SourceError::Stat {
                path: path.clone(),
                source,
            })?
            .len();

        let mut data = Vec::with_capacity(size as usize);
        file.read_to_end(&mut data)
            .map_err(|source| SourceError::Read {
                path: path.clone(),
                source,
            })?;

        debug!(bytes = data.len(), "Hex file loaded");
        Ok(Self { path, data })
    }

    /// Wrap bytes that are already in memory.
    pub fn from_bytes(path: impl Into<PathBuf>, data: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            data,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Start a fresh walk over the file. Each call is independent.
    pub fn segments(&self) -> RunWalker<HexRecords<'_>> {
        RunWalker::new(HexRecords::new(&self.data))
    }
}
