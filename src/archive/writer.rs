//! Producing side of the artifact archive format

use std::{fs::File, io::Write, path::Path};

use crate::error::{Result, StoreError};

use super::{IndexRecord, ARCHIVE_FINGERPRINT, META_SUFFIX};

/// Buffered writer that assembles an artifact archive in memory and
/// serializes it on `finish`
pub struct ArchiveWriter {
    entries: Vec<(String, Vec<u8>)>,
}

impl ArchiveWriter {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Add a raw entry with no element-count sidecar
    pub fn write_entry(&mut self, name: &str, payload: &[u8]) {
        self.entries.push((name.to_string(), payload.to_vec()));
    }

    /// Add a typed-array entry; the element count lands in `<name>.meta`
    pub fn write_typed_entry(&mut self, name: &str, payload: &[u8], element_count: u64) {
        self.entries.push((name.to_string(), payload.to_vec()));
        self.entries.push((
            format!("{}{}", name, META_SUFFIX),
            element_count.to_le_bytes().to_vec(),
        ));
    }

    /// Serialize the archive to disk
    pub fn finish(self, path: &Path) -> Result<()> {
        let mut index = Vec::with_capacity(self.entries.len());
        let mut offset = 0u64;
        for (name, payload) in &self.entries {
            index.push(IndexRecord {
                name: name.clone(),
                offset,
                byte_size: payload.len() as u64,
            });
            offset += payload.len() as u64;
        }

        let index_buf = bincode::serialize(&index)?;

        let mut file = File::create(path)
            .map_err(|e| StoreError::from_io(e, &format!("Failed to create {}", path.display())))?;
        file.write_all(&ARCHIVE_FINGERPRINT.to_le_bytes())
            .map_err(|e| StoreError::from_io(e, "Failed to write archive fingerprint"))?;
        file.write_all(&(index_buf.len() as u64).to_le_bytes())
            .map_err(|e| StoreError::from_io(e, "Failed to write archive index size"))?;
        file.write_all(&index_buf)
            .map_err(|e| StoreError::from_io(e, "Failed to write archive index"))?;
        for (_, payload) in &self.entries {
            file.write_all(payload)
                .map_err(|e| StoreError::from_io(e, "Failed to write archive payload"))?;
        }

        Ok(())
    }
}

impl Default for ArchiveWriter {
    fn default() -> Self {
        Self::new()
    }
}
