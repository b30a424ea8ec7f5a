//! Index enumeration and payload reads for artifact archives

use std::{
    collections::HashMap,
    fs::File,
    io::{Read, Seek, SeekFrom},
    path::{Path, PathBuf},
};

use crate::error::{Result, StoreError};

use super::{IndexRecord, ARCHIVE_FINGERPRINT, META_SUFFIX};

/// One named entry in an archive, with its sidecar metadata folded in
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    /// Entry name, a hierarchical block path such as `/common/names`
    pub name: String,
    /// Payload size in bytes
    pub byte_size: u64,
    /// Element count from the `<name>.meta` sidecar, if one exists
    pub element_count: Option<u64>,
}

/// Reader over a fingerprinted artifact archive
#[derive(Debug)]
pub struct ArchiveReader {
    file: File,
    path: PathBuf,
    /// Payload offsets keyed by entry name, relative to `payload_base`
    records: HashMap<String, IndexRecord>,
    /// Non-meta entries in index order
    entries: Vec<ArchiveEntry>,
    payload_base: u64,
}

impl ArchiveReader {
    /// Open an archive and verify its fingerprint
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| StoreError::from_io(e, &format!("Failed to open {}", path.display())))?;

        let mut word = [0u8; 8];
        file.read_exact(&mut word)
            .map_err(|e| StoreError::from_io(e, "Failed to read archive fingerprint"))?;
        if u64::from_le_bytes(word) != ARCHIVE_FINGERPRINT {
            return Err(StoreError::corrupt_archive(
                path.display().to_string(),
                "fingerprint mismatch",
            ));
        }

        file.read_exact(&mut word)
            .map_err(|e| StoreError::from_io(e, "Failed to read archive index size"))?;
        let index_len = u64::from_le_bytes(word);

        let mut index_buf = vec![0u8; index_len as usize];
        file.read_exact(&mut index_buf)
            .map_err(|e| StoreError::from_io(e, "Failed to read archive index"))?;
        let index: Vec<IndexRecord> = bincode::deserialize(&index_buf)?;

        let payload_base = 16 + index_len;
        let mut reader = Self {
            file,
            path: path.to_path_buf(),
            records: index.iter().map(|r| (r.name.clone(), r.clone())).collect(),
            entries: Vec::new(),
            payload_base,
        };
        reader.entries = reader.fold_index(&index)?;

        Ok(reader)
    }

    /// Fold `.meta` sidecars into their parent entries
    fn fold_index(&mut self, index: &[IndexRecord]) -> Result<Vec<ArchiveEntry>> {
        let mut entries = Vec::new();

        for record in index {
            if let Some(parent) = record.name.strip_suffix(META_SUFFIX) {
                if !self.records.contains_key(parent) {
                    return Err(StoreError::corrupt_archive(
                        self.path.display().to_string(),
                        format!("metadata entry {} has no parent", record.name),
                    ));
                }
                continue;
            }

            let meta_name = format!("{}{}", record.name, META_SUFFIX);
            let element_count = if self.records.contains_key(&meta_name) {
                Some(self.read_u64_at(&meta_name)?)
            } else {
                None
            };

            entries.push(ArchiveEntry {
                name: record.name.clone(),
                byte_size: record.byte_size,
                element_count,
            });
        }

        Ok(entries)
    }

    /// All non-meta entries in index order
    pub fn entries(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    /// Path this reader was opened on
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy one entry's payload into `buf`; the buffer length must match
    pub fn read_into(&mut self, name: &str, buf: &mut [u8]) -> Result<()> {
        let record = self
            .records
            .get(name)
            .ok_or_else(|| StoreError::block_not_found(name))?
            .clone();

        if buf.len() as u64 != record.byte_size {
            return Err(StoreError::corrupt_archive(
                self.path.display().to_string(),
                format!(
                    "entry {} is {} bytes, destination is {}",
                    name,
                    record.byte_size,
                    buf.len()
                ),
            ));
        }

        self.file
            .seek(SeekFrom::Start(self.payload_base + record.offset))
            .map_err(|e| StoreError::from_io(e, "Failed to seek to archive entry"))?;
        self.file
            .read_exact(buf)
            .map_err(|e| StoreError::from_io(e, &format!("Failed to read entry {}", name)))?;

        Ok(())
    }

    /// Read a 4-byte entry, such as a connectivity checksum
    pub fn read_u32(&mut self, name: &str) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_into(name, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64_at(&mut self, name: &str) -> Result<u64> {
        let record = self
            .records
            .get(name)
            .ok_or_else(|| StoreError::block_not_found(name))?
            .clone();

        if record.byte_size != 8 {
            return Err(StoreError::corrupt_archive(
                self.path.display().to_string(),
                format!("metadata entry {} is not 8 bytes", name),
            ));
        }

        let mut buf = [0u8; 8];
        self.file
            .seek(SeekFrom::Start(self.payload_base + record.offset))
            .map_err(|e| StoreError::from_io(e, "Failed to seek to metadata entry"))?;
        self.file
            .read_exact(&mut buf)
            .map_err(|e| StoreError::from_io(e, &format!("Failed to read entry {}", name)))?;

        Ok(u64::from_le_bytes(buf))
    }
}
