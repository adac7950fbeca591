//! Compound files.
//!
//! A compound file packs the data files of one segment into a single
//! checksummed file so that an index with many small segments does not hold
//! many open files. Each packed file keeps its own footer, so an entry is
//! verified the same way as a stand-alone file.

use std::collections::BTreeMap;

use crate::error::{Result, TesseraError};
use crate::storage::Storage;
use crate::storage::structured::{StructReader, StructWriter, read_checked};
use crate::storage::read_file;

/// Magic opening a compound file.
pub const COMPOUND_MAGIC: u32 = 0x5443_4653; // "TCFS"
const COMPOUND_VERSION: u32 = 1;

/// Pack `files` into `compound_name`.
pub fn write_compound(storage: &dyn Storage, compound_name: &str, files: &[String]) -> Result<()> {
    let mut writer = StructWriter::create(storage, compound_name)?;
    writer.write_header(COMPOUND_MAGIC, COMPOUND_VERSION)?;
    writer.write_varint(files.len() as u64)?;
    for name in files {
        let bytes = read_file(storage, name)?;
        writer.write_string(name)?;
        writer.write_bytes(&bytes)?;
    }
    writer.close()?;
    Ok(())
}

/// The entries of a compound file.
#[derive(Debug)]
pub struct CompoundReader {
    name: String,
    entries: BTreeMap<String, Vec<u8>>,
}

impl CompoundReader {
    /// Load and verify a compound file.
    pub fn open(storage: &dyn Storage, compound_name: &str) -> Result<Self> {
        let body = read_checked(storage, compound_name)?;
        let mut reader = StructReader::from_slice(&body, compound_name);
        reader.read_header(COMPOUND_MAGIC, COMPOUND_VERSION, COMPOUND_VERSION)?;
        let count = reader.read_varint()?;
        let mut entries = BTreeMap::new();
        for _ in 0..count {
            let name = reader.read_string()?;
            let bytes = reader.read_bytes()?;
            entries.insert(name, bytes);
        }
        Ok(CompoundReader {
            name: compound_name.to_string(),
            entries,
        })
    }

    /// Names of the packed files.
    pub fn file_names(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    /// Take the bytes of a packed file.
    pub fn take(&mut self, file_name: &str) -> Result<Vec<u8>> {
        self.entries.remove(file_name).ok_or_else(|| {
            TesseraError::corrupt(format!("{}: no entry \"{file_name}\"", self.name))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStorage, write_file};

    #[test]
    fn test_pack_and_unpack() {
        let storage = MemoryStorage::new();
        write_file(&storage, "_0.seg", b"segment bytes").unwrap();
        write_file(&storage, "_0.extra", b"").unwrap();

        write_compound(
            &storage,
            "_0.cfs",
            &["_0.seg".to_string(), "_0.extra".to_string()],
        )
        .unwrap();

        let mut reader = CompoundReader::open(&storage, "_0.cfs").unwrap();
        assert_eq!(reader.file_names().count(), 2);
        assert_eq!(reader.take("_0.seg").unwrap(), b"segment bytes");
        assert!(reader.take("_0.seg").is_err());
    }
}
