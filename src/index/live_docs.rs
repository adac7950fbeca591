//! Per-segment liveness mask.
//!
//! A set bit means the document is live. Readers share a mask through an
//! `Arc`; the writer clones it before flipping bits whenever a reader still
//! holds the previous version (`Arc::make_mut`), so a published mask is never
//! mutated.

use bit_vec::BitVec;

use crate::document::DocId;
use crate::error::{Result, TesseraError};

/// Liveness bitmap of one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveDocs {
    bits: BitVec,
    deleted: u32,
}

impl LiveDocs {
    /// All documents live.
    pub fn new(max_doc: u32) -> Self {
        LiveDocs {
            bits: BitVec::from_elem(max_doc as usize, true),
            deleted: 0,
        }
    }

    /// Rebuild from the bytes produced by [`LiveDocs::to_bytes`].
    pub fn from_bytes(bytes: &[u8], max_doc: u32) -> Result<Self> {
        let mut bits = BitVec::from_bytes(bytes);
        if bits.len() < max_doc as usize {
            return Err(TesseraError::corrupt(format!(
                "live docs hold {} bits, segment has {max_doc} docs",
                bits.len()
            )));
        }
        bits.truncate(max_doc as usize);
        let live = bits.iter().filter(|b| *b).count() as u32;
        Ok(LiveDocs {
            bits,
            deleted: max_doc - live,
        })
    }

    /// Serialize the bitmap.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.bits.to_bytes()
    }

    /// Mark `doc` deleted. Returns true if it was live.
    pub fn delete(&mut self, doc: DocId) -> bool {
        match self.bits.get(doc as usize) {
            Some(true) => {
                self.bits.set(doc as usize, false);
                self.deleted += 1;
                true
            }
            _ => false,
        }
    }

    /// Whether `doc` is live.
    pub fn is_live(&self, doc: DocId) -> bool {
        self.bits.get(doc as usize).unwrap_or(false)
    }

    /// Number of documents covered.
    pub fn max_doc(&self) -> u32 {
        self.bits.len() as u32
    }

    /// Number of deleted documents.
    pub fn num_deleted(&self) -> u32 {
        self.deleted
    }

    /// Number of live documents.
    pub fn num_live(&self) -> u32 {
        self.max_doc() - self.deleted
    }

    /// Deleted document ids in increasing order.
    pub fn deleted_docs(&self) -> impl Iterator<Item = DocId> + '_ {
        self.bits
            .iter()
            .enumerate()
            .filter(|(_, live)| !live)
            .map(|(doc, _)| doc as DocId)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delete_counts_once() {
        let mut live = LiveDocs::new(10);
        assert!(live.delete(3));
        assert!(!live.delete(3));
        assert!(!live.delete(42));
        assert_eq!(live.num_deleted(), 1);
        assert_eq!(live.num_live(), 9);
        assert!(!live.is_live(3));
        assert!(live.is_live(4));
        assert!(!live.is_live(10));
    }

    #[test]
    fn test_bytes_preserve_deletions() {
        let mut live = LiveDocs::new(13);
        live.delete(0);
        live.delete(12);

        let restored = LiveDocs::from_bytes(&live.to_bytes(), 13).unwrap();
        assert_eq!(restored, live);
        assert_eq!(restored.deleted_docs().collect::<Vec<_>>(), vec![0, 12]);
    }

    #[test]
    fn test_short_bitmap_is_corrupt() {
        assert!(LiveDocs::from_bytes(&[0xff], 9).is_err());
    }
}
