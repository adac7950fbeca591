//! Doc-values columns and in-place updates.
//!
//! A segment's doc-values columns are written once. Updates are layered on
//! top as a [`DocValuesOverlay`] persisted in `.dvu` generation files; a
//! reader resolves a value by checking the overlay first.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::document::{DocId, DocValuesType, Term};

/// A column of per-document values in a segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocValuesColumn {
    /// One optional i64 per document.
    Numeric(Vec<Option<i64>>),
    /// One optional byte string per document.
    Binary(Vec<Option<Vec<u8>>>),
    /// One optional byte string per document.
    Sorted(Vec<Option<Vec<u8>>>),
    /// A sorted, deduplicated set of byte strings per document.
    SortedSet(Vec<Vec<Vec<u8>>>),
}

impl DocValuesColumn {
    /// An empty column of `max_doc` missing values.
    pub fn new(kind: DocValuesType, max_doc: usize) -> Self {
        match kind {
            DocValuesType::Numeric => DocValuesColumn::Numeric(vec![None; max_doc]),
            DocValuesType::Binary => DocValuesColumn::Binary(vec![None; max_doc]),
            DocValuesType::Sorted => DocValuesColumn::Sorted(vec![None; max_doc]),
            DocValuesType::SortedSet => DocValuesColumn::SortedSet(vec![Vec::new(); max_doc]),
        }
    }

    /// The column type.
    pub fn doc_values_type(&self) -> DocValuesType {
        match self {
            DocValuesColumn::Numeric(_) => DocValuesType::Numeric,
            DocValuesColumn::Binary(_) => DocValuesType::Binary,
            DocValuesColumn::Sorted(_) => DocValuesType::Sorted,
            DocValuesColumn::SortedSet(_) => DocValuesType::SortedSet,
        }
    }

    /// Number of documents covered.
    pub fn len(&self) -> usize {
        match self {
            DocValuesColumn::Numeric(v) => v.len(),
            DocValuesColumn::Binary(v) | DocValuesColumn::Sorted(v) => v.len(),
            DocValuesColumn::SortedSet(v) => v.len(),
        }
    }

    /// Whether the column covers no document.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Grow with missing values up to `max_doc` documents.
    pub fn resize(&mut self, max_doc: usize) {
        match self {
            DocValuesColumn::Numeric(v) => v.resize(max_doc, None),
            DocValuesColumn::Binary(v) | DocValuesColumn::Sorted(v) => v.resize(max_doc, None),
            DocValuesColumn::SortedSet(v) => v.resize(max_doc, Vec::new()),
        }
    }

    /// Numeric value of `doc`.
    pub fn numeric(&self, doc: DocId) -> Option<i64> {
        match self {
            DocValuesColumn::Numeric(v) => v.get(doc as usize).copied().flatten(),
            _ => None,
        }
    }

    /// Byte value of `doc` for binary and sorted columns.
    pub fn bytes(&self, doc: DocId) -> Option<&[u8]> {
        match self {
            DocValuesColumn::Binary(v) | DocValuesColumn::Sorted(v) => {
                v.get(doc as usize).and_then(|b| b.as_deref())
            }
            _ => None,
        }
    }

    /// Values of `doc` for sorted-set columns.
    pub fn set(&self, doc: DocId) -> &[Vec<u8>] {
        match self {
            DocValuesColumn::SortedSet(v) => v.get(doc as usize).map(Vec::as_slice).unwrap_or(&[]),
            _ => &[],
        }
    }

    /// Apply an update value to `doc`. Ignored for non-updatable columns or
    /// mismatched value kinds.
    pub fn apply(&mut self, doc: DocId, value: &DocValuesValue) {
        match (self, value) {
            (DocValuesColumn::Numeric(v), DocValuesValue::Numeric(n)) => {
                if let Some(slot) = v.get_mut(doc as usize) {
                    *slot = *n;
                }
            }
            (DocValuesColumn::Binary(v), DocValuesValue::Binary(b)) => {
                if let Some(slot) = v.get_mut(doc as usize) {
                    slot.clone_from(b);
                }
            }
            _ => {}
        }
    }
}

/// New value of an updated doc value; `None` unsets it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocValuesValue {
    /// Numeric value.
    Numeric(Option<i64>),
    /// Binary value.
    Binary(Option<Vec<u8>>),
}

impl DocValuesValue {
    /// The column type this value updates.
    pub fn doc_values_type(&self) -> DocValuesType {
        match self {
            DocValuesValue::Numeric(_) => DocValuesType::Numeric,
            DocValuesValue::Binary(_) => DocValuesType::Binary,
        }
    }

    /// Approximate heap usage.
    pub fn ram_bytes(&self) -> usize {
        match self {
            DocValuesValue::Numeric(_) => 16,
            DocValuesValue::Binary(b) => 32 + b.as_ref().map_or(0, Vec::len),
        }
    }
}

/// An update of `field` for every document containing `term`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocValuesUpdate {
    /// Selects the documents to update.
    pub term: Term,
    /// The doc-values field to change.
    pub field: String,
    /// The new value.
    pub value: DocValuesValue,
}

impl DocValuesUpdate {
    /// Approximate heap usage.
    pub fn ram_bytes(&self) -> usize {
        self.term.ram_bytes() + self.field.len() + self.value.ram_bytes() + 24
    }
}

/// Updated doc values of one segment, layered over its columns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocValuesOverlay {
    fields: BTreeMap<String, BTreeMap<DocId, DocValuesValue>>,
}

impl DocValuesOverlay {
    /// An empty overlay.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new value of `field` for `doc`.
    pub fn set(&mut self, field: &str, doc: DocId, value: DocValuesValue) {
        self.fields
            .entry(field.to_string())
            .or_default()
            .insert(doc, value);
    }

    /// Updated value of `field` for `doc`, if any.
    pub fn get(&self, field: &str, doc: DocId) -> Option<&DocValuesValue> {
        self.fields.get(field).and_then(|docs| docs.get(&doc))
    }

    /// Fields with updates.
    pub fn fields(&self) -> impl Iterator<Item = (&String, &BTreeMap<DocId, DocValuesValue>)> {
        self.fields.iter()
    }

    /// Whether nothing was updated.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Number of updated (field, doc) pairs.
    pub fn len(&self) -> usize {
        self.fields.values().map(BTreeMap::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_apply_updates() {
        let mut column = DocValuesColumn::new(DocValuesType::Numeric, 3);
        column.apply(1, &DocValuesValue::Numeric(Some(7)));
        column.apply(5, &DocValuesValue::Numeric(Some(9)));
        column.apply(2, &DocValuesValue::Binary(Some(vec![1])));
        assert_eq!(column.numeric(1), Some(7));
        assert_eq!(column.numeric(2), None);
        assert_eq!(column.len(), 3);

        column.apply(1, &DocValuesValue::Numeric(None));
        assert_eq!(column.numeric(1), None);
    }

    #[test]
    fn test_overlay_last_write_wins() {
        let mut overlay = DocValuesOverlay::new();
        overlay.set("price", 4, DocValuesValue::Numeric(Some(1)));
        overlay.set("price", 4, DocValuesValue::Numeric(Some(2)));
        overlay.set("blob", 0, DocValuesValue::Binary(Some(b"x".to_vec())));

        assert_eq!(
            overlay.get("price", 4),
            Some(&DocValuesValue::Numeric(Some(2)))
        );
        assert_eq!(overlay.len(), 2);
        assert!(overlay.get("price", 5).is_none());
    }

    #[test]
    fn test_sorted_set_access() {
        let mut column = DocValuesColumn::new(DocValuesType::SortedSet, 2);
        if let DocValuesColumn::SortedSet(values) = &mut column {
            values[0] = vec![b"a".to_vec(), b"b".to_vec()];
        }
        assert_eq!(column.set(0).len(), 2);
        assert!(column.set(1).is_empty());
        assert!(column.bytes(0).is_none());
    }
}
