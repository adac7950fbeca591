//! Per-segment field metadata.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::document::{DocValuesType, FieldType};
use crate::error::{Result, TesseraError};

/// What a segment knows about one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldInfo {
    /// Field name.
    pub name: String,
    /// Field number, dense within a segment.
    pub number: u32,
    /// Field has postings.
    pub indexed: bool,
    /// Postings carry positions.
    pub has_positions: bool,
    /// Postings carry offsets.
    pub has_offsets: bool,
    /// Some position carries a payload.
    pub has_payloads: bool,
    /// Some document stored term vectors.
    pub store_term_vectors: bool,
    /// No norms are recorded.
    pub omit_norms: bool,
    /// Doc values column type.
    pub doc_values: Option<DocValuesType>,
}

impl FieldInfo {
    /// Whether a norms column exists for this field.
    pub fn has_norms(&self) -> bool {
        self.indexed && !self.omit_norms
    }
}

/// Field metadata of a segment, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldInfos {
    by_name: BTreeMap<String, FieldInfo>,
}

impl FieldInfos {
    /// Empty field infos.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a field occurrence, widening its flags. A doc-values type
    /// change for an existing field is rejected.
    pub fn add_or_update(&mut self, name: &str, field_type: &FieldType) -> Result<()> {
        let next_number = self.by_name.len() as u32;
        let info = self
            .by_name
            .entry(name.to_string())
            .or_insert_with(|| FieldInfo {
                name: name.to_string(),
                number: next_number,
                indexed: false,
                has_positions: false,
                has_offsets: false,
                has_payloads: false,
                store_term_vectors: false,
                omit_norms: true,
                doc_values: None,
            });

        if field_type.indexed {
            // Norms survive only if every indexed occurrence keeps them.
            info.omit_norms = if info.indexed {
                info.omit_norms || field_type.omit_norms
            } else {
                field_type.omit_norms
            };
            info.indexed = true;
            info.has_positions |= field_type.index_positions || field_type.tokenized;
            info.has_offsets |= field_type.index_offsets;
        }
        info.store_term_vectors |= field_type.store_term_vectors;

        if let Some(kind) = field_type.doc_values {
            match info.doc_values {
                None => info.doc_values = Some(kind),
                Some(existing) if existing == kind => {}
                Some(existing) => {
                    return Err(TesseraError::illegal_argument(format!(
                        "cannot change doc values type from {existing:?} to {kind:?} for field \"{name}\""
                    )));
                }
            }
        }
        Ok(())
    }

    /// Union with field infos of another segment.
    pub fn merge(&mut self, other: &FieldInfos) -> Result<()> {
        for info in other.iter() {
            let next_number = self.by_name.len() as u32;
            match self.by_name.get_mut(&info.name) {
                None => {
                    let mut copy = info.clone();
                    copy.number = next_number;
                    self.by_name.insert(info.name.clone(), copy);
                }
                Some(existing) => {
                    if let (Some(a), Some(b)) = (existing.doc_values, info.doc_values) {
                        if a != b {
                            return Err(TesseraError::illegal_argument(format!(
                                "field \"{}\" has conflicting doc values types {a:?} and {b:?}",
                                info.name
                            )));
                        }
                    }
                    existing.omit_norms = match (existing.indexed, info.indexed) {
                        (true, true) => existing.omit_norms || info.omit_norms,
                        (false, true) => info.omit_norms,
                        _ => existing.omit_norms,
                    };
                    existing.indexed |= info.indexed;
                    existing.has_positions |= info.has_positions;
                    existing.has_offsets |= info.has_offsets;
                    existing.has_payloads |= info.has_payloads;
                    existing.store_term_vectors |= info.store_term_vectors;
                    existing.doc_values = existing.doc_values.or(info.doc_values);
                }
            }
        }
        Ok(())
    }

    /// Add a copy of `info` unless a field of that name exists. Returns
    /// whether it was added.
    pub fn insert_if_absent(&mut self, info: &FieldInfo) -> bool {
        if self.by_name.contains_key(&info.name) {
            return false;
        }
        let mut copy = info.clone();
        copy.number = self.by_name.len() as u32;
        self.by_name.insert(info.name.clone(), copy);
        true
    }

    /// Mark that a field carried payloads.
    pub fn set_has_payloads(&mut self, name: &str) {
        if let Some(info) = self.by_name.get_mut(name) {
            info.has_payloads = true;
        }
    }

    /// Look up a field.
    pub fn get(&self, name: &str) -> Option<&FieldInfo> {
        self.by_name.get(name)
    }

    /// Iterate fields in name order.
    pub fn iter(&self) -> impl Iterator<Item = &FieldInfo> {
        self.by_name.values()
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    /// Whether no field is known.
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_widen() {
        let mut infos = FieldInfos::new();
        infos.add_or_update("body", &FieldType::STORED).unwrap();
        assert!(!infos.get("body").unwrap().indexed);

        infos.add_or_update("body", &FieldType::TEXT).unwrap();
        let body = infos.get("body").unwrap();
        assert!(body.indexed && body.has_positions && body.has_norms());
        assert_eq!(body.number, 0);
    }

    #[test]
    fn test_doc_values_type_conflict() {
        let mut infos = FieldInfos::new();
        infos
            .add_or_update("price", &FieldType::doc_values(DocValuesType::Numeric))
            .unwrap();
        let err = infos
            .add_or_update("price", &FieldType::doc_values(DocValuesType::Binary))
            .unwrap_err();
        assert!(matches!(err, TesseraError::IllegalArgument(_)));
    }

    #[test]
    fn test_merge_renumbers() {
        let mut a = FieldInfos::new();
        a.add_or_update("f1", &FieldType::TEXT).unwrap();
        let mut b = FieldInfos::new();
        b.add_or_update("f2", &FieldType::STRING).unwrap();
        b.add_or_update("f1", &FieldType::STRING).unwrap();

        a.merge(&b).unwrap();
        assert_eq!(a.len(), 2);
        assert_eq!(a.get("f2").unwrap().number, 1);
        assert!(a.get("f1").unwrap().omit_norms);
    }
}
