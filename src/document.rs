//! Documents, fields and terms.
//!
//! A [`Document`] is an ordered list of [`Field`]s. Each field carries a
//! [`FieldType`] that decides whether it is inverted, stored, kept as term
//! vectors, or recorded as a per-document doc value.

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Segment-local document number.
pub type DocId = u32;

/// A term: a field name plus the indexed bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Term {
    /// The field name.
    pub field: String,
    /// The term bytes (UTF-8 for text fields).
    pub bytes: Vec<u8>,
}

impl Term {
    /// Create a term from text.
    pub fn new<F: Into<String>>(field: F, text: &str) -> Self {
        Term {
            field: field.into(),
            bytes: text.as_bytes().to_vec(),
        }
    }

    /// Create a term from raw bytes.
    pub fn from_bytes<F: Into<String>>(field: F, bytes: Vec<u8>) -> Self {
        Term {
            field: field.into(),
            bytes,
        }
    }

    /// The term text, lossily decoded.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }

    /// Approximate heap usage.
    pub fn ram_bytes(&self) -> usize {
        self.field.len() + self.bytes.len() + 2 * std::mem::size_of::<Vec<u8>>()
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.field, self.text())
    }
}

/// Kind of per-document value column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocValuesType {
    /// One i64 per document.
    Numeric,
    /// One byte string per document.
    Binary,
    /// One byte string per document, drawn from a sorted dictionary.
    Sorted,
    /// A set of byte strings per document.
    SortedSet,
}

impl DocValuesType {
    /// Whether values of this type can be changed in place by an update.
    pub fn is_updatable(&self) -> bool {
        matches!(self, DocValuesType::Numeric | DocValuesType::Binary)
    }
}

/// How a field is indexed and stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldType {
    /// Field is inverted into postings.
    pub indexed: bool,
    /// Field text is run through the analyzer (otherwise indexed verbatim).
    pub tokenized: bool,
    /// Field value is kept in stored fields.
    pub stored: bool,
    /// Per-document term vectors are kept.
    pub store_term_vectors: bool,
    /// Term vectors include positions.
    pub store_term_vector_positions: bool,
    /// Term vectors include offsets.
    pub store_term_vector_offsets: bool,
    /// Postings record positions (and payloads).
    pub index_positions: bool,
    /// Postings record offsets.
    pub index_offsets: bool,
    /// No length normalization value is computed.
    pub omit_norms: bool,
    /// Per-document value column, if any.
    pub doc_values: Option<DocValuesType>,
}

impl FieldType {
    /// Tokenized, indexed with positions.
    pub const TEXT: FieldType = FieldType {
        indexed: true,
        tokenized: true,
        stored: false,
        store_term_vectors: false,
        store_term_vector_positions: false,
        store_term_vector_offsets: false,
        index_positions: true,
        index_offsets: false,
        omit_norms: false,
        doc_values: None,
    };

    /// Indexed verbatim as a single term, without norms.
    pub const STRING: FieldType = FieldType {
        indexed: true,
        tokenized: false,
        stored: false,
        store_term_vectors: false,
        store_term_vector_positions: false,
        store_term_vector_offsets: false,
        index_positions: false,
        index_offsets: false,
        omit_norms: true,
        doc_values: None,
    };

    /// Stored only.
    pub const STORED: FieldType = FieldType {
        indexed: false,
        tokenized: false,
        stored: true,
        store_term_vectors: false,
        store_term_vector_positions: false,
        store_term_vector_offsets: false,
        index_positions: false,
        index_offsets: false,
        omit_norms: true,
        doc_values: None,
    };

    /// A doc-values-only field type.
    pub const fn doc_values(kind: DocValuesType) -> FieldType {
        FieldType {
            indexed: false,
            tokenized: false,
            stored: false,
            store_term_vectors: false,
            store_term_vector_positions: false,
            store_term_vector_offsets: false,
            index_positions: false,
            index_offsets: false,
            omit_norms: true,
            doc_values: Some(kind),
        }
    }
}

/// A field value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldValue {
    /// Text.
    Text(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// A signed integer.
    Long(i64),
}

impl FieldValue {
    /// The value as text, if it is text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// The value as bytes. Text is returned as its UTF-8 bytes.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            FieldValue::Text(s) => Some(s.as_bytes()),
            FieldValue::Bytes(b) => Some(b),
            FieldValue::Long(_) => None,
        }
    }

    /// The value as an integer, if it is one.
    pub fn as_long(&self) -> Option<i64> {
        match self {
            FieldValue::Long(v) => Some(*v),
            _ => None,
        }
    }

    fn ram_bytes(&self) -> usize {
        match self {
            FieldValue::Text(s) => s.len() + 24,
            FieldValue::Bytes(b) => b.len() + 24,
            FieldValue::Long(_) => 8,
        }
    }
}

/// A named, typed value of a document.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    /// Field name.
    pub name: String,
    /// Field value.
    pub value: FieldValue,
    /// How the field is indexed.
    pub field_type: FieldType,
}

impl Field {
    /// Create a field with an explicit type.
    pub fn new<N: Into<String>>(name: N, value: FieldValue, field_type: FieldType) -> Self {
        Field {
            name: name.into(),
            value,
            field_type,
        }
    }

    /// Analyzed full-text field.
    pub fn text<N: Into<String>, V: Into<String>>(name: N, value: V, stored: bool) -> Self {
        let mut field_type = FieldType::TEXT;
        field_type.stored = stored;
        Field::new(name, FieldValue::Text(value.into()), field_type)
    }

    /// Field indexed verbatim as one term; typically an identifier.
    pub fn string<N: Into<String>, V: Into<String>>(name: N, value: V, stored: bool) -> Self {
        let mut field_type = FieldType::STRING;
        field_type.stored = stored;
        Field::new(name, FieldValue::Text(value.into()), field_type)
    }

    /// Stored-only field.
    pub fn stored<N: Into<String>>(name: N, value: FieldValue) -> Self {
        Field::new(name, value, FieldType::STORED)
    }

    /// Numeric doc value.
    pub fn numeric_doc_values<N: Into<String>>(name: N, value: i64) -> Self {
        Field::new(
            name,
            FieldValue::Long(value),
            FieldType::doc_values(DocValuesType::Numeric),
        )
    }

    /// Binary doc value.
    pub fn binary_doc_values<N: Into<String>>(name: N, value: Vec<u8>) -> Self {
        Field::new(
            name,
            FieldValue::Bytes(value),
            FieldType::doc_values(DocValuesType::Binary),
        )
    }

    /// Sorted doc value.
    pub fn sorted_doc_values<N: Into<String>>(name: N, value: Vec<u8>) -> Self {
        Field::new(
            name,
            FieldValue::Bytes(value),
            FieldType::doc_values(DocValuesType::Sorted),
        )
    }

    /// One value of a sorted-set doc value; repeat the field for more.
    pub fn sorted_set_doc_values<N: Into<String>>(name: N, value: Vec<u8>) -> Self {
        Field::new(
            name,
            FieldValue::Bytes(value),
            FieldType::doc_values(DocValuesType::SortedSet),
        )
    }

    /// Keep term vectors for this field.
    pub fn with_term_vectors(mut self, positions: bool, offsets: bool) -> Self {
        self.field_type.store_term_vectors = true;
        self.field_type.store_term_vector_positions = positions;
        self.field_type.store_term_vector_offsets = offsets;
        self
    }

    /// Record offsets in postings.
    pub fn with_offsets(mut self) -> Self {
        self.field_type.index_offsets = true;
        self.field_type.index_positions = true;
        self
    }

    /// Skip norms for this field.
    pub fn omit_norms(mut self) -> Self {
        self.field_type.omit_norms = true;
        self
    }
}

/// A document to be indexed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    fields: Vec<Field>,
}

impl Document {
    /// Create an empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a field.
    pub fn add(&mut self, field: Field) -> &mut Self {
        self.fields.push(field);
        self
    }

    /// Append a field, builder style.
    pub fn with(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    /// All fields in insertion order.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// First field with the given name.
    pub fn get(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the document has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// The stored fields of a document, as read back from an index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDocument {
    fields: Vec<(String, FieldValue)>,
}

impl StoredDocument {
    /// Create an empty stored document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stored value.
    pub fn push<N: Into<String>>(&mut self, name: N, value: FieldValue) {
        self.fields.push((name.into(), value));
    }

    /// First value of `name`.
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// First value of `name` as text.
    pub fn get_text(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(FieldValue::as_text)
    }

    /// All values of `name`.
    pub fn get_all(&self, name: &str) -> Vec<&FieldValue> {
        self.fields
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| v)
            .collect()
    }

    /// All stored values in order.
    pub fn fields(&self) -> &[(String, FieldValue)] {
        &self.fields
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Merge another document's values into this one (parallel readers).
    pub fn extend(&mut self, other: StoredDocument) {
        self.fields.extend(other.fields);
    }

    /// Approximate heap usage.
    pub fn ram_bytes(&self) -> usize {
        self.fields
            .iter()
            .map(|(n, v)| n.len() + v.ram_bytes() + 24)
            .sum()
    }
}
