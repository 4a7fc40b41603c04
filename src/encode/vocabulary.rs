//! Append-only categorical vocabularies.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Categorical field a vocabulary encodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Location,
    Sku,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Location => write!(f, "location"),
            Field::Sku => write!(f, "sku"),
        }
    }
}

/// Ordered, append-only mapping between labels and integer ids.
///
/// A label's id is its insertion rank and never changes once assigned.
/// Serialized as the ordered label list; the lookup map is rebuilt on load
/// and a list that repeats a label is rejected.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct Vocabulary {
    /// Labels by id
    labels: Vec<String>,

    /// Ids by label
    index: HashMap<String, u32>,
}

impl Vocabulary {
    /// Create an empty vocabulary.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a vocabulary from labels in id order. Duplicates keep their first id.
    pub fn with_labels<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut vocab = Self::new();
        vocab.extend(labels);
        vocab
    }

    /// Number of labels.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Whether no labels have been seen.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Id of `label`, if it has been seen.
    pub fn lookup(&self, label: &str) -> Option<u32> {
        self.index.get(label).copied()
    }

    /// Whether `label` has an id.
    pub fn contains(&self, label: &str) -> bool {
        self.index.contains_key(label)
    }

    /// Label with id `id`.
    pub fn label(&self, id: u32) -> Option<&str> {
        self.labels.get(id as usize).map(String::as_str)
    }

    /// All labels in id order.
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Return the id of `label`, appending it if unseen.
    pub fn insert(&mut self, label: &str) -> u32 {
        if let Some(id) = self.index.get(label) {
            return *id;
        }
        let id = self.labels.len() as u32;
        self.labels.push(label.to_string());
        self.index.insert(label.to_string(), id);
        id
    }

    /// Append every unseen label in first-encountered order.
    ///
    /// Existing ids are untouched and extending with already-known labels is a
    /// no-op. Returns the number of labels added.
    pub fn extend<I, S>(&mut self, labels: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let before = self.labels.len();
        for label in labels {
            self.insert(label.as_ref());
        }
        self.labels.len() - before
    }

    /// Map labels to ids without growing the vocabulary.
    ///
    /// Fails on the first label that has never been seen.
    pub fn transform<I, S>(&self, labels: I) -> std::result::Result<Vec<u32>, UnknownLabel>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        labels
            .into_iter()
            .map(|label| {
                let label = label.as_ref();
                self.lookup(label)
                    .ok_or_else(|| UnknownLabel(label.to_string()))
            })
            .collect()
    }
}

impl PartialEq for Vocabulary {
    fn eq(&self, other: &Self) -> bool {
        self.labels == other.labels
    }
}

impl Eq for Vocabulary {}

impl TryFrom<Vec<String>> for Vocabulary {
    type Error = DuplicateLabel;

    fn try_from(labels: Vec<String>) -> std::result::Result<Self, Self::Error> {
        let mut index = HashMap::with_capacity(labels.len());
        for (id, label) in labels.iter().enumerate() {
            if index.insert(label.clone(), id as u32).is_some() {
                return Err(DuplicateLabel(label.clone()));
            }
        }
        Ok(Self { labels, index })
    }
}

/// A stored label list that names the same label twice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateLabel(pub String);

impl fmt::Display for DuplicateLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "label '{}' appears more than once", self.0)
    }
}

impl From<Vocabulary> for Vec<String> {
    fn from(vocab: Vocabulary) -> Self {
        vocab.labels
    }
}

/// A label absent from a vocabulary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownLabel(pub String);

impl UnknownLabel {
    /// Attach the field the lookup was made for.
    pub fn in_field(self, field: Field) -> Error {
        Error::UnknownLabel { field, label: self.0 }
    }
}

/// The location and SKU vocabularies that accompany a model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vocabularies {
    pub location: Vocabulary,
    pub sku: Vocabulary,
}

impl Vocabularies {
    /// Create empty vocabularies.
    pub fn new() -> Self {
        Self::default()
    }

    /// Vocabulary for `field`.
    pub fn get(&self, field: Field) -> &Vocabulary {
        match field {
            Field::Location => &self.location,
            Field::Sku => &self.sku,
        }
    }

    /// Mutable vocabulary for `field`.
    pub fn get_mut(&mut self, field: Field) -> &mut Vocabulary {
        match field {
            Field::Location => &mut self.location,
            Field::Sku => &mut self.sku,
        }
    }

    /// Inference-path lookup of a single label.
    pub fn resolve(&self, field: Field, label: &str) -> Result<u32> {
        self.get(field).lookup(label).ok_or_else(|| Error::UnknownLabel {
            field,
            label: label.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_follow_first_sight() {
        let mut vocab = Vocabulary::new();
        assert_eq!(vocab.extend(["ESQUEL", "BARILOCHE", "ESQUEL"]), 2);

        assert_eq!(vocab.lookup("ESQUEL"), Some(0));
        assert_eq!(vocab.lookup("BARILOCHE"), Some(1));
        assert_eq!(vocab.label(1), Some("BARILOCHE"));
        assert_eq!(vocab.lookup("TREVELIN"), None);
        assert_eq!(vocab.label(2), None);
    }

    #[test]
    fn test_extend_is_idempotent() {
        let mut vocab = Vocabulary::with_labels(["a", "b", "c"]);
        let before = vocab.clone();

        assert_eq!(vocab.extend(["c", "a"]), 0);
        assert_eq!(vocab, before);
    }

    #[test]
    fn test_extend_never_moves_existing_ids() {
        let mut vocab = Vocabulary::with_labels(["x", "y"]);
        vocab.extend(["z", "x", "w"]);

        assert_eq!(vocab.lookup("x"), Some(0));
        assert_eq!(vocab.lookup("y"), Some(1));
        assert_eq!(vocab.lookup("z"), Some(2));
        assert_eq!(vocab.lookup("w"), Some(3));
    }

    #[test]
    fn test_transform_rejects_unknown_without_growing() {
        let vocab = Vocabulary::with_labels(["138202", "609400"]);

        assert_eq!(vocab.transform(["609400", "138202"]), Ok(vec![1, 0]));

        let err = vocab.transform(["138202", "999999"]).unwrap_err();
        assert_eq!(err, UnknownLabel("999999".to_string()));
        assert_eq!(vocab.len(), 2);
    }

    #[test]
    fn test_serde_keeps_order() {
        let vocab = Vocabulary::with_labels(["b", "a", "c"]);
        let json = serde_json::to_string(&vocab).unwrap();
        assert_eq!(json, r#"["b","a","c"]"#);

        let restored: Vocabulary = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, vocab);
        assert_eq!(restored.lookup("c"), Some(2));
    }

    #[test]
    fn test_serde_rejects_repeated_labels() {
        let err = serde_json::from_str::<Vocabulary>(r#"["ESQUEL","BARILOCHE","ESQUEL"]"#)
            .unwrap_err();
        assert!(err.to_string().contains("'ESQUEL' appears more than once"));

        let ok = Vocabulary::try_from(vec!["ESQUEL".to_string(), "BARILOCHE".to_string()]).unwrap();
        assert_eq!(ok.lookup("BARILOCHE"), Some(1));
    }

    #[test]
    fn test_vocabularies_resolve() {
        let mut vocabs = Vocabularies::new();
        vocabs.get_mut(Field::Sku).insert("138202");

        assert_eq!(vocabs.resolve(Field::Sku, "138202").unwrap(), 0);
        match vocabs.resolve(Field::Location, "ESQUEL") {
            Err(Error::UnknownLabel { field, label }) => {
                assert_eq!(field, Field::Location);
                assert_eq!(label, "ESQUEL");
            }
            other => panic!("expected UnknownLabel, got {:?}", other),
        }
    }
}
