use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

use crate::error::{ClassifierError, Result};

/// Bidirectional label <-> id mapping fit on one context's label set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelEncoder {
    classes: IndexSet<String>,
}

impl LabelEncoder {
    /// Fits on `labels`; ids follow sorted label order.
    pub fn fit<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut classes: Vec<String> = labels.into_iter().map(Into::into).collect();
        classes.sort();
        classes.dedup();
        Self {
            classes: classes.into_iter().collect(),
        }
    }

    /// Id of `label`.
    pub fn encode(&self, label: &str) -> Result<usize> {
        self.classes
            .get_index_of(label)
            .ok_or_else(|| ClassifierError::UnknownLabel(label.to_string()))
    }

    /// Label of `id`.
    pub fn decode(&self, id: usize) -> Result<&str> {
        self.classes
            .get_index(id)
            .map(String::as_str)
            .ok_or_else(|| ClassifierError::Shape(format!("class id {id} out of range")))
    }

    /// Labels in id order.
    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.classes.iter().map(String::as_str)
    }

    /// Number of classes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// True when fit on nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}
