use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::{Path, PathBuf},
};

use intentflow_routing::{directory::INFO_DIR, RoutingDefinition, WILDCARD_COMMAND};
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::error::{ClassifierError, Result};

/// Corpus file name inside `___command_info`.
pub const CORPUS_FILE: &str = "utterances.json";

/// Example utterances per qualified command plus the global misunderstood set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtteranceCorpus {
    /// Utterances keyed by qualified command name.
    #[serde(default)]
    pub commands: BTreeMap<String, Vec<String>>,
    /// Utterances that match no command anywhere.
    #[serde(default)]
    pub misunderstood: Vec<String>,
}

impl UtteranceCorpus {
    /// `<root>/___command_info/utterances.json`.
    #[must_use]
    pub fn default_path(root: &Path) -> PathBuf {
        root.join(INFO_DIR).join(CORPUS_FILE)
    }

    /// Reads a corpus file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|err| ClassifierError::io(path, err))?;
        serde_json::from_str(&raw).map_err(|err| ClassifierError::json(path, err))
    }

    /// Writes the corpus, creating parent folders.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| ClassifierError::io(parent, err))?;
        }
        let data =
            serde_json::to_vec_pretty(self).map_err(|err| ClassifierError::json(path, err))?;
        fs::write(path, data).map_err(|err| ClassifierError::io(path, err))
    }

    /// Utterances of one command (empty when unknown).
    #[must_use]
    pub fn utterances(&self, command: &str) -> &[String] {
        self.commands.get(command).map_or(&[], Vec::as_slice)
    }
}

/// One labelled utterance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabeledUtterance {
    /// Raw text.
    pub text: String,
    /// Qualified command or `wildcard`.
    pub label: String,
}

/// Training examples of one context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextDataset {
    /// Context the data belongs to.
    pub context: String,
    /// Every labelled utterance.
    pub examples: Vec<LabeledUtterance>,
}

impl ContextDataset {
    /// Gathers utterances for `context`.
    ///
    /// Every resolved command with utterances becomes a class. The wildcard class holds
    /// the utterances of the context's structural ancestors' commands that are not
    /// already utterances of this context, plus the corpus' misunderstood set.
    pub fn build(
        definition: &RoutingDefinition,
        corpus: &UtteranceCorpus,
        context: &str,
    ) -> Result<Self> {
        let resolved = definition.get_qualified_command_names(context)?;
        let mut examples = Vec::new();
        let mut own: BTreeSet<&str> = BTreeSet::new();
        for command in resolved.iter().filter(|c| c.as_str() != WILDCARD_COMMAND) {
            for text in corpus.utterances(command) {
                own.insert(text.as_str());
                examples.push(LabeledUtterance {
                    text: text.clone(),
                    label: command.clone(),
                });
            }
        }

        let mut wildcard: BTreeSet<&str> = BTreeSet::new();
        for ancestor in definition.get_ancestor_contexts(context)? {
            for command in definition.get_qualified_command_names(&ancestor)? {
                wildcard.extend(corpus.utterances(command).iter().map(String::as_str));
            }
        }
        wildcard.retain(|text| !own.contains(text));
        wildcard.extend(corpus.misunderstood.iter().map(String::as_str));
        examples.extend(wildcard.into_iter().map(|text| LabeledUtterance {
            text: text.to_string(),
            label: WILDCARD_COMMAND.to_string(),
        }));

        Ok(Self {
            context: context.to_string(),
            examples,
        })
    }

    /// Distinct labels, sorted.
    #[must_use]
    pub fn labels(&self) -> Vec<String> {
        let labels: BTreeSet<&str> = self.examples.iter().map(|e| e.label.as_str()).collect();
        labels.into_iter().map(ToOwned::to_owned).collect()
    }

    /// Number of examples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.examples.len()
    }

    /// True without examples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }
}

/// Train/validation partition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Split {
    /// Training examples.
    pub train: Vec<LabeledUtterance>,
    /// Validation examples.
    pub validation: Vec<LabeledUtterance>,
}

/// Per-label split holding out `ratio` of each label (at least one when the label has
/// two or more examples, none for singletons).
#[must_use]
pub fn stratified_split(examples: &[LabeledUtterance], ratio: f32, rng: &mut ChaCha8Rng) -> Split {
    let mut by_label: BTreeMap<&str, Vec<&LabeledUtterance>> = BTreeMap::new();
    for example in examples {
        by_label.entry(example.label.as_str()).or_default().push(example);
    }
    let mut split = Split::default();
    for (_, mut group) in by_label {
        group.shuffle(rng);
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_precision_loss,
            clippy::cast_sign_loss
        )]
        let held_out = if group.len() < 2 {
            0
        } else {
            ((group.len() as f32 * ratio).round() as usize).clamp(1, group.len() - 1)
        };
        for (idx, example) in group.into_iter().enumerate() {
            if idx < held_out {
                split.validation.push(example.clone());
            } else {
                split.train.push(example.clone());
            }
        }
    }
    split
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use std::path::Path;

    fn write(root: &Path, rel: &str, body: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    fn corpus() -> UtteranceCorpus {
        serde_json::from_value(serde_json::json!({
            "commands": {
                "Order/track": ["where is my order", "track it"],
                "Refund/status": ["refund status", "where is my order"],
                "abort": ["stop"]
            },
            "misunderstood": ["sing a song"]
        }))
        .unwrap()
    }

    #[test]
    fn wildcard_uses_ancestor_utterances_minus_own() {
        let tmp = tempfile::tempdir().unwrap();
        let body = "class ResponseGenerator:\n    pass\n";
        write(tmp.path(), "_commands/Order/track.py", body);
        write(tmp.path(), "_commands/Refund/status.py", body);
        write(
            tmp.path(),
            "context_hierarchy_model.json",
            r#"{"Refund": {"parent": ["Order"]}}"#,
        );
        let definition = RoutingDefinition::build(tmp.path()).unwrap();

        let dataset = ContextDataset::build(&definition, &corpus(), "Refund").unwrap();
        let wildcard: Vec<&str> = dataset
            .examples
            .iter()
            .filter(|e| e.label == WILDCARD_COMMAND)
            .map(|e| e.text.as_str())
            .collect();
        assert_eq!(wildcard, vec!["sing a song", "track it"]);
        assert_eq!(dataset.labels(), vec!["Refund/status", "abort", "wildcard"]);
    }

    #[test]
    fn split_keeps_every_label_in_training() {
        let examples: Vec<LabeledUtterance> = (0..10)
            .map(|i| LabeledUtterance {
                text: format!("u{i}"),
                label: if i < 7 { "a".into() } else if i < 9 { "b".into() } else { "c".into() },
            })
            .collect();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let split = stratified_split(&examples, 0.3, &mut rng);
        assert_eq!(split.train.len() + split.validation.len(), 10);
        let held: Vec<&str> = split.validation.iter().map(|e| e.label.as_str()).collect();
        assert_eq!(held.iter().filter(|l| **l == "a").count(), 2);
        assert_eq!(held.iter().filter(|l| **l == "b").count(), 1);
        assert!(!held.contains(&"c"));
    }

    #[test]
    fn corpus_round_trips_through_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let path = UtteranceCorpus::default_path(tmp.path());
        corpus().save(&path).unwrap();
        assert_eq!(UtteranceCorpus::load(&path).unwrap(), corpus());
    }
}
