use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static NON_WORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^\p{L}\p{N}']+").expect("token pattern compiles"));

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Hashed n-gram feature layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureConfig {
    /// Number of hash buckets.
    pub dimension: usize,
    /// Smallest word n-gram.
    pub word_ngram_min: usize,
    /// Largest word n-gram.
    pub word_ngram_max: usize,
    /// Character n-gram range, when enabled.
    #[serde(default)]
    pub char_ngrams: Option<(usize, usize)>,
}

impl FeatureConfig {
    /// Word uni- and bigrams.
    #[must_use]
    pub const fn words(dimension: usize) -> Self {
        Self {
            dimension,
            word_ngram_min: 1,
            word_ngram_max: 2,
            char_ngrams: None,
        }
    }

    /// Word uni/bigrams plus character n-grams in `min..=max`.
    #[must_use]
    pub const fn words_and_chars(dimension: usize, min: usize, max: usize) -> Self {
        Self {
            dimension,
            word_ngram_min: 1,
            word_ngram_max: 2,
            char_ngrams: Some((min, max)),
        }
    }
}

/// Sparse, L2-normalised feature vector (`(bucket, value)` sorted by bucket).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SparseVector {
    entries: Vec<(usize, f32)>,
}

impl SparseVector {
    /// Non-zero entries.
    #[must_use]
    pub fn entries(&self) -> &[(usize, f32)] {
        &self.entries
    }

    /// True for text without any token.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Lower-cases and splits text into word tokens.
#[must_use]
pub fn tokenize(text: &str) -> Vec<String> {
    NON_WORD
        .split(&text.to_lowercase())
        .filter(|token| !token.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

/// 64-bit FNV-1a.
#[must_use]
pub fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Turns utterances into hashed feature vectors.
#[derive(Debug, Clone)]
pub struct FeatureHasher {
    config: FeatureConfig,
}

impl FeatureHasher {
    /// Hasher for `config`.
    #[must_use]
    pub const fn new(config: FeatureConfig) -> Self {
        Self { config }
    }

    /// Layout in use.
    #[must_use]
    pub const fn config(&self) -> &FeatureConfig {
        &self.config
    }

    /// Feature vector of `text`.
    #[must_use]
    pub fn transform(&self, text: &str) -> SparseVector {
        let dimension = self.config.dimension.max(1);
        let mut counts: Vec<(usize, f32)> = Vec::new();
        let mut bump = |feature: &str| {
            #[allow(clippy::cast_possible_truncation)]
            let bucket = (fnv1a(feature.as_bytes()) % dimension as u64) as usize;
            counts.push((bucket, 1.0));
        };

        let tokens = tokenize(text);
        for n in self.config.word_ngram_min.max(1)..=self.config.word_ngram_max {
            for window in tokens.windows(n) {
                bump(&format!("w:{}", window.join(" ")));
            }
        }
        if let Some((min, max)) = self.config.char_ngrams {
            for token in &tokens {
                let chars: Vec<char> = format!("<{token}>").chars().collect();
                for n in min.max(1)..=max {
                    for window in chars.windows(n) {
                        bump(&format!("c:{}", window.iter().collect::<String>()));
                    }
                }
            }
        }

        counts.sort_by_key(|(bucket, _)| *bucket);
        let mut entries: Vec<(usize, f32)> = Vec::with_capacity(counts.len());
        for (bucket, value) in counts {
            match entries.last_mut() {
                Some((last, total)) if *last == bucket => *total += value,
                _ => entries.push((bucket, value)),
            }
        }
        let norm = entries.iter().map(|(_, v)| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for (_, value) in &mut entries {
                *value /= norm;
            }
        }
        SparseVector { entries }
    }
}
