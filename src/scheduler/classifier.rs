//! Heuristic request complexity classification
//!
//! Incoming text is bucketed into a workload kind with an estimated token
//! cost. Rules are evaluated in a fixed order and the first match wins, so
//! a short question ending in `?` is always treated as yes/no even if it
//! also looks like a definition.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Default maximum number of cached classifications
pub const DEFAULT_CACHE_SIZE: usize = 1000;

/// Workload kind inferred from the request text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionKind {
    YesNo,
    Math,
    Definition,
    Complex,
    General,
}

/// Coarse cost tier used by complexity-tiered routing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    #[default]
    Medium,
    High,
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Complexity::Simple => "simple",
            Complexity::Medium => "medium",
            Complexity::High => "high",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplexityClassification {
    #[serde(rename = "type")]
    pub kind: QuestionKind,
    pub complexity: Complexity,
    pub estimated_tokens: u32,
}

impl ComplexityClassification {
    const fn new(kind: QuestionKind, complexity: Complexity, estimated_tokens: u32) -> Self {
        Self {
            kind,
            complexity,
            estimated_tokens,
        }
    }

    /// Classification used when nothing more specific applies
    pub const fn general() -> Self {
        Self::new(QuestionKind::General, Complexity::Medium, 50)
    }
}

impl Default for ComplexityClassification {
    fn default() -> Self {
        Self::general()
    }
}

/// Classifies request text and caches results with FIFO eviction
#[derive(Debug)]
pub struct ComplexityClassifier {
    yes_no_prefix: Regex,
    true_false: Regex,
    arithmetic: Regex,
    math_keyword: Regex,
    number: Regex,
    definition_prefix: Regex,
    complex_keyword: Regex,

    cache: HashMap<String, ComplexityClassification>,
    /// Keys in insertion order, oldest at the front
    insertion_order: VecDeque<String>,
    max_size: usize,
}

impl Default for ComplexityClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_SIZE)
    }
}

impl ComplexityClassifier {
    /// Create a classifier whose cache holds at most `max_size` entries
    pub fn new(max_size: usize) -> Self {
        Self {
            yes_no_prefix: compile(
                r"^(is|are|was|were|do|does|did|can|could|will|would|should|has|have|had|am)\b",
            ),
            true_false: compile(r"^(true|false)[.!?]?$"),
            arithmetic: compile(r"\d+(\.\d+)?\s*[-+*/^%=x×÷]\s*\d+"),
            math_keyword: compile(
                r"\b(calculate|compute|solve|equation|sum|multiply|divide|plus|minus)\b",
            ),
            number: compile(r"\d+(\.\d+)?"),
            definition_prefix: compile(r"^((what|who|when|where)\s+(is|are|was|were)\b|(define|name)\b)"),
            complex_keyword: compile(
                r"\b(why|how|explain|describe|compare|analy[sz]e)\b|tell me about",
            ),
            cache: HashMap::new(),
            insertion_order: VecDeque::new(),
            max_size: max_size.max(1),
        }
    }

    /// Classify a request, consulting and filling the cache
    pub fn analyze_question(&mut self, text: &str) -> ComplexityClassification {
        let normalized = text.trim().to_lowercase();
        if normalized.is_empty() {
            return ComplexityClassification::general();
        }

        if let Some(hit) = self.cache.get(&normalized) {
            return *hit;
        }

        let classification = self.classify(&normalized);
        trace!(
            "Classified question as {:?}/{} ({} tokens)",
            classification.kind,
            classification.complexity,
            classification.estimated_tokens
        );
        self.insert(normalized, classification);
        classification
    }

    /// Evaluate the ordered rules against already-normalized text
    fn classify(&self, text: &str) -> ComplexityClassification {
        let words = text.split_whitespace().count();

        let looks_yes_no = self.yes_no_prefix.is_match(text)
            || self.true_false.is_match(text)
            || text.ends_with('?');
        if looks_yes_no && words < 15 {
            return ComplexityClassification::new(QuestionKind::YesNo, Complexity::Simple, 10);
        }

        if self.arithmetic.is_match(text)
            || self.math_keyword.is_match(text)
            || self.number.find_iter(text).count() >= 2
        {
            return ComplexityClassification::new(QuestionKind::Math, Complexity::Medium, 30);
        }

        if self.definition_prefix.is_match(text) && words < 10 {
            return ComplexityClassification::new(QuestionKind::Definition, Complexity::Simple, 25);
        }

        if self.complex_keyword.is_match(text) || words > 15 {
            return ComplexityClassification::new(QuestionKind::Complex, Complexity::High, 100);
        }

        ComplexityClassification::general()
    }

    fn insert(&mut self, key: String, value: ComplexityClassification) {
        while self.cache.len() >= self.max_size {
            match self.insertion_order.pop_front() {
                Some(oldest) => {
                    self.cache.remove(&oldest);
                }
                None => break,
            }
        }
        self.insertion_order.push_back(key.clone());
        self.cache.insert(key, value);
    }

    /// Whether `text` (after normalization) is currently cached
    pub fn contains(&self, text: &str) -> bool {
        self.cache.contains_key(&text.trim().to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }
}

fn compile(pattern: &str) -> Regex {
    // Patterns are literals in this file
    Regex::new(pattern).unwrap_or_else(|e| panic!("invalid classifier pattern {}: {}", pattern, e))
}
