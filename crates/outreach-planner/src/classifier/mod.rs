//! Reply classification.
//!
//! The pattern tables are a coarse, inspectable first pass. An optional
//! second backend (usually an LLM) sits behind [`ResponseClassifier`] and
//! is only consulted for replies no table recognized.

pub mod patterns;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use outreach_core::goal::{DecisionMethod, Intent, Sentiment};

use crate::error::ClassifierError;
use patterns::{Lexicon, PatternSet, TableMatch};

/// How a reply was read.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    pub sentiment: Sentiment,
    pub intent: Intent,
    pub defer_days: Option<u32>,
    pub note: String,
    pub method: DecisionMethod,
    pub confidence: f32,
    pub matched_phrase: Option<String>,
    /// The contact asked never to be contacted again.
    pub opt_out: bool,
}

impl Classification {
    fn heuristic(sentiment: Sentiment, intent: Intent, confidence: f32, note: &str) -> Self {
        Self {
            sentiment,
            intent,
            defer_days: None,
            note: note.to_string(),
            method: DecisionMethod::Heuristic,
            confidence,
            matched_phrase: None,
            opt_out: false,
        }
    }

    pub fn is_refusal(&self) -> bool {
        self.sentiment == Sentiment::Refusal
    }
}

/// A backend that can classify a reply.
#[async_trait]
pub trait ResponseClassifier: Send + Sync {
    async fn classify(&self, text: &str) -> Result<Classification, ClassifierError>;
}

/// Deterministic classifier over the pattern tables and lexicons.
#[derive(Clone, Copy)]
pub struct PatternClassifier {
    patterns: &'static PatternSet,
}

impl Default for PatternClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl PatternClassifier {
    pub fn new() -> Self {
        Self {
            patterns: PatternSet::shared(),
        }
    }

    /// Refusal and defer tables only. `None` means no table recognized the
    /// reply.
    pub fn classify_tables(&self, text: &str) -> Option<Classification> {
        match self.patterns.match_tables(text)? {
            TableMatch::Refusal {
                phrase,
                confidence,
                opt_out,
            } => Some(Classification {
                sentiment: Sentiment::Refusal,
                intent: Intent::Refusal,
                defer_days: None,
                note: if opt_out {
                    format!("hard refusal \"{}\"; opt out requested", phrase)
                } else {
                    format!("refusal \"{}\"", phrase)
                },
                method: DecisionMethod::RuleMatch,
                confidence,
                matched_phrase: Some(phrase),
                opt_out,
            }),
            TableMatch::Defer {
                phrase,
                confidence,
                days,
            } => Some(Classification {
                sentiment: Sentiment::Neutral,
                intent: Intent::Deferred,
                defer_days: Some(days),
                note: format!("deferral \"{}\" ({} days)", phrase, days),
                method: DecisionMethod::RuleMatch,
                confidence,
                matched_phrase: Some(phrase),
                opt_out: false,
            }),
        }
    }

    /// Fallback reading when no table matched. Ambiguity resolves to
    /// neutral/interested.
    pub fn classify_fallback(&self, text: &str) -> Classification {
        if text.trim().is_empty() {
            return Classification::heuristic(Sentiment::Neutral, Intent::Ignored, 0.9, "empty reply");
        }
        if text.contains('?') {
            return Classification::heuristic(Sentiment::Neutral, Intent::Question, 0.7, "question");
        }
        match self.patterns.match_lexicon(text) {
            Some(Lexicon::Conversion) => Classification::heuristic(
                Sentiment::Positive,
                Intent::Converted,
                0.7,
                "conversion language",
            ),
            Some(Lexicon::Positive) => Classification::heuristic(
                Sentiment::Positive,
                Intent::Interested,
                0.6,
                "positive language",
            ),
            Some(Lexicon::Objection) => Classification::heuristic(
                Sentiment::Negative,
                Intent::Objection,
                0.6,
                "objection language",
            ),
            None => Classification::heuristic(
                Sentiment::Neutral,
                Intent::Interested,
                0.3,
                "no signal; assuming neutral interest",
            ),
        }
    }

    /// Tables first, then the fallback.
    pub fn classify_text(&self, text: &str) -> Classification {
        self.classify_tables(text)
            .unwrap_or_else(|| self.classify_fallback(text))
    }
}

#[async_trait]
impl ResponseClassifier for PatternClassifier {
    async fn classify(&self, text: &str) -> Result<Classification, ClassifierError> {
        Ok(self.classify_text(text))
    }
}

/// Tables, then an optional second backend, then the heuristic fallback.
///
/// Never fails: a backend error degrades to the heuristic reading.
pub struct LayeredClassifier {
    patterns: PatternClassifier,
    backend: Option<Arc<dyn ResponseClassifier>>,
}

impl Default for LayeredClassifier {
    fn default() -> Self {
        Self::patterns_only()
    }
}

impl LayeredClassifier {
    pub fn patterns_only() -> Self {
        Self {
            patterns: PatternClassifier::new(),
            backend: None,
        }
    }

    pub fn with_backend(backend: Arc<dyn ResponseClassifier>) -> Self {
        Self {
            patterns: PatternClassifier::new(),
            backend: Some(backend),
        }
    }

    pub async fn classify_reply(&self, text: &str) -> Classification {
        if let Some(hit) = self.patterns.classify_tables(text) {
            debug!(intent = %hit.intent, note = %hit.note, "Reply matched pattern table");
            return hit;
        }
        if text.trim().is_empty() {
            return self.patterns.classify_fallback(text);
        }

        if let Some(backend) = &self.backend {
            match backend.classify(text).await {
                Ok(mut classification) => {
                    classification.method = DecisionMethod::Llm;
                    return classification;
                }
                Err(e) => warn!(error = %e, "Classifier backend failed; using heuristic"),
            }
        }
        self.patterns.classify_fallback(text)
    }
}

#[async_trait]
impl ResponseClassifier for LayeredClassifier {
    async fn classify(&self, text: &str) -> Result<Classification, ClassifierError> {
        Ok(self.classify_reply(text).await)
    }
}
