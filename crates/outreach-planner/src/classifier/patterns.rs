//! Regex tables for reply classification.
//!
//! Tables are checked in a fixed order: hard refusals, soft refusals, defer
//! phrases. A reply that hits a refusal is never read as a deferral, so
//! "not interested, maybe next month" is a refusal.

use std::sync::OnceLock;

use regex::Regex;

/// A compiled refusal pattern.
pub struct RefusalPattern {
    pub regex: Regex,
    pub confidence: f32,
    /// Hard refusals also ask us to stop contacting the person entirely.
    pub opt_out: bool,
}

/// A compiled deferral pattern with the delay it implies.
pub struct DeferPattern {
    pub regex: Regex,
    pub confidence: f32,
    pub days: u32,
}

/// What a table lookup found.
#[derive(Debug, Clone, PartialEq)]
pub enum TableMatch {
    Refusal {
        phrase: String,
        confidence: f32,
        opt_out: bool,
    },
    Defer {
        phrase: String,
        confidence: f32,
        days: u32,
    },
}

/// Which fallback lexicon a reply fell into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lexicon {
    Conversion,
    Positive,
    Objection,
}

/// All classifier tables, compiled once and reused.
pub struct PatternSet {
    refusals: Vec<RefusalPattern>,
    defers: Vec<DeferPattern>,
    conversion: Vec<Regex>,
    /// "haven't joined", "never registered": conversion words under a
    /// negation a few words back.
    negated_conversion: Regex,
    positive: Vec<Regex>,
    objection: Vec<Regex>,
}

impl Default for PatternSet {
    fn default() -> Self {
        Self::new()
    }
}

impl PatternSet {
    /// The process-wide compiled table set.
    pub fn shared() -> &'static PatternSet {
        static SHARED: OnceLock<PatternSet> = OnceLock::new();
        SHARED.get_or_init(PatternSet::new)
    }

    pub fn new() -> Self {
        let mut refusals = Vec::new();

        // =====================================================================
        // Hard refusals (opt out)
        // =====================================================================
        let hard: Vec<(&str, f32)> = vec![
            (r"(?i)\bstop\s+(?:messaging|texting|emailing|contacting|sending|writing)\b", 0.98),
            (r"(?i)\bunsubscribe\b", 0.98),
            (r"(?i)\b(?:don'?t|do\s+not|never)\s+(?:ever\s+)?(?:contact|message|email|text|dm)\s+me\b", 0.97),
            (r"(?i)\bremove\s+me\s+from\b", 0.95),
            (r"(?i)\btake\s+me\s+off\b", 0.95),
            (r"(?i)\bleave\s+me\s+alone\b", 0.95),
            (r"(?i)\bopt(?:\s|-)?(?:me\s+)?out\b", 0.95),
            (r"(?i)^\s*stop\s*[.!]*\s*$", 0.96),
        ];
        for (pat, conf) in &hard {
            refusals.push(RefusalPattern {
                regex: Regex::new(pat).expect("Invalid hard refusal regex"),
                confidence: *conf,
                opt_out: true,
            });
        }

        // =====================================================================
        // Soft refusals
        // =====================================================================
        let soft: Vec<(&str, f32)> = vec![
            (r"(?i)\bnot\s+(?:really\s+)?interested\b", 0.92),
            (r"(?i)\bno\s+thanks?\b", 0.90),
            (r"(?i)\bno,?\s+thank\s+you\b", 0.90),
            (r"(?i)\bnot\s+for\s+me\b", 0.88),
            (r"(?i)\b(?:i'?ll|i\s+will|gonna)\s+pass\b", 0.85),
            (r"(?i)\bno,?\s+i'?m\s+(?:good|ok|okay|fine)\b", 0.85),
            (r"(?i)\bnot\s+a\s+(?:good\s+)?fit\b", 0.80),
            (r"(?i)\bplease\s+don'?t\b", 0.80),
            (r"(?i)\bnope\b", 0.75),
        ];
        for (pat, conf) in &soft {
            refusals.push(RefusalPattern {
                regex: Regex::new(pat).expect("Invalid soft refusal regex"),
                confidence: *conf,
                opt_out: false,
            });
        }

        // =====================================================================
        // Deferrals
        // =====================================================================
        let defer_table: Vec<(&str, f32, u32)> = vec![
            (r"(?i)\btomorrow\b", 0.80, 1),
            (r"(?i)\bin\s+a\s+(?:few|couple(?:\s+of)?)\s+days\b", 0.85, 3),
            (r"(?i)\bnext\s+week\b", 0.90, 7),
            (r"(?i)\bremind\s+me\b", 0.80, 7),
            (r"(?i)\bin\s+a\s+(?:few|couple(?:\s+of)?)\s+weeks\b", 0.85, 14),
            (r"(?i)\bnot\s+(?:right\s+)?now\b", 0.80, 14),
            (r"(?i)\b(?:maybe|perhaps)\s+later\b", 0.80, 14),
            (r"(?i)\b(?:ask|ping|check\s+(?:in\s+)?with)\s+me\s+later\b", 0.85, 14),
            (r"(?i)\b(?:too\s+|really\s+|super\s+)?busy\b", 0.75, 14),
            (r"(?i)\bnext\s+month\b", 0.90, 30),
            (r"(?i)\bafter\s+the\s+holidays\b", 0.85, 30),
            (r"(?i)\bnext\s+quarter\b", 0.90, 90),
            (r"(?i)\bnext\s+year\b", 0.90, 180),
        ];
        let defers = defer_table
            .iter()
            .map(|(pat, conf, days)| DeferPattern {
                regex: Regex::new(pat).expect("Invalid defer regex"),
                confidence: *conf,
                days: *days,
            })
            .collect();

        // =====================================================================
        // Fallback lexicons
        // =====================================================================
        let compile = |patterns: &[&str]| -> Vec<Regex> {
            patterns
                .iter()
                .map(|p| Regex::new(p).expect("Invalid lexicon regex"))
                .collect()
        };

        let conversion = compile(&[
            r"(?i)\bsigned\s+up\b",
            r"(?i)\bsign\s+me\s+up\b",
            r"(?i)\bcount\s+me\s+in\b",
            // Only at the end of a clause: "I'm in!" but not "I'm in a meeting".
            r"(?i)\bi'?m\s+in\s*(?:[.!,;]|$)",
            r"(?i)\bjust\s+(?:joined|registered|linked|subscribed)\b",
            r"(?i)\b(?:i\s+)?(?:joined|registered|subscribed)\b",
            r"(?i)\blinked\s+(?:my\s+)?account\b",
            r"(?i)\blet'?s\s+do\s+it\b",
        ]);
        let negated_conversion = Regex::new(
            r"(?i)\b(?:not|never|haven'?t|hasn'?t|didn'?t|don'?t|won'?t|can'?t|yet\s+to)(?:\W+\w+){0,3}?\W+(?:join|joined|register|registered|subscribe|subscribed|sign|signed|link|linked)\b",
        )
        .expect("Invalid negated conversion regex");

        let positive = compile(&[
            // Affirmatives only count at the start of a clause, so "not sure"
            // stays out of the positive bucket.
            r"(?i)(?:^|[.!,;]\s*)(?:yes|yeah|yep|yup|sure|ok(?:ay)?)\b",
            r"(?i)\bsounds\s+(?:good|great|fun|interesting)\b",
            r"(?i)\b(?:great|awesome|cool|nice|love|perfect|excellent)\b",
            r"(?i)\b(?:interested|definitely|absolutely|happy\s+to)\b",
            r"(?i)\b(?:thanks|thank\s+you)\b",
        ]);

        let objection = compile(&[
            r"(?i)\b(?:too\s+)?expensive\b",
            r"(?i)\b(?:cost|costs|price|pricing)\b",
            r"(?i)\bdon'?t\s+have\s+(?:the\s+)?time\b",
            r"(?i)\bnot\s+sure\b",
            r"(?i)\b(?:concerned|worried|confusing|frustrat\w*)\b",
            r"(?i)\b(?:doesn'?t|does\s+not|didn'?t)\s+work\b",
            r"(?i)\b(?:problem|issue|complaint)s?\b",
        ]);

        Self {
            refusals,
            defers,
            conversion,
            negated_conversion,
            positive,
            objection,
        }
    }

    /// Check the refusal table, then the defer table.
    pub fn match_tables(&self, text: &str) -> Option<TableMatch> {
        if let Some((pattern, m)) = self
            .refusals
            .iter()
            .find_map(|p| p.regex.find(text).map(|m| (p, m)))
        {
            return Some(TableMatch::Refusal {
                phrase: m.as_str().trim().to_string(),
                confidence: pattern.confidence,
                opt_out: pattern.opt_out,
            });
        }

        self.defers
            .iter()
            .find_map(|p| p.regex.find(text).map(|m| (p, m)))
            .map(|(pattern, m)| TableMatch::Defer {
                phrase: m.as_str().trim().to_string(),
                confidence: pattern.confidence,
                days: pattern.days,
            })
    }

    /// The first fallback lexicon `text` hits, checked as conversion,
    /// positive, then objection. Negated conversion words never count as a
    /// conversion.
    pub fn match_lexicon(&self, text: &str) -> Option<Lexicon> {
        let hits = |set: &[Regex]| set.iter().any(|r| r.is_match(text));
        if hits(&self.conversion) && !self.negated_conversion.is_match(text) {
            Some(Lexicon::Conversion)
        } else if hits(&self.positive) {
            Some(Lexicon::Positive)
        } else if hits(&self.objection) {
            Some(Lexicon::Objection)
        } else {
            None
        }
    }

    pub fn refusal_count(&self) -> usize {
        self.refusals.len()
    }

    pub fn defer_count(&self) -> usize {
        self.defers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refusal(text: &str) -> Option<bool> {
        match PatternSet::shared().match_tables(text) {
            Some(TableMatch::Refusal { opt_out, .. }) => Some(opt_out),
            _ => None,
        }
    }

    fn defer_days(text: &str) -> Option<u32> {
        match PatternSet::shared().match_tables(text) {
            Some(TableMatch::Defer { days, .. }) => Some(days),
            _ => None,
        }
    }

    // =====================================================================
    // Refusals
    // =====================================================================

    #[test]
    fn test_hard_refusals_request_opt_out() {
        for text in [
            "Please stop messaging me",
            "UNSUBSCRIBE",
            "don't contact me again",
            "Do not email me",
            "remove me from this list",
            "leave me alone",
            "opt out",
            "stop",
            "Stop!",
        ] {
            assert_eq!(refusal(text), Some(true), "{}", text);
        }
    }

    #[test]
    fn test_soft_refusals_do_not_opt_out() {
        for text in [
            "not interested",
            "No thanks",
            "no thank you",
            "this is not for me",
            "I'll pass",
            "no, I'm good",
        ] {
            assert_eq!(refusal(text), Some(false), "{}", text);
        }
    }

    #[test]
    fn test_refusal_checked_before_defer() {
        assert_eq!(refusal("not interested, maybe next month"), Some(false));
        assert_eq!(refusal("stop messaging me, busy"), Some(true));
    }

    #[test]
    fn test_stop_inside_a_sentence_is_not_bare_stop() {
        assert_eq!(refusal("I can't stop thinking about the meetup"), None);
    }

    // =====================================================================
    // Deferrals
    // =====================================================================

    #[test]
    fn test_defer_phrases_carry_days() {
        assert_eq!(defer_days("ask me next week"), Some(7));
        assert_eq!(defer_days("Next month works better"), Some(30));
        assert_eq!(defer_days("not right now"), Some(14));
        assert_eq!(defer_days("I'm really busy"), Some(14));
        assert_eq!(defer_days("maybe next year"), Some(180));
        assert_eq!(defer_days("in a couple of weeks"), Some(14));
        assert_eq!(defer_days("sounds great"), None);
    }

    // =====================================================================
    // Lexicons
    // =====================================================================

    #[test]
    fn test_lexicon_order() {
        let set = PatternSet::shared();
        assert_eq!(set.match_lexicon("Just signed up, thanks!"), Some(Lexicon::Conversion));
        assert_eq!(set.match_lexicon("yes sounds good"), Some(Lexicon::Positive));
        assert_eq!(set.match_lexicon("seems too expensive"), Some(Lexicon::Objection));
        assert_eq!(set.match_lexicon("the weather is mild"), None);
        assert_eq!(set.match_lexicon("not sure about this"), Some(Lexicon::Objection));
        assert_eq!(set.match_lexicon("I'm in!"), Some(Lexicon::Conversion));
        assert_eq!(set.match_lexicon("ok, I'm in"), Some(Lexicon::Conversion));
        assert_eq!(set.match_lexicon("I registered last night"), Some(Lexicon::Conversion));
    }

    #[test]
    fn test_conversion_words_in_other_senses() {
        let set = PatternSet::shared();
        assert_ne!(set.match_lexicon("I'm in a meeting"), Some(Lexicon::Conversion));
        assert_ne!(set.match_lexicon("I haven't joined yet"), Some(Lexicon::Conversion));
        assert_ne!(set.match_lexicon("I never registered"), Some(Lexicon::Conversion));
        assert_ne!(set.match_lexicon("didn't sign up, sorry"), Some(Lexicon::Conversion));
        assert_ne!(
            set.match_lexicon("I have not linked my account"),
            Some(Lexicon::Conversion)
        );
    }

    #[test]
    fn test_unsubscribed_is_not_a_conversion() {
        // Hard refusal wins at the table stage; the lexicon alone would not
        // match "unsubscribe" as "subscribed".
        assert_eq!(PatternSet::shared().match_lexicon("unsubscribe"), None);
    }

    #[test]
    fn test_table_sizes() {
        let set = PatternSet::new();
        assert!(set.refusal_count() >= 15);
        assert!(set.defer_count() >= 10);
    }
}
