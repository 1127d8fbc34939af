use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Discriminator driving dispatch in the normalizer, validator, and
/// article fetcher. Kept flat rather than as a class hierarchy: each
/// downstream stage branches on this value directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    Law,
    RoyalDecree,
    OrganicLaw,
    LegislativeRd,
    Article,
    Code,
    Constitution,
    EuRegulation,
    EuDirective,
    EuDecision,
    Abbreviation,
    Contextual,
}

impl ReferenceKind {
    pub fn is_eu(self) -> bool {
        matches!(
            self,
            ReferenceKind::EuRegulation | ReferenceKind::EuDirective | ReferenceKind::EuDecision
        )
    }
}

/// Which extractor produced a reference and when, attached once at
/// creation and never altered afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provenance {
    pub agent: String,
    pub round: u32,
    pub created_at: DateTime<Utc>,
}

/// Booleans tracking which pipeline stages have touched a reference.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReferenceFlags {
    pub context_resolved: bool,
    pub title_resolved: bool,
    pub normalized: bool,
    pub validated: bool,
    pub inferred: bool,
    pub title_european: bool,
    pub hallucinated: bool,
    pub is_subpoint: bool,
}

/// Canonicalized category assigned by the normalizer (C9 step 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LawCategory {
    Normativa,
    Disposicion,
    Otra,
}

/// The central record threaded through the whole pipeline. Mutated only
/// by C7 -> C8 -> C9 -> C10 -> C12 in that order; never mutated after C12.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reference {
    pub raw_text: String,
    pub kind: ReferenceKind,
    pub law: Option<String>,
    pub article: Option<String>,
    pub subpoint_number: Option<String>,
    pub confidence: u8,
    pub provenance: Provenance,
    pub registry_id: Option<String>,
    pub registry_url: Option<String>,
    pub official_title: Option<String>,
    pub article_body: Option<String>,
    pub law_kind: Option<String>,
    pub category: Option<LawCategory>,
    pub flags: ReferenceFlags,
    /// Reason strings for non-validation / non-resolution, appended to,
    /// never cleared; this is the audit trail a failed stage writes to
    /// instead of aborting the run.
    pub audit: Vec<String>,
}

impl Reference {
    pub fn new(raw_text: impl Into<String>, kind: ReferenceKind, agent: &str, round: u32) -> Self {
        Reference {
            raw_text: raw_text.into(),
            kind,
            law: None,
            article: None,
            subpoint_number: None,
            confidence: 0,
            provenance: Provenance {
                agent: agent.to_string(),
                round,
                created_at: Utc::now(),
            },
            registry_id: None,
            registry_url: None,
            official_title: None,
            article_body: None,
            law_kind: None,
            category: None,
            flags: ReferenceFlags::default(),
            audit: Vec::new(),
        }
    }

    pub fn note(&mut self, reason: impl Into<String>) {
        self.audit.push(reason.into());
    }

    /// Demotes a reference after article-existence validation fails.
    /// P1 carve-out: this is the one case where confidence may drop, and
    /// it must land at exactly 0.
    pub fn mark_hallucinated(&mut self, reason: impl Into<String>) {
        self.confidence = 0;
        self.flags.hallucinated = true;
        self.flags.validated = false;
        self.note(reason);
    }

    /// P3: exportable iff EU with a synthesized CELEX, or BOE-ID set by
    /// the validator.
    pub fn is_exportable(&self) -> bool {
        if self.flags.hallucinated {
            return false;
        }
        if self.kind.is_eu() {
            return self.registry_id.is_some();
        }
        self.registry_id.is_some() && self.flags.validated
    }

    /// Normalized `(law, article)` pair used for semantic-equality
    /// comparisons when no `registry_id` is available yet.
    pub fn normalized_key(&self) -> Option<(String, String)> {
        let law = self.law.as_ref()?.trim().to_lowercase();
        let article = self.article.as_ref()?.trim().to_lowercase();
        if law.is_empty() {
            return None;
        }
        Some((law, article))
    }

    /// Two refs are semantically equal iff their `registry_id`s match
    /// (when both present) or their normalized `(law, article)` pairs
    /// match.
    pub fn semantically_equal(&self, other: &Reference) -> bool {
        if let (Some(a), Some(b)) = (&self.registry_id, &other.registry_id) {
            return a == b;
        }
        match (self.normalized_key(), other.normalized_key()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// Case-normalized canonical key used by extractor agents to filter
    /// out refs already seen in `previous_refs`.
    pub fn case_normalized_text(&self) -> String {
        self.raw_text.trim().to_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make(law: &str, article: &str) -> Reference {
        let mut r = Reference::new("x", ReferenceKind::Law, "A", 1);
        r.law = Some(law.to_string());
        r.article = Some(article.to_string());
        r
    }

    #[test]
    fn semantic_equality_by_law_article() {
        let a = make("Ley 39/2015", "17");
        let b = make("ley 39/2015", "17");
        assert!(a.semantically_equal(&b));
    }

    #[test]
    fn semantic_equality_by_registry_id_wins() {
        let mut a = make("Ley 39/2015", "17");
        let mut b = make("Ley distinta", "99");
        a.registry_id = Some("BOE-A-2015-10565".into());
        b.registry_id = Some("BOE-A-2015-10565".into());
        assert!(a.semantically_equal(&b));
    }

    #[test]
    fn hallucination_forces_zero_confidence() {
        let mut r = make("Codigo Penal", "999");
        r.confidence = 80;
        r.flags.validated = true;
        r.mark_hallucinated("article not found in index");
        assert_eq!(r.confidence, 0);
        assert!(r.flags.hallucinated);
        assert!(!r.flags.validated);
        assert!(!r.is_exportable());
    }

    #[test]
    fn eu_exportable_without_validated_flag() {
        let mut r = make("RGPD", "17");
        r.kind = ReferenceKind::EuRegulation;
        r.registry_id = Some("32016R0679".into());
        assert!(r.is_exportable());
    }
}
