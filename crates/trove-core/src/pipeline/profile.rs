//! Pipeline Profiles
//!
//! A profile is a named, ordered list of stage configurations. Each stage
//! carries a candidate multiplier `m`; at stage entry the target candidate
//! count is `ceil(limit * m)`.

use serde::{Deserialize, Serialize};

// ============================================================================
// PROFILES
// ============================================================================

/// Shipped retrieval profiles, ordered from cheapest to most thorough
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SearchProfile {
    /// Keyword + vector, minimal post-processing
    Fast,
    /// Hybrid merge with heuristic rerank and context enrichment
    #[default]
    Balanced,
    /// Adds contextual retrieval, cross-encoder rerank, semantic expansion
    Accurate,
    /// Exhaustive multi-variant retrieval with document expansion
    Research,
}

impl std::fmt::Display for SearchProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SearchProfile::Fast => write!(f, "fast"),
            SearchProfile::Balanced => write!(f, "balanced"),
            SearchProfile::Accurate => write!(f, "accurate"),
            SearchProfile::Research => write!(f, "research"),
        }
    }
}

impl std::str::FromStr for SearchProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fast" => Ok(SearchProfile::Fast),
            "balanced" => Ok(SearchProfile::Balanced),
            "accurate" => Ok(SearchProfile::Accurate),
            "research" => Ok(SearchProfile::Research),
            _ => Err(format!("Unknown search profile: {}", s)),
        }
    }
}

// ============================================================================
// STAGES
// ============================================================================

/// Every stage the pipeline knows how to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Tokenized keyword retrieval (tokens > 2 chars)
    BroadKeyword,
    /// Keyword retrieval over the query plus generated variants
    ExhaustiveKeyword,
    /// Dense vector retrieval for the query embedding
    VectorSearch,
    /// Vector retrieval over the query plus generated variants
    DeepVector,
    /// Weighted merge of keyword and vector candidate sets
    HybridMerge,
    /// Fresh keyword + vector retrieval merged into the running set
    MultiStrategy,
    /// Retrieval with an enhanced query from the contextual enhancer
    Contextual,
    /// Pull adjacent chunks of top candidates into the candidate set
    DocumentExpansion,
    /// Cheap multiplicative scoring adjustments
    HeuristicRerank,
    /// Neural cross-encoder rerank
    CrossEncoderRerank,
    /// Attach adjacent-chunk context to top candidates
    ContextEnrichment,
    /// Merge top results of 2-3 generated query variations
    SemanticExpansion,
    /// Clamp, confidence-adjust, sort, truncate
    QualityFilter,
}

impl StageKind {
    /// Stable stage name used in metrics and logs
    pub fn name(&self) -> &'static str {
        match self {
            StageKind::BroadKeyword => "broad_keyword",
            StageKind::ExhaustiveKeyword => "exhaustive_keyword",
            StageKind::VectorSearch => "vector_search",
            StageKind::DeepVector => "deep_vector",
            StageKind::HybridMerge => "hybrid_merge",
            StageKind::MultiStrategy => "multi_strategy",
            StageKind::Contextual => "contextual",
            StageKind::DocumentExpansion => "document_expansion",
            StageKind::HeuristicRerank => "heuristic_rerank",
            StageKind::CrossEncoderRerank => "cross_encoder_rerank",
            StageKind::ContextEnrichment => "context_enrichment",
            StageKind::SemanticExpansion => "semantic_expansion",
            StageKind::QualityFilter => "quality_filter",
        }
    }
}

/// One stage in a profile
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageConfig {
    /// Which stage to run
    pub kind: StageKind,
    /// Disabled stages are recorded in metrics but not executed
    pub enabled: bool,
    /// Candidate multiplier applied to the caller's limit
    pub multiplier: f32,
}

impl StageConfig {
    fn new(kind: StageKind, multiplier: f32) -> Self {
        Self {
            kind,
            enabled: true,
            multiplier,
        }
    }

    /// Target candidate count for a caller limit
    pub fn target(&self, limit: usize) -> usize {
        ((limit as f32) * self.multiplier).ceil() as usize
    }
}

impl SearchProfile {
    /// The ordered stage list for this profile
    pub fn stages(&self) -> Vec<StageConfig> {
        use StageKind::*;
        match self {
            SearchProfile::Fast => vec![
                StageConfig::new(BroadKeyword, 3.0),
                StageConfig::new(VectorSearch, 2.0),
                StageConfig::new(QualityFilter, 1.0),
            ],
            SearchProfile::Balanced => vec![
                StageConfig::new(BroadKeyword, 5.0),
                StageConfig::new(VectorSearch, 3.0),
                StageConfig::new(HybridMerge, 2.0),
                StageConfig::new(HeuristicRerank, 1.5),
                StageConfig::new(ContextEnrichment, 1.0),
                StageConfig::new(QualityFilter, 1.0),
            ],
            SearchProfile::Accurate => vec![
                StageConfig::new(BroadKeyword, 10.0),
                StageConfig::new(VectorSearch, 5.0),
                StageConfig::new(HybridMerge, 3.0),
                StageConfig::new(Contextual, 2.5),
                StageConfig::new(HeuristicRerank, 2.0),
                StageConfig::new(CrossEncoderRerank, 1.5),
                StageConfig::new(ContextEnrichment, 1.2),
                StageConfig::new(SemanticExpansion, 1.1),
                StageConfig::new(QualityFilter, 1.0),
            ],
            SearchProfile::Research => vec![
                StageConfig::new(ExhaustiveKeyword, 20.0),
                StageConfig::new(DeepVector, 10.0),
                StageConfig::new(MultiStrategy, 5.0),
                StageConfig::new(DocumentExpansion, 3.0),
                StageConfig::new(HeuristicRerank, 1.5),
                StageConfig::new(ContextEnrichment, 1.2),
                StageConfig::new(QualityFilter, 1.0),
            ],
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_round_trip() {
        for profile in [
            SearchProfile::Fast,
            SearchProfile::Balanced,
            SearchProfile::Accurate,
            SearchProfile::Research,
        ] {
            let parsed: SearchProfile = profile.to_string().parse().unwrap();
            assert_eq!(parsed, profile);
        }
    }

    #[test]
    fn test_every_profile_ends_with_quality_filter() {
        for profile in [
            SearchProfile::Fast,
            SearchProfile::Balanced,
            SearchProfile::Accurate,
            SearchProfile::Research,
        ] {
            let stages = profile.stages();
            assert_eq!(stages.last().unwrap().kind, StageKind::QualityFilter);
            assert!((stages.last().unwrap().multiplier - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_stage_target_rounds_up() {
        let stage = StageConfig::new(StageKind::Contextual, 2.5);
        assert_eq!(stage.target(3), 8); // ceil(7.5)
        assert_eq!(stage.target(10), 25);
    }

    #[test]
    fn test_fast_profile_shape() {
        let stages = SearchProfile::Fast.stages();
        assert_eq!(stages.len(), 3);
        assert_eq!(stages[0].kind, StageKind::BroadKeyword);
        assert!((stages[0].multiplier - 3.0).abs() < 1e-6);
        assert_eq!(stages[1].kind, StageKind::VectorSearch);
        assert!((stages[1].multiplier - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_research_profile_uses_variant_stages() {
        let stages = SearchProfile::Research.stages();
        assert_eq!(stages[0].kind, StageKind::ExhaustiveKeyword);
        assert!((stages[0].multiplier - 20.0).abs() < 1e-6);
        assert_eq!(stages[1].kind, StageKind::DeepVector);
        assert!(stages.iter().all(|s| s.kind != StageKind::VectorSearch));
    }
}
