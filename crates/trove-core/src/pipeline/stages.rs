//! Stage Implementations
//!
//! Each stage transforms a candidate list into another candidate list.
//! Retrieval stages merge fresh hits into the running set (identical chunk
//! ids collapse, keeping the maximum observed score); rescoring stages
//! adjust scores in place.

use std::collections::HashMap;

use chrono::Utc;

use crate::cache::{self, CacheOpts};
use crate::chunk::{SearchResult, Strategy};
use crate::embeddings::cosine_to_unit;
use crate::enhance::DocumentContext;
use crate::index::KeywordFilters;

use super::{PipelineError, PipelineServices, SearchOptions};

/// Floor score assigned to raw keyword hits
const KEYWORD_FLOOR_SCORE: f32 = 0.5;

/// Ideal chunk length for the length-ratio heuristic, in chars
const IDEAL_CHUNK_CHARS: f32 = 500.0;

/// Score multiplier applied to expansion chunks relative to their parent
const EXPANSION_SCORE_FACTOR: f32 = 0.8;

// ============================================================================
// SHARED HELPERS
// ============================================================================

/// Query tokens longer than 2 chars, lowercased (the pipeline drops short
/// tokens, not the keyword index)
pub(crate) fn query_tokens(query: &str) -> Vec<String> {
    query
        .split_whitespace()
        .map(|t| {
            t.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|t| t.chars().count() > 2)
        .collect()
}

/// Merge `fresh` into `current`: identical chunk ids collapse, the maximum
/// observed score is retained. A chunk found by both the keyword and a
/// vector-side strategy is tagged `Hybrid` so the hybrid-merge stage can
/// recombine both contributions.
pub(crate) fn merge_candidates(
    current: Vec<SearchResult>,
    fresh: Vec<SearchResult>,
) -> Vec<SearchResult> {
    let mut by_id: HashMap<String, SearchResult> = HashMap::with_capacity(current.len());
    for candidate in current.into_iter().chain(fresh) {
        match by_id.get_mut(&candidate.id) {
            Some(existing) => {
                let crossed_sets = (existing.strategy == Strategy::Keyword)
                    != (candidate.strategy == Strategy::Keyword);
                if candidate.score > existing.score {
                    *existing = candidate;
                }
                if crossed_sets {
                    existing.strategy = Strategy::Hybrid;
                }
            }
            None => {
                by_id.insert(candidate.id.clone(), candidate);
            }
        }
    }
    let mut merged: Vec<SearchResult> = by_id.into_values().collect();
    sort_by_score(&mut merged);
    merged
}

pub(crate) fn sort_by_score(candidates: &mut [SearchResult]) {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

/// 2-3 query variations: pluralization toggle, a synonym substitution, and
/// question forms
pub(crate) fn query_variants(query: &str) -> Vec<String> {
    let trimmed = query.trim().trim_end_matches('?');
    let mut variants: Vec<String> = Vec::new();

    // Pluralization toggle on the last word
    let words: Vec<&str> = trimmed.split_whitespace().collect();
    if let Some(last) = words.last() {
        let toggled = if let Some(stripped) = last.strip_suffix('s') {
            stripped.to_string()
        } else {
            format!("{}s", last)
        };
        if toggled.len() > 2 {
            let mut plural = words[..words.len() - 1].join(" ");
            if !plural.is_empty() {
                plural.push(' ');
            }
            plural.push_str(&toggled);
            variants.push(plural);
        }
    }

    // Synonym substitution from the static table
    let lower = trimmed.to_lowercase();
    for (term, synonyms) in crate::enhance::SYNONYMS {
        if lower.split_whitespace().any(|w| w == *term) {
            if let Some(first_synonym) = synonyms.split_whitespace().next() {
                variants.push(lower.replace(term, first_synonym));
            }
            break;
        }
    }

    // Question forms
    if !lower.starts_with("what") && !lower.starts_with("how") {
        variants.push(format!("what is {}?", trimmed));
        variants.push(format!("how to {}?", trimmed));
    }

    variants.truncate(3);
    variants
}

/// Embed a query through the embedding cache
async fn embed_query(
    services: &PipelineServices,
    text: &str,
) -> Result<Vec<f32>, PipelineError> {
    let key = cache::embedding_key(&services.provider.active_model_id(), text);
    let opts = CacheOpts {
        persist: true,
        allow_semantic: false,
        ..Default::default()
    };
    let vector = services
        .cache
        .get_or_compute_embedding(&key, &opts, || async {
            services.provider.embed(text).await.map(|e| e.vector)
        })
        .await?;
    Ok(vector)
}

/// Raw keyword retrieval mapped into scored candidates
async fn keyword_candidates(
    services: &PipelineServices,
    query: &str,
    target: usize,
) -> Result<Vec<SearchResult>, PipelineError> {
    let tokens = query_tokens(query);
    if tokens.is_empty() {
        return Ok(vec![]);
    }

    let hits = services
        .keyword
        .query(&tokens, target, &KeywordFilters::default())?;

    Ok(hits
        .into_iter()
        .map(|hit| {
            SearchResult::new(
                hit.id,
                hit.content,
                KEYWORD_FLOOR_SCORE,
                hit.metadata,
                Strategy::Keyword,
                format!("keyword match (bm25 {:.2})", hit.rank_score),
            )
        })
        .collect())
}

/// Raw vector retrieval mapped into scored candidates
async fn vector_candidates(
    services: &PipelineServices,
    query: &str,
    target: usize,
) -> Result<Vec<SearchResult>, PipelineError> {
    let embedding = embed_query(services, query).await?;
    let hits = {
        let index = services.vectors.read().await;
        index.query(&embedding, target)?
    };

    let mut candidates = Vec::with_capacity(hits.len());
    for hit in hits {
        let Some(chunk) = services.store.get_chunk(&hit.id)? else {
            continue;
        };
        candidates.push(SearchResult::new(
            hit.id,
            chunk.content,
            cosine_to_unit(hit.similarity),
            chunk.metadata,
            Strategy::Semantic,
            format!("vector similarity {:.2}", hit.similarity),
        ));
    }
    Ok(candidates)
}

// ============================================================================
// RETRIEVAL STAGES
// ============================================================================

pub(crate) async fn broad_keyword(
    services: &PipelineServices,
    query: &str,
    input: Vec<SearchResult>,
    target: usize,
) -> Result<Vec<SearchResult>, PipelineError> {
    let fresh = keyword_candidates(services, query, target).await?;
    Ok(merge_candidates(input, fresh))
}

pub(crate) async fn exhaustive_keyword(
    services: &PipelineServices,
    query: &str,
    input: Vec<SearchResult>,
    target: usize,
) -> Result<Vec<SearchResult>, PipelineError> {
    let mut merged = broad_keyword(services, query, input, target).await?;
    for variant in query_variants(query) {
        let fresh = keyword_candidates(services, &variant, target).await?;
        merged = merge_candidates(merged, fresh);
    }
    Ok(merged)
}

pub(crate) async fn vector_search(
    services: &PipelineServices,
    query: &str,
    input: Vec<SearchResult>,
    target: usize,
) -> Result<Vec<SearchResult>, PipelineError> {
    let fresh = vector_candidates(services, query, target).await?;
    Ok(merge_candidates(input, fresh))
}

pub(crate) async fn deep_vector(
    services: &PipelineServices,
    query: &str,
    input: Vec<SearchResult>,
    target: usize,
) -> Result<Vec<SearchResult>, PipelineError> {
    let mut merged = vector_search(services, query, input, target).await?;
    for variant in query_variants(query) {
        let fresh = vector_candidates(services, &variant, target).await?;
        merged = merge_candidates(merged, fresh);
    }
    Ok(merged)
}

/// Weighted hybrid combine of the vector and keyword sets already in the
/// running candidates: `score = 0.7 * vector + 0.3 * keyword`, where a
/// keyword item's contribution is its rank-based score `1 - i/N`
pub(crate) fn hybrid_merge(input: Vec<SearchResult>, target: usize) -> Vec<SearchResult> {
    // Rank keyword-set rows for the 1 - i/N contribution. Hybrid-tagged
    // rows were in the keyword set before an earlier merge collapsed them.
    let mut keyword_ranked: Vec<(String, f32)> = input
        .iter()
        .filter(|c| matches!(c.strategy, Strategy::Keyword | Strategy::Hybrid))
        .map(|c| (c.id.clone(), c.score))
        .collect();
    keyword_ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    let keyword_count = keyword_ranked.len().max(1);
    let keyword_rank_score: HashMap<String, f32> = keyword_ranked
        .iter()
        .enumerate()
        .map(|(i, (id, _))| (id.clone(), 1.0 - i as f32 / keyword_count as f32))
        .collect();

    // Best vector-side score per id
    let mut vector_score: HashMap<String, f32> = HashMap::new();
    for candidate in input.iter().filter(|c| c.strategy != Strategy::Keyword) {
        let slot = vector_score.entry(candidate.id.clone()).or_insert(0.0);
        if candidate.score > *slot {
            *slot = candidate.score;
        }
    }

    // One representative row per id (max score wins), then recombine
    let mut combined = merge_candidates(input, vec![]);
    for candidate in &mut combined {
        let vector_part = vector_score.get(&candidate.id).copied();
        let keyword_part = keyword_rank_score.get(&candidate.id).copied();

        let (score, strategy) = match (vector_part, keyword_part) {
            (Some(v), Some(k)) => (0.7 * v + 0.3 * k, Strategy::Hybrid),
            (Some(v), None) => (0.7 * v, candidate.strategy),
            (None, Some(k)) => (0.3 * k, Strategy::Keyword),
            (None, None) => (candidate.score, candidate.strategy),
        };
        candidate.score = score;
        candidate.strategy = strategy;
        candidate.explanation = format!("hybrid combine ({})", candidate.explanation);
    }

    sort_by_score(&mut combined);
    combined.truncate(target);
    combined
}

pub(crate) async fn multi_strategy(
    services: &PipelineServices,
    query: &str,
    input: Vec<SearchResult>,
    target: usize,
) -> Result<Vec<SearchResult>, PipelineError> {
    let keyword_fresh = keyword_candidates(services, query, target).await?;
    let vector_fresh = vector_candidates(services, query, target).await?;
    let merged = merge_candidates(input, merge_candidates(keyword_fresh, vector_fresh));
    Ok(hybrid_merge(merged, target))
}

/// Re-run retrieval with an enhanced query from the contextual enhancer
pub(crate) async fn contextual(
    services: &PipelineServices,
    query: &str,
    opts: &SearchOptions,
    input: Vec<SearchResult>,
    target: usize,
) -> Result<Vec<SearchResult>, PipelineError> {
    let Some(enhancer) = &services.enhancer else {
        return Ok(input);
    };

    let context = opts.context.clone().unwrap_or_else(DocumentContext::default);
    let enhanced = enhancer.enhance(query, &context).await?;

    // Vector retrieval with the combined vector
    let vector_hits = {
        let index = services.vectors.read().await;
        index.query(&enhanced.combined_vector, target)
    };
    let mut fresh: Vec<SearchResult> = Vec::new();
    if let Ok(hits) = vector_hits {
        for hit in hits {
            let Some(chunk) = services.store.get_chunk(&hit.id)? else {
                continue;
            };
            fresh.push(SearchResult::new(
                hit.id,
                chunk.content,
                cosine_to_unit(hit.similarity),
                chunk.metadata,
                Strategy::Contextual,
                format!("enhanced-query similarity {:.2}", hit.similarity),
            ));
        }
    }

    // Keyword retrieval with the enhanced text
    for mut candidate in keyword_candidates(services, &enhanced.enhanced_text, target).await? {
        candidate.strategy = Strategy::Contextual;
        candidate.explanation = format!("enhanced-query {}", candidate.explanation);
        fresh.push(candidate);
    }

    Ok(merge_candidates(input, fresh))
}

/// Pull adjacent chunks of the top candidates into the candidate set
pub(crate) async fn document_expansion(
    services: &PipelineServices,
    input: Vec<SearchResult>,
    target: usize,
) -> Result<Vec<SearchResult>, PipelineError> {
    let mut fresh: Vec<SearchResult> = Vec::new();

    for candidate in input.iter().take(target / 3 + 1) {
        let Some(chunk) = services.store.get_chunk(&candidate.id)? else {
            continue;
        };
        let (previous, next) = services.store.neighbors(&chunk)?;
        for neighbor in [previous, next].into_iter().flatten() {
            fresh.push(SearchResult::new(
                neighbor.id.clone(),
                neighbor.content.clone(),
                candidate.score * EXPANSION_SCORE_FACTOR,
                neighbor.metadata.clone(),
                candidate.strategy,
                format!("adjacent to {}", candidate.id),
            ));
        }
    }

    Ok(merge_candidates(input, fresh))
}

// ============================================================================
// RESCORING STAGES
// ============================================================================

/// Cheap multiplicative adjustments: exact substring, title match, recency,
/// code flag, length ratio
pub(crate) fn heuristic_rerank(query: &str, mut input: Vec<SearchResult>) -> Vec<SearchResult> {
    let query_lower = query.to_lowercase();
    let tokens = query_tokens(query);
    let now = Utc::now();

    for candidate in &mut input {
        candidate.note_original_score();
        let mut score = candidate.score;

        let content_lower = candidate.content.to_lowercase();
        if content_lower.contains(&query_lower) {
            score *= 1.3;
        }

        if let Some(title) = &candidate.source_metadata.title {
            let title_lower = title.to_lowercase();
            if tokens.iter().any(|t| title_lower.contains(t.as_str())) {
                score *= 1.2;
            }
        }

        if let Some(created_at) = candidate.source_metadata.created_at {
            let age_days = (now - created_at).num_days().max(0) as f32;
            let recency = (1.0 - age_days / 365.0).clamp(0.0, 1.0);
            score *= 1.0 + 0.1 * recency;
        }

        if candidate.source_metadata.has_code {
            score *= 1.15;
        }

        let length_ratio = candidate.content.len() as f32 / IDEAL_CHUNK_CHARS;
        if length_ratio < 0.2 || length_ratio > 5.0 {
            score *= 0.9;
        }

        candidate.score = score;
    }

    sort_by_score(&mut input);
    input
}

/// Attach adjacent-chunk context to the top candidates
pub(crate) async fn context_enrichment(
    services: &PipelineServices,
    input: Vec<SearchResult>,
    target: usize,
) -> Result<Vec<SearchResult>, PipelineError> {
    let mut enriched = input;

    for candidate in enriched.iter_mut().take(target) {
        if candidate.context.is_some() {
            continue;
        }

        let chunk_id = candidate.id.clone();
        let store = &services.store;
        let chunk = services
            .cache
            .get_or_compute_doc(
                &cache::doc_key(&chunk_id),
                &CacheOpts::default(),
                || async {
                    store
                        .get_chunk(&chunk_id)?
                        .ok_or_else(|| PipelineError::MissingChunk(chunk_id.clone()))
                },
            )
            .await;

        let Ok(chunk) = chunk else { continue };
        let (previous, next) = services.store.neighbors(&chunk)?;
        if previous.is_none() && next.is_none() {
            continue;
        }

        let mut context = String::new();
        if let Some(previous) = previous {
            context.push_str(&previous.content);
        }
        if let Some(next) = next {
            if !context.is_empty() {
                context.push_str("\n---\n");
            }
            context.push_str(&next.content);
        }

        candidate.context = Some(context);
        candidate.annotations.context_enriched = true;
    }

    Ok(enriched)
}

/// Merge the top results of generated query variations
pub(crate) async fn semantic_expansion(
    services: &PipelineServices,
    query: &str,
    input: Vec<SearchResult>,
    target: usize,
) -> Result<Vec<SearchResult>, PipelineError> {
    let mut merged = input;
    let per_variant = (target / 2).max(3);

    for variant in query_variants(query) {
        let keyword_fresh = keyword_candidates(services, &variant, per_variant).await?;
        merged = merge_candidates(merged, keyword_fresh);

        if let Ok(vector_fresh) = vector_candidates(services, &variant, per_variant).await {
            merged = merge_candidates(merged, vector_fresh);
        }
    }

    Ok(merged)
}

/// Final scoring: clamp to [0, 1], apply per-candidate confidence
/// adjustments, multiply, sort, truncate to the caller's limit
pub(crate) fn quality_filter(mut input: Vec<SearchResult>, limit: usize) -> Vec<SearchResult> {
    for candidate in &mut input {
        let score = candidate.score.clamp(0.0, 1.0);

        let mut confidence = 1.0_f32;
        match candidate.strategy {
            Strategy::Contextual => confidence *= 1.1,
            Strategy::Hybrid => confidence *= 1.05,
            _ => {}
        }
        if candidate.annotations.context_enriched {
            confidence *= 1.1;
        }
        if candidate.source_metadata.has_code {
            confidence *= 1.05;
        }

        candidate.score = (score * confidence).clamp(0.0, 1.0);
    }

    sort_by_score(&mut input);
    input.truncate(limit);
    input
}

// ============================================================================
// TESTS
// ============================================================================
