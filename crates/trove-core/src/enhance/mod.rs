//! Contextual Enhancer
//!
//! Rewrites a query or passage with a generative model so its embedding
//! reflects intent and synonymy better. The combined vector blends the
//! original and enhanced embeddings, weighted by a confidence heuristic.
//!
//! When no generative backend is configured (or it fails), a simple
//! template enhancement applies: prepend the document type, append the user
//! intent, and inject a small static synonym table. Degraded results carry
//! confidence <= 0.7.
//!
//! Results are cached under `contextual:{hash(text)}:{hash(context)}` with a
//! 24 h TTL, persisted.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::{contextual_key, CacheOpts, MultiTierCache};
use crate::embeddings::{l2_normalize, Embedding, EmbeddingError, EmbeddingProvider};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Maximum prompt length in chars; truncation occurs at sentence boundaries
pub const MAX_PROMPT_CHARS: usize = 2000;

/// TTL for cached enhancement results
const CACHE_TTL: Duration = Duration::from_secs(24 * 3600);

/// Confidence ceiling for the degraded (non-generative) path
const SIMPLE_CONFIDENCE_CAP: f32 = 0.7;

/// Static synonym table, shared with the pipeline's query-variant
/// generation
pub(crate) const SYNONYMS: &[(&str, &str)] = &[
    ("open", "read access load"),
    ("file", "document path"),
    ("delete", "remove erase"),
    ("error", "failure exception fault"),
    ("create", "make new build"),
    ("search", "find lookup query"),
    ("config", "configuration settings options"),
    ("install", "setup deploy"),
    ("fast", "quick performant"),
    ("memory", "ram allocation heap"),
];

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Enhancer error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum EnhanceError {
    /// Input text was empty
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    /// Embedding the original/enhanced text failed on every backend
    #[error("Embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),
}

// ============================================================================
// CONTEXT & STRATEGY
// ============================================================================

/// Context describing the document/query being enhanced
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DocumentContext {
    /// Kind of document ("api reference", "tutorial", ...)
    pub document_type: Option<String>,
    /// What the user is trying to accomplish
    pub user_intent: Option<String>,
    /// Recent queries in this session
    #[serde(default)]
    pub previous_queries: Vec<String>,
    /// Titles/ids of related documents
    #[serde(default)]
    pub related_documents: Vec<String>,
    /// Free-form metadata
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl DocumentContext {
    /// Deterministic fingerprint for cache keying
    pub fn fingerprint(&self) -> String {
        // BTreeMap iteration order makes this stable for equal contexts
        serde_json::to_string(self).unwrap_or_default()
    }

    /// How many of the rich fields are present (confidence heuristic input)
    fn rich_field_count(&self) -> usize {
        let mut count = 0;
        if self.document_type.as_deref().is_some_and(|s| !s.is_empty()) {
            count += 1;
        }
        if self.user_intent.as_deref().is_some_and(|s| !s.is_empty()) {
            count += 1;
        }
        if !self.previous_queries.is_empty() {
            count += 1;
        }
        count
    }
}

/// Enhancement strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EnhancementStrategy {
    /// Append related concepts and keywords
    #[default]
    Expand,
    /// Compress to salient terms
    Summarize,
    /// Both
    Hybrid,
}

impl std::fmt::Display for EnhancementStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnhancementStrategy::Expand => write!(f, "expand"),
            EnhancementStrategy::Summarize => write!(f, "summarize"),
            EnhancementStrategy::Hybrid => write!(f, "hybrid"),
        }
    }
}

// ============================================================================
// OUTPUT
// ============================================================================

/// Result of a contextual enhancement
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnhancedText {
    /// Normalized blend of original and enhanced embeddings
    pub combined_vector: Vec<f32>,
    /// The input text
    pub original_text: String,
    /// The rewritten text
    pub enhanced_text: String,
    /// Context the enhancement was computed under
    pub context: DocumentContext,
    /// Confidence in the enhancement, in [0, 1]
    pub confidence: f32,
    /// Model id of the embeddings inside `combined_vector`
    pub model_id: String,
}

impl EnhancedText {
    /// Approximate payload size (cache accounting)
    pub fn payload_bytes(&self) -> usize {
        self.combined_vector.len() * 4 + self.original_text.len() + self.enhanced_text.len()
    }
}

// ============================================================================
// PROMPTS & HEURISTICS
// ============================================================================

/// Truncate text at a sentence boundary at or below `max_chars`.
///
/// Falls back to a char boundary when no sentence end exists in range.
pub fn truncate_at_sentence(text: &str, max_chars: usize) -> &str {
    if text.len() <= max_chars {
        return text;
    }

    let mut cut = max_chars;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    let window = &text[..cut];

    match window.rfind(['.', '!', '?']) {
        Some(pos) => &window[..=pos],
        None => window,
    }
}

/// Build the deterministic prompt for a strategy
fn build_prompt(strategy: EnhancementStrategy, text: &str, context: &DocumentContext) -> String {
    let instruction = match strategy {
        EnhancementStrategy::Expand => {
            "Expand the text below with closely related concepts and keywords so it \
             retrieves well in a search index. Reply with the expanded text only."
        }
        EnhancementStrategy::Summarize => {
            "Compress the text below to its salient terms for search retrieval. \
             Reply with the compressed text only."
        }
        EnhancementStrategy::Hybrid => {
            "Rewrite the text below for search retrieval: keep its salient terms and \
             add closely related concepts and keywords. Reply with the rewritten text only."
        }
    };

    let mut prompt = format!("{}\n\nText: {}", instruction, text);
    if let Some(document_type) = &context.document_type {
        prompt.push_str(&format!("\nDocument type: {}", document_type));
    }
    if let Some(user_intent) = &context.user_intent {
        prompt.push_str(&format!("\nUser intent: {}", user_intent));
    }
    if !context.previous_queries.is_empty() {
        prompt.push_str(&format!(
            "\nRecent queries: {}",
            context.previous_queries.join("; ")
        ));
    }

    truncate_at_sentence(&prompt, MAX_PROMPT_CHARS).to_string()
}

/// Confidence heuristic: base 0.5, +0.2 for a healthy growth ratio
/// (1.2x-3x), +0.1 per rich context field, capped at 1.0
pub fn enhancement_confidence(original: &str, enhanced: &str, context: &DocumentContext) -> f32 {
    let mut confidence = 0.5_f32;

    if !original.is_empty() {
        let ratio = enhanced.len() as f32 / original.len() as f32;
        if (1.2..=3.0).contains(&ratio) {
            confidence += 0.2;
        }
    }

    confidence += 0.1 * context.rich_field_count() as f32;
    confidence.min(1.0)
}

/// Simple (degraded) enhancement: prepend document type, append user
/// intent, inject static synonyms
fn simple_enhancement(text: &str, context: &DocumentContext) -> String {
    let mut enhanced = String::new();

    if let Some(document_type) = &context.document_type {
        enhanced.push_str(document_type);
        enhanced.push_str(": ");
    }
    enhanced.push_str(text);

    let lower = text.to_lowercase();
    let mut injected: Vec<&str> = Vec::new();
    for (term, synonyms) in SYNONYMS {
        if lower.split_whitespace().any(|w| w.trim_matches(|c: char| !c.is_alphanumeric()) == *term) {
            injected.push(synonyms);
        }
    }
    if !injected.is_empty() {
        enhanced.push_str(" (");
        enhanced.push_str(&injected.join(" "));
        enhanced.push(')');
    }

    if let Some(user_intent) = &context.user_intent {
        enhanced.push_str(" - ");
        enhanced.push_str(user_intent);
    }

    enhanced
}

// ============================================================================
// GENERATIVE BACKEND (OpenAI-compatible chat completions)
// ============================================================================

const DEFAULT_CHAT_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";
const CHAT_MODEL: &str = "gpt-4o-mini";
const CHAT_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

// ============================================================================
// ENHANCER
// ============================================================================

/// The contextual enhancer service
pub struct ContextualEnhancer {
    strategy: EnhancementStrategy,
    provider: Arc<EmbeddingProvider>,
    cache: Arc<MultiTierCache>,
    api_key: RwLock<Option<String>>,
    client: reqwest::Client,
    endpoint: String,
}

impl ContextualEnhancer {
    /// Create an enhancer sharing the engine's provider and cache
    pub fn new(
        strategy: EnhancementStrategy,
        provider: Arc<EmbeddingProvider>,
        cache: Arc<MultiTierCache>,
        api_key: Option<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(CHAT_TIMEOUT)
            .build()
            .unwrap_or_default();
        let endpoint = std::env::var("TROVE_GENERATIVE_ENDPOINT")
            .unwrap_or_else(|_| DEFAULT_CHAT_ENDPOINT.to_string());
        Self {
            strategy,
            provider,
            cache,
            api_key: RwLock::new(api_key),
            client,
            endpoint,
        }
    }

    /// Rotate the API key (shared with the remote embedding backend)
    pub fn set_api_key(&self, key: Option<String>) {
        let mut guard = self.api_key.write().unwrap_or_else(|e| e.into_inner());
        *guard = key;
    }

    /// Whether the generative backend is configured
    pub fn has_generative_backend(&self) -> bool {
        self.api_key
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_deref()
            .is_some_and(|k| !k.is_empty())
    }

    /// The configured strategy
    pub fn strategy(&self) -> EnhancementStrategy {
        self.strategy
    }

    /// Enhance text under a context; cached for 24 h, persisted
    pub async fn enhance(
        &self,
        text: &str,
        context: &DocumentContext,
    ) -> Result<EnhancedText, EnhanceError> {
        if text.trim().is_empty() {
            return Err(EnhanceError::InvalidInput("text cannot be empty".to_string()));
        }

        let key = contextual_key(text, &context.fingerprint());
        let opts = CacheOpts {
            ttl: Some(CACHE_TTL),
            allow_semantic: false,
            persist: true,
            compression_level: 0,
        };

        self.cache
            .get_or_compute_contextual(&key, &opts, || self.compute(text, context))
            .await
    }

    async fn compute(
        &self,
        text: &str,
        context: &DocumentContext,
    ) -> Result<EnhancedText, EnhanceError> {
        let (enhanced_text, degraded) = match self.generate(text, context).await {
            Some(generated) if !generated.trim().is_empty() => (generated, false),
            _ => (simple_enhancement(text, context), true),
        };

        let mut confidence = enhancement_confidence(text, &enhanced_text, context);
        if degraded {
            confidence = confidence.min(SIMPLE_CONFIDENCE_CAP);
        }

        let embeddings = self
            .provider
            .embed_batch(&[text, enhanced_text.as_str()])
            .await?;
        let [original_embedding, enhanced_embedding]: [Embedding; 2] = embeddings
            .try_into()
            .map_err(|_| {
                EnhanceError::Embedding(EmbeddingError::EmbeddingFailed(
                    "expected two embeddings".to_string(),
                ))
            })?;

        // w_e grows with confidence: 0.3 at zero confidence, 0.7 at full
        let w_enhanced = 0.3 + 0.4 * confidence;
        let w_original = 1.0 - w_enhanced;

        let mut combined: Vec<f32> = original_embedding
            .vector
            .iter()
            .zip(enhanced_embedding.vector.iter())
            .map(|(o, e)| w_original * o + w_enhanced * e)
            .collect();
        l2_normalize(&mut combined);

        Ok(EnhancedText {
            combined_vector: combined,
            original_text: text.to_string(),
            enhanced_text,
            context: context.clone(),
            confidence,
            model_id: original_embedding.model_id,
        })
    }

    /// Call the generative backend; `None` means "use the degraded path"
    async fn generate(&self, text: &str, context: &DocumentContext) -> Option<String> {
        let api_key = {
            let guard = self.api_key.read().unwrap_or_else(|e| e.into_inner());
            guard.clone()?
        };
        if api_key.is_empty() {
            return None;
        }

        let prompt = build_prompt(self.strategy, text, context);
        let request = ChatRequest {
            model: CHAT_MODEL,
            messages: vec![ChatMessage {
                role: "user",
                content: &prompt,
            }],
            max_tokens: 256,
            temperature: 0.0,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&api_key)
            .json(&request)
            .send()
            .await
            .ok()?;

        if !response.status().is_success() {
            tracing::warn!("generative backend returned {}", response.status());
            return None;
        }

        let body: ChatResponse = response.json().await.ok()?;
        body.choices
            .into_iter()
            .next()
            .map(|c| c.message.content.trim().to_string())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::embeddings::EmbeddingMode;

    fn enhancer() -> (tempfile::TempDir, ContextualEnhancer) {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(EmbeddingProvider::new(EmbeddingMode::Fallback, None));
        let cache = Arc::new(MultiTierCache::new(CacheConfig::new(
            dir.path().join("cache"),
        )));
        let e = ContextualEnhancer::new(EnhancementStrategy::Expand, provider, cache, None);
        (dir, e)
    }

    #[test]
    fn test_truncate_at_sentence() {
        let text = "First sentence. Second sentence. Third one runs long";
        let truncated = truncate_at_sentence(text, 40);
        assert_eq!(truncated, "First sentence. Second sentence.");

        // No sentence end in range: plain cut
        let no_punct = "word ".repeat(20);
        assert_eq!(truncate_at_sentence(&no_punct, 10).len(), 10);

        // Short text untouched
        assert_eq!(truncate_at_sentence("short.", 100), "short.");
    }

    #[test]
    fn test_confidence_base() {
        let ctx = DocumentContext::default();
        let c = enhancement_confidence("query", "query", &ctx);
        assert!((c - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_confidence_growth_bonus() {
        let ctx = DocumentContext::default();
        // ratio 2.0: bonus applies
        let c = enhancement_confidence("aaaa", "aaaaaaaa", &ctx);
        assert!((c - 0.7).abs() < 1e-6);

        // ratio 5.0: too much growth, no bonus
        let c = enhancement_confidence("aa", "aaaaaaaaaa", &ctx);
        assert!((c - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_confidence_rich_fields_capped() {
        let ctx = DocumentContext {
            document_type: Some("tutorial".to_string()),
            user_intent: Some("learn".to_string()),
            previous_queries: vec!["earlier".to_string()],
            ..Default::default()
        };
        let c = enhancement_confidence("aaaa", "aaaaaaaa", &ctx);
        // 0.5 + 0.2 + 3*0.1 = 1.0, capped
        assert!((c - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_simple_enhancement_injects() {
        let ctx = DocumentContext {
            document_type: Some("guide".to_string()),
            user_intent: Some("troubleshooting".to_string()),
            ..Default::default()
        };
        let enhanced = simple_enhancement("how to open a file", &ctx);
        assert!(enhanced.starts_with("guide: "));
        assert!(enhanced.contains("read access load"));
        assert!(enhanced.contains("document path"));
        assert!(enhanced.ends_with("troubleshooting"));
    }

    #[test]
    fn test_build_prompt_deterministic_and_bounded() {
        let ctx = DocumentContext {
            user_intent: Some("debugging".to_string()),
            ..Default::default()
        };
        let a = build_prompt(EnhancementStrategy::Hybrid, "some query", &ctx);
        let b = build_prompt(EnhancementStrategy::Hybrid, "some query", &ctx);
        assert_eq!(a, b);

        let huge = "sentence here. ".repeat(500);
        let p = build_prompt(EnhancementStrategy::Expand, &huge, &ctx);
        assert!(p.len() <= MAX_PROMPT_CHARS);
    }

    #[test]
    fn test_fingerprint_stable() {
        let mut ctx = DocumentContext::default();
        ctx.metadata.insert("b".to_string(), "2".to_string());
        ctx.metadata.insert("a".to_string(), "1".to_string());
        assert_eq!(ctx.fingerprint(), ctx.fingerprint());
    }

    #[tokio::test]
    async fn test_enhance_degraded_path() {
        let (_dir, enhancer) = enhancer();
        let ctx = DocumentContext {
            document_type: Some("notes".to_string()),
            ..Default::default()
        };

        let result = enhancer.enhance("open file error", &ctx).await.unwrap();
        assert!(result.confidence <= SIMPLE_CONFIDENCE_CAP);
        assert!(result.enhanced_text.contains("notes"));
        assert_eq!(result.original_text, "open file error");

        let norm: f32 = result.combined_vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn test_enhance_empty_rejected() {
        let (_dir, enhancer) = enhancer();
        let result = enhancer.enhance("  ", &DocumentContext::default()).await;
        assert!(matches!(result, Err(EnhanceError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_enhance_cached() {
        let (_dir, enhancer) = enhancer();
        let ctx = DocumentContext::default();

        let first = enhancer.enhance("search the config", &ctx).await.unwrap();
        let second = enhancer.enhance("search the config", &ctx).await.unwrap();
        assert_eq!(first.enhanced_text, second.enhanced_text);
        assert!(enhancer.cache.stats().memory_hits >= 1);
    }
}
