//! Batch orchestration: cache lookup, chunked dispatch and write-back.
//!
//! [`Orchestrator::translate_batch`] is the only entry point that talks to
//! both the cache tiers and the backends:
//!
//! 1. Resolve the request's [`CacheKey`] through the [`CacheManager`]. A hit
//!    that covers every requested cue returns immediately.
//! 2. On a miss, split the cues (in index order) into chunks and translate
//!    them one after another, carrying a [`TranslationContext`] forward.
//! 3. Store the assembled document through both tiers before returning.
//!
//! Concurrent calls for the same key are single-flight: the second caller
//! waits for the first and is then served from L1.
//!
//! Author: kelexine (<https://github.com/kelexine>)

pub mod context;

pub use context::{ContextUnit, TranslationContext};

use crate::cache::{CacheKey, CacheManager, CacheTier};
use crate::config::{AppConfig, OrchestratorConfig};
use crate::error::{BridgeError, ErrorKind, Result};
use crate::metrics;
use crate::models::{validate_cues, Cue, TokenUsage, TranslatedDocument, TranslationWarning};
use crate::providers::{ProviderProgress, TranslationProvider, TranslationRequest};
use crate::utils::retry::{with_retry, RetryPolicy};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One caption track to translate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    pub video_id: String,
    pub source_language: String,
    pub target_language: String,
    pub cues: Vec<Cue>,
    /// Configured provider id; the default provider when absent.
    #[serde(default)]
    pub provider: Option<String>,
    /// Context carried over from an earlier batch of the same session.
    #[serde(default)]
    pub context: Option<TranslationContext>,
}

/// Why a batch stopped before its last chunk.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialFailure {
    pub error_kind: ErrorKind,
    pub message: String,
    /// Requested indices left untranslated, in order.
    pub failed_indices: Vec<u32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    /// Every requested cue, in index order.
    pub cues: Vec<Cue>,
    pub warnings: Vec<TranslationWarning>,
    /// Served from a cache tier without any backend call.
    pub cached: bool,
    pub tier: CacheTier,
    /// This call wrote the result to the durable tier.
    pub persisted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial: Option<PartialFailure>,
    /// Context to pass into the next batch of the same session.
    pub context: TranslationContext,
    pub usage: TokenUsage,
    pub provider: String,
}

impl BatchResult {
    pub fn is_partial(&self) -> bool {
        self.partial.is_some()
    }
}

/// Overall progress of one batch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchProgress {
    /// In `[0, 100]`, never decreasing within one batch.
    pub percentage: f32,
    pub completed_chunks: usize,
    pub total_chunks: usize,
}

pub type BatchProgressFn<'a> = &'a (dyn Fn(BatchProgress) + Send + Sync);

/// Forwards only non-decreasing percentages. Retries restart a chunk's
/// provider progress at zero, which must not move the overall value back.
struct BatchProgressTracker<'a> {
    total_cues: usize,
    total_chunks: usize,
    last: Mutex<f32>,
    callback: BatchProgressFn<'a>,
}

impl<'a> BatchProgressTracker<'a> {
    fn new(total_cues: usize, total_chunks: usize, callback: BatchProgressFn<'a>) -> Self {
        Self {
            total_cues,
            total_chunks,
            last: Mutex::new(0.0),
            callback,
        }
    }

    fn report(&self, cues_before: usize, chunk: &ProviderProgress, completed_chunks: usize) {
        let within = chunk.percentage.clamp(0.0, 100.0) / 100.0 * chunk.total_cues as f32;
        let overall = (cues_before as f32 + within) / self.total_cues.max(1) as f32 * 100.0;
        self.emit(overall, completed_chunks);
    }

    fn emit(&self, percentage: f32, completed_chunks: usize) {
        let percentage = percentage.clamp(0.0, 100.0);
        {
            let mut last = self.last.lock();
            if percentage < *last {
                return;
            }
            *last = percentage;
        }
        (self.callback)(BatchProgress {
            percentage,
            completed_chunks,
            total_chunks: self.total_chunks,
        });
    }
}

pub struct Orchestrator {
    cache: Arc<CacheManager>,
    providers: HashMap<String, Arc<dyn TranslationProvider>>,
    default_provider: Option<String>,
    config: OrchestratorConfig,
    retry: RetryPolicy,
    /// Per-key locks for single-flight dispatch.
    inflight: InflightMap,
}

type InflightMap = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// One caller's handle on a key's single-flight lock. The map entry is removed
/// when the last handle drops, whether the call finished or was abandoned.
struct InflightEntry<'a> {
    map: &'a InflightMap,
    key: String,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Drop for InflightEntry<'_> {
    fn drop(&mut self) {
        let mut map = self.map.lock();
        // The map and this handle are the only two left
        if Arc::strong_count(&self.lock) <= 2 {
            map.remove(&self.key);
        }
    }
}

impl Orchestrator {
    pub fn new(
        cache: Arc<CacheManager>,
        providers: Vec<Arc<dyn TranslationProvider>>,
        config: OrchestratorConfig,
    ) -> Self {
        let retry = RetryPolicy::from_config(&config);
        Self {
            cache,
            providers: providers
                .into_iter()
                .map(|p| (p.id().to_string(), p))
                .collect(),
            default_provider: None,
            config,
            retry,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Wire an orchestrator from application config and already-built providers.
    pub fn from_config(
        config: &AppConfig,
        cache: Arc<CacheManager>,
        providers: HashMap<String, Arc<dyn TranslationProvider>>,
    ) -> Self {
        let mut orchestrator = Self::new(
            cache,
            providers.into_values().collect(),
            config.orchestrator.clone(),
        );
        // Config order decides the fallback when no default is named
        orchestrator.default_provider = config
            .default_provider
            .clone()
            .or_else(|| {
                config
                    .providers
                    .iter()
                    .find(|p| orchestrator.providers.contains_key(&p.id))
                    .map(|p| p.id.clone())
            });
        orchestrator
    }

    pub fn with_default_provider(mut self, id: impl Into<String>) -> Self {
        self.default_provider = Some(id.into());
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    /// Providers sorted by id.
    pub fn providers(&self) -> Vec<Arc<dyn TranslationProvider>> {
        let mut providers: Vec<_> = self.providers.values().cloned().collect();
        providers.sort_by(|a, b| a.id().cmp(b.id()));
        providers
    }

    /// Resolve a provider id, falling back to the default and then to the
    /// only configured provider.
    pub fn provider(&self, id: Option<&str>) -> Result<Arc<dyn TranslationProvider>> {
        match id.or(self.default_provider.as_deref()) {
            Some(id) => self
                .providers
                .get(id)
                .cloned()
                .ok_or_else(|| BridgeError::ProviderNotRegistered(id.to_string())),
            None => self
                .providers
                .values()
                .next()
                .filter(|_| self.providers.len() == 1)
                .cloned()
                .ok_or_else(|| {
                    BridgeError::ProviderNotRegistered(
                        "no provider named and no default configured".to_string(),
                    )
                }),
        }
    }

    /// Cache identity of a request served by `provider`.
    pub fn cache_key(request: &BatchRequest, provider: &dyn TranslationProvider) -> CacheKey {
        CacheKey::new(
            &request.video_id,
            &request.source_language,
            &request.target_language,
        )
        .with_provider(provider.kind().as_str())
        .with_model(provider.model().map(str::to_string))
    }

    pub async fn translate_batch(
        &self,
        request: BatchRequest,
        cancel: &CancellationToken,
    ) -> Result<BatchResult> {
        self.translate_batch_with_progress(request, cancel, &|_: BatchProgress| {})
            .await
    }

    pub async fn translate_batch_with_progress(
        &self,
        request: BatchRequest,
        cancel: &CancellationToken,
        on_progress: BatchProgressFn<'_>,
    ) -> Result<BatchResult> {
        validate_request(&request)?;
        let provider = self.provider(request.provider.as_deref())?;
        let key = Self::cache_key(&request, provider.as_ref());

        let mut cues = request.cues.clone();
        cues.sort_by_key(|c| c.index);

        let mut context = request
            .context
            .clone()
            .unwrap_or_else(|| TranslationContext::new(self.config.context_window));

        // Dropped on every exit path, including when this future is abandoned
        let entry = self.inflight_entry(key.serialize());
        let guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            guard = entry.lock.lock() => Some(guard),
        };

        let outcome = match guard {
            None => Err(BridgeError::Cancelled),
            Some(_guard) => {
                let resolution = self.cache.resolve(&key).await;
                match resolution.payload {
                    Some(document) if document.covers(&cues) => {
                        debug!(key = %key, tier = resolution.tier.as_str(), "Batch served from cache");
                        let cues = document.apply_to(&cues);
                        context.capture(&cues);
                        on_progress(BatchProgress {
                            percentage: 100.0,
                            completed_chunks: 0,
                            total_chunks: 0,
                        });
                        let requested: HashSet<u32> = cues.iter().map(|c| c.index).collect();
                        let warnings = document
                            .warnings
                            .iter()
                            .filter(|w| w.index.map_or(true, |i| requested.contains(&i)))
                            .cloned()
                            .collect();
                        Ok(BatchResult {
                            cues,
                            warnings,
                            cached: true,
                            tier: resolution.tier,
                            persisted: false,
                            partial: None,
                            context,
                            usage: TokenUsage::default(),
                            provider: provider.id().to_string(),
                        })
                    }
                    stale => {
                        if stale.is_some() {
                            debug!(key = %key, "Cached document does not cover the request; re-translating");
                        }
                        self.dispatch(&key, &request, cues, context, provider.as_ref(), cancel, on_progress)
                            .await
                    }
                }
            }
        };
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch(
        &self,
        key: &CacheKey,
        request: &BatchRequest,
        cues: Vec<Cue>,
        mut context: TranslationContext,
        provider: &dyn TranslationProvider,
        cancel: &CancellationToken,
        on_progress: BatchProgressFn<'_>,
    ) -> Result<BatchResult> {
        let chunk_size = provider
            .chunk_size()
            .unwrap_or(self.config.chunk_size)
            .max(1);
        let chunks: Vec<&[Cue]> = cues.chunks(chunk_size).collect();
        let total_chunks = chunks.len();
        let tracker = BatchProgressTracker::new(cues.len(), total_chunks, on_progress);

        info!(
            key = %key,
            provider = provider.id(),
            cues = cues.len(),
            chunks = total_chunks,
            "Translating batch"
        );

        let mut translated: Vec<Cue> = Vec::with_capacity(cues.len());
        let mut warnings = Vec::new();
        let mut usage = TokenUsage::default();
        let mut failure: Option<BridgeError> = None;

        for (position, chunk) in chunks.iter().enumerate() {
            if cancel.is_cancelled() {
                failure = Some(BridgeError::Cancelled);
                break;
            }

            let chunk_request = TranslationRequest {
                cues: chunk.to_vec(),
                source_language: request.source_language.clone(),
                target_language: request.target_language.clone(),
                context: context.clone(),
                following: chunks
                    .get(position + 1)
                    .map(|next| next.iter().take(self.config.context_window).cloned().collect())
                    .unwrap_or_default(),
            };
            let cues_before = translated.len();
            let chunk_progress =
                |p: ProviderProgress| tracker.report(cues_before, &p, position);
            let label = format!("{} chunk {}/{}", provider.id(), position + 1, total_chunks);

            let outcome = with_retry(&label, &self.retry, cancel, |_| {
                provider.translate_stream(&chunk_request, &chunk_progress)
            })
            .await;

            match outcome {
                Ok(response) => {
                    metrics::record_chunk("success");
                    let added = context.merge_glossary(response.glossary);
                    if added > 0 {
                        debug!("{} new glossary entries after {}", added, label);
                    }
                    context.capture(&response.cues);
                    usage.add(response.usage);
                    warnings.extend(response.warnings);
                    translated.extend(response.cues);
                    tracker.emit(
                        translated.len() as f32 / cues.len().max(1) as f32 * 100.0,
                        position + 1,
                    );
                }
                Err(e) => {
                    metrics::record_chunk(if matches!(e, BridgeError::Cancelled) {
                        "cancelled"
                    } else {
                        "failed"
                    });
                    warn!("{} failed: {}", label, e);
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(error) = failure {
            if translated.is_empty() {
                return Err(error);
            }
            return Ok(partial_result(cues, translated, warnings, context, usage, provider, &error));
        }

        let mut document = TranslatedDocument::new(
            translated.clone(),
            provider.id(),
            provider.model().map(str::to_string),
        );
        document.warnings = warnings.clone();

        let persisted = match self.cache.store(key, Arc::new(document)).await {
            Ok(()) => true,
            Err(e) => {
                warnings.push(TranslationWarning::cache_write_failed(format!(
                    "result was not cached durably: {}",
                    e
                )));
                false
            }
        };

        Ok(BatchResult {
            cues: translated,
            warnings,
            cached: false,
            tier: CacheTier::Miss,
            persisted,
            partial: None,
            context,
            usage,
            provider: provider.id().to_string(),
        })
    }

    fn inflight_entry(&self, key: String) -> InflightEntry<'_> {
        let lock = self
            .inflight
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        InflightEntry {
            map: &self.inflight,
            key,
            lock,
        }
    }

    #[cfg(test)]
    fn inflight_len(&self) -> usize {
        self.inflight.lock().len()
    }
}

fn validate_request(request: &BatchRequest) -> Result<()> {
    for (name, value) in [
        ("videoId", &request.video_id),
        ("sourceLanguage", &request.source_language),
        ("targetLanguage", &request.target_language),
    ] {
        if value.trim().is_empty() {
            return Err(BridgeError::InvalidRequest(format!("{} must not be empty", name)));
        }
    }
    validate_cues(&request.cues)
}

fn partial_result(
    cues: Vec<Cue>,
    translated: Vec<Cue>,
    warnings: Vec<TranslationWarning>,
    context: TranslationContext,
    usage: TokenUsage,
    provider: &dyn TranslationProvider,
    error: &BridgeError,
) -> BatchResult {
    let done: HashSet<u32> = translated.iter().map(|c| c.index).collect();
    let failed_indices: Vec<u32> = cues
        .iter()
        .map(|c| c.index)
        .filter(|i| !done.contains(i))
        .collect();

    warn!(
        provider = provider.id(),
        failed = failed_indices.len(),
        "Returning partial batch after {}",
        error.kind()
    );

    let remaining = cues.into_iter().filter(|c| !done.contains(&c.index));
    let mut out = translated;
    out.extend(remaining);

    BatchResult {
        cues: out,
        warnings,
        cached: false,
        tier: CacheTier::Miss,
        persisted: false,
        partial: Some(PartialFailure {
            error_kind: error.kind(),
            message: error.to_string(),
            failed_indices,
        }),
        context,
        usage,
        provider: provider.id().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::models::WarningKind;
    use crate::providers::{
        CostEstimate, CredentialCheck, ProgressFn, ProviderKind, ProviderResponse, RateLimitStatus,
    };
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    type Script = Box<dyn Fn(usize, &TranslationRequest) -> Result<ProviderResponse> + Send + Sync>;

    /// Backend whose behaviour per call number is scripted by the test.
    struct ScriptedProvider {
        calls: AtomicUsize,
        requests: Mutex<Vec<TranslationRequest>>,
        chunk_size: Option<usize>,
        delay: Duration,
        /// Call number that never returns on its own.
        hang_on: Option<usize>,
        finished: AtomicUsize,
        script: Script,
    }

    impl ScriptedProvider {
        fn new(script: Script) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
                chunk_size: None,
                delay: Duration::ZERO,
                hang_on: None,
                finished: AtomicUsize::new(0),
                script,
            }
        }

        fn echo() -> Self {
            Self::new(Box::new(|_, req| Ok(translate_all(req))))
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn translate_all(req: &TranslationRequest) -> ProviderResponse {
        ProviderResponse {
            cues: req
                .cues
                .iter()
                .map(|c| {
                    let mut cue = c.clone();
                    cue.translated_text = Some(format!("T:{}", c.source_text));
                    cue
                })
                .collect(),
            ..Default::default()
        }
    }

    #[async_trait]
    impl TranslationProvider for ScriptedProvider {
        fn id(&self) -> &str {
            "scripted"
        }

        fn kind(&self) -> ProviderKind {
            ProviderKind::OpenAi
        }

        fn model(&self) -> Option<&str> {
            Some("test-model")
        }

        fn chunk_size(&self) -> Option<usize> {
            self.chunk_size
        }

        async fn validate_credentials(&self) -> CredentialCheck {
            CredentialCheck::ok()
        }

        async fn translate_stream(
            &self,
            request: &TranslationRequest,
            on_progress: ProgressFn<'_>,
        ) -> Result<ProviderResponse> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().push(request.clone());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.hang_on == Some(call) {
                std::future::pending::<()>().await;
            }
            on_progress(ProviderProgress {
                percentage: 50.0,
                completed_cues: request.cues.len() / 2,
                total_cues: request.cues.len(),
            });
            let outcome = (self.script)(call, request);
            self.finished.fetch_add(1, Ordering::SeqCst);
            outcome
        }

        fn rate_limit_status(&self) -> RateLimitStatus {
            RateLimitStatus::default()
        }

        fn estimate_cost(&self, cue_count: usize, avg: usize) -> CostEstimate {
            CostEstimate::estimate(cue_count, avg, None, false)
        }
    }

    fn orchestrator(provider: Arc<ScriptedProvider>, chunk_size: usize) -> Orchestrator {
        let config = OrchestratorConfig {
            chunk_size,
            context_window: 2,
            ..Default::default()
        };
        let cache = Arc::new(CacheManager::memory_only(MemoryCache::new(16, None)));
        Orchestrator::new(cache, vec![provider as Arc<dyn TranslationProvider>], config)
            .with_retry_policy(RetryPolicy {
                max_attempts: 3,
                initial_interval: Duration::from_millis(1),
                max_interval: Duration::from_millis(2),
            })
    }

    fn batch(count: u32) -> BatchRequest {
        BatchRequest {
            video_id: "v1".to_string(),
            source_language: "en".to_string(),
            target_language: "ja".to_string(),
            cues: (0..count).map(|i| Cue::new(i, format!("line {}", i))).collect(),
            provider: None,
            context: None,
        }
    }

    #[tokio::test]
    async fn test_second_call_is_served_from_l1() {
        let provider = Arc::new(ScriptedProvider::echo());
        let orch = orchestrator(provider.clone(), 10);
        let cancel = CancellationToken::new();

        let first = orch.translate_batch(batch(4), &cancel).await.unwrap();
        assert!(!first.cached);
        // Memory-only cache: durable write fails but the result is still returned
        assert!(!first.persisted);
        assert!(first
            .warnings
            .iter()
            .any(|w| w.kind == WarningKind::CacheWriteFailed));

        let second = orch.translate_batch(batch(4), &cancel).await.unwrap();
        assert!(second.cached);
        assert_eq!(second.tier, CacheTier::L1);
        assert_eq!(second.cues[3].translated_text.as_deref(), Some("T:line 3"));
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_chunks_carry_context_and_glossary() {
        let provider = Arc::new(ScriptedProvider::new(Box::new(|call, req| {
            let mut response = translate_all(req);
            if call == 0 {
                response.glossary = BTreeMap::from([("Mia".to_string(), "ミア".to_string())]);
            }
            Ok(response)
        })));
        let orch = orchestrator(provider.clone(), 3);

        let result = orch
            .translate_batch(batch(7), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(provider.calls(), 3);

        let requests = provider.requests.lock();
        assert!(requests[0].context.is_empty());
        let carried: Vec<u32> = requests[1].context.recent.iter().map(|u| u.index).collect();
        assert_eq!(carried, vec![1, 2]);
        assert_eq!(requests[1].context.glossary["Mia"], "ミア");
        assert_eq!(requests[2].cues[0].index, 6);

        let ahead: Vec<u32> = requests[0].following.iter().map(|c| c.index).collect();
        assert_eq!(ahead, vec![3, 4]);
        assert_eq!(requests[1].following[0].index, 6);
        assert!(requests[2].following.is_empty());

        assert_eq!(result.context.glossary.len(), 1);
        assert_eq!(result.cues.len(), 7);
    }

    #[tokio::test]
    async fn test_retryable_failure_is_retried() {
        let provider = Arc::new(ScriptedProvider::new(Box::new(|call, req| {
            if call == 0 {
                Err(BridgeError::ServiceUnavailable("overloaded".into()))
            } else {
                Ok(translate_all(req))
            }
        })));
        let orch = orchestrator(provider.clone(), 10);

        let result = orch
            .translate_batch(batch(2), &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.partial.is_none());
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_mid_batch_failure_keeps_finished_chunks() {
        let provider = Arc::new(ScriptedProvider::new(Box::new(|call, req| {
            if call % 2 == 0 {
                Ok(translate_all(req))
            } else {
                Err(BridgeError::ContextLengthExceeded("too long".into()))
            }
        })));
        let orch = orchestrator(provider.clone(), 2);

        let result = orch
            .translate_batch(batch(5), &CancellationToken::new())
            .await
            .unwrap();
        let partial = result.partial.as_ref().unwrap();
        assert_eq!(partial.error_kind, ErrorKind::ContextLengthExceeded);
        assert_eq!(partial.failed_indices, vec![2, 3, 4]);
        assert_eq!(result.cues.len(), 5);
        assert!(result.cues[1].translated_text.is_some());
        assert!(result.cues[2].translated_text.is_none());

        // Partial results are never cached
        let again = orch.translate_batch(batch(5), &CancellationToken::new()).await.unwrap();
        assert!(!again.cached);
    }

    #[tokio::test]
    async fn test_failure_before_first_chunk_is_an_error() {
        let provider = Arc::new(ScriptedProvider::new(Box::new(|_, _| {
            Err(BridgeError::AuthenticationFailed("expired".into()))
        })));
        let orch = orchestrator(provider.clone(), 2);

        let err = orch
            .translate_batch(batch(4), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_batch_dispatches_nothing() {
        let provider = Arc::new(ScriptedProvider::echo());
        let orch = orchestrator(provider.clone(), 2);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = orch.translate_batch(batch(4), &cancel).await.unwrap_err();
        assert!(matches!(err, BridgeError::Cancelled));
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_same_key_dispatches_once() {
        let mut scripted = ScriptedProvider::echo();
        scripted.delay = Duration::from_millis(50);
        let provider = Arc::new(scripted);
        let orch = Arc::new(orchestrator(provider.clone(), 10));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let orch = orch.clone();
                tokio::spawn(async move {
                    orch.translate_batch(batch(3), &CancellationToken::new()).await
                })
            })
            .collect();

        let mut cached = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap().cached {
                cached += 1;
            }
        }
        assert_eq!(provider.calls(), 1);
        assert_eq!(cached, 3);
        assert_eq!(orch.inflight_len(), 0);
    }

    #[tokio::test]
    async fn test_progress_is_monotonic() {
        let provider = Arc::new(ScriptedProvider::new(Box::new(|call, req| {
            if call == 1 {
                Err(BridgeError::Network("reset".into()))
            } else {
                Ok(translate_all(req))
            }
        })));
        let orch = orchestrator(provider, 2);
        let seen = Mutex::new(Vec::new());

        orch.translate_batch_with_progress(batch(6), &CancellationToken::new(), &|p: BatchProgress| {
            seen.lock().push(p.percentage)
        })
        .await
        .unwrap();

        let seen = seen.into_inner();
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(seen.last().copied(), Some(100.0));
    }

    #[tokio::test]
    async fn test_invalid_requests_rejected() {
        let orch = orchestrator(Arc::new(ScriptedProvider::echo()), 2);

        let mut empty_video = batch(2);
        empty_video.video_id = " ".to_string();
        let err = orch
            .translate_batch(empty_video, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);

        let mut duplicate = batch(2);
        duplicate.cues.push(Cue::new(0, "again"));
        assert!(orch
            .translate_batch(duplicate, &CancellationToken::new())
            .await
            .is_err());

        let mut unknown = batch(2);
        unknown.provider = Some("nope".to_string());
        let err = orch
            .translate_batch(unknown, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::ProviderNotRegistered(_)));
    }

    #[tokio::test]
    async fn test_stale_cache_entry_is_retranslated() {
        let provider = Arc::new(ScriptedProvider::echo());
        let orch = orchestrator(provider.clone(), 10);
        let cancel = CancellationToken::new();

        orch.translate_batch(batch(2), &cancel).await.unwrap();
        // A longer track for the same video misses cue 2
        let result = orch.translate_batch(batch(3), &cancel).await.unwrap();
        assert!(!result.cached);
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_cancel_mid_batch_aborts_inflight_call() {
        let mut scripted = ScriptedProvider::echo();
        scripted.hang_on = Some(1);
        let provider = Arc::new(scripted);
        let orch = orchestrator(provider.clone(), 2);
        let cancel = CancellationToken::new();

        let trigger = {
            let provider = provider.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                while provider.calls() < 2 {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                cancel.cancel();
            })
        };

        let result = orch.translate_batch(batch(4), &cancel).await.unwrap();
        trigger.await.unwrap();

        let partial = result.partial.as_ref().unwrap();
        assert_eq!(partial.error_kind, ErrorKind::Cancelled);
        assert_eq!(partial.failed_indices, vec![2, 3]);
        assert_eq!(result.cues[1].translated_text.as_deref(), Some("T:line 1"));
        assert!(!result.persisted);
        // The hanging second call was dropped, not awaited to completion
        assert_eq!(provider.calls(), 2);
        assert_eq!(provider.finished.load(Ordering::SeqCst), 1);

        let key = Orchestrator::cache_key(&batch(4), provider.as_ref());
        assert_eq!(orch.cache().resolve(&key).await.tier, CacheTier::Miss);
        assert_eq!(orch.inflight_len(), 0);
    }

    #[tokio::test]
    async fn test_cancel_from_progress_stops_before_next_chunk() {
        let provider = Arc::new(ScriptedProvider::echo());
        let orch = orchestrator(provider.clone(), 2);
        let cancel = CancellationToken::new();

        let result = orch
            .translate_batch_with_progress(batch(6), &cancel, &|p: BatchProgress| {
                if p.completed_chunks >= 1 {
                    cancel.cancel();
                }
            })
            .await
            .unwrap();

        assert_eq!(provider.calls(), 1);
        let partial = result.partial.unwrap();
        assert_eq!(partial.error_kind, ErrorKind::Cancelled);
        assert_eq!(partial.failed_indices, vec![2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_abandoned_call_releases_inflight_entry() {
        let mut scripted = ScriptedProvider::echo();
        scripted.hang_on = Some(0);
        let orch = orchestrator(Arc::new(scripted), 10);

        let abandoned = tokio::time::timeout(
            Duration::from_millis(20),
            orch.translate_batch(batch(2), &CancellationToken::new()),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(orch.inflight_len(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_waiter_leaves_entry_to_holder() {
        let mut scripted = ScriptedProvider::echo();
        scripted.delay = Duration::from_millis(60);
        let orch = Arc::new(orchestrator(Arc::new(scripted), 10));

        let holder = {
            let orch = orch.clone();
            tokio::spawn(async move {
                orch.translate_batch(batch(2), &CancellationToken::new()).await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let waiter = tokio::time::timeout(
            Duration::from_millis(10),
            orch.translate_batch(batch(2), &CancellationToken::new()),
        )
        .await;
        assert!(waiter.is_err());
        assert_eq!(orch.inflight_len(), 1);

        assert!(holder.await.unwrap().is_ok());
        assert_eq!(orch.inflight_len(), 0);
    }

    #[tokio::test]
    async fn test_cache_hit_keeps_only_requested_warnings() {
        let provider = Arc::new(ScriptedProvider::new(Box::new(|_, req| {
            let mut response = translate_all(req);
            response.warnings.push(TranslationWarning::missing(3));
            Ok(response)
        })));
        let orch = orchestrator(provider.clone(), 10);
        let cancel = CancellationToken::new();

        let full = orch.translate_batch(batch(4), &cancel).await.unwrap();
        assert!(full.warnings.iter().any(|w| w.index == Some(3)));

        let subset = orch.translate_batch(batch(2), &cancel).await.unwrap();
        assert!(subset.cached);
        assert_eq!(subset.cues.len(), 2);
        assert!(subset.warnings.iter().all(|w| w.index != Some(3)));
    }
}
