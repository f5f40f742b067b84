//! Canonical code categorization
//!
//! Resolves raw metric names to canonical clinical codes (LOINC). Lookup order:
//! bounded in-process cache, exact match in the mapping table, token-overlap
//! fuzzy match, then the external inference collaborator. Inferred codes are
//! persisted so the next lookup takes the fast path. A name that resolves
//! nowhere is not an error; callers proceed with no code.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::RollupError;
use crate::metrics::normalize_name;
use crate::store::{MappingStore, Store, UpsertOutcome};
use crate::types::{CanonicalMapping, MappingSource};

/// Minimum token Jaccard similarity accepted as a fuzzy match
pub const FUZZY_THRESHOLD: f64 = 0.8;

/// Code proposed by the inference collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferredCode {
    pub code: String,
    /// Which system produced the code
    pub source: String,
}

/// External canonical-code inference service
#[async_trait]
pub trait CodeInference: Send + Sync {
    /// `Ok(None)` when the service has no code for the metric
    async fn infer(
        &self,
        metric_name: &str,
        category: Option<&str>,
        unit: &str,
    ) -> Result<Option<InferredCode>, RollupError>;
}

/// Inference that never finds anything
pub struct NullInference;

#[async_trait]
impl CodeInference for NullInference {
    async fn infer(
        &self,
        _metric_name: &str,
        _category: Option<&str>,
        _unit: &str,
    ) -> Result<Option<InferredCode>, RollupError> {
        Ok(None)
    }
}

/// Where a resolution was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    Cache,
    Table,
    Fuzzy,
    Inference,
    Unresolved,
}

/// Outcome of `CategorizationMapper::resolve`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub code: Option<String>,
    pub source: ResolutionSource,
}

impl Resolution {
    fn found(code: &str, source: ResolutionSource) -> Self {
        Self {
            code: Some(code.to_string()),
            source,
        }
    }

    fn unresolved() -> Self {
        Self {
            code: None,
            source: ResolutionSource::Unresolved,
        }
    }
}

/// Fixed-capacity mapping cache with oldest-insertion eviction
pub struct MappingCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, CanonicalMapping>,
    order: VecDeque<String>,
}

impl MappingCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lookup by normalized name
    pub fn get(&self, key: &str) -> Option<CanonicalMapping> {
        self.lock().entries.get(key).cloned()
    }

    pub fn insert(&self, key: String, mapping: CanonicalMapping) {
        let mut inner = self.lock();
        if inner.entries.insert(key.clone(), mapping).is_some() {
            return;
        }
        inner.order.push_back(key);
        while inner.order.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.entries.remove(&oldest);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Resolves metric names to canonical codes
pub struct CategorizationMapper {
    store: Arc<dyn Store>,
    inference: Arc<dyn CodeInference>,
    cache: Arc<MappingCache>,
    timeout: Duration,
}

impl CategorizationMapper {
    pub fn new(
        store: Arc<dyn Store>,
        inference: Arc<dyn CodeInference>,
        cache: Arc<MappingCache>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            inference,
            cache,
            timeout,
        }
    }

    pub fn cache(&self) -> &MappingCache {
        &self.cache
    }

    /// Write the builtin seed table into the mapping store. Existing rows for
    /// the same names are left alone.
    pub fn seed_builtin(&self) -> Result<usize, RollupError> {
        let mut added = 0;
        for mapping in builtin_mappings() {
            if self.store.find_mapping(&mapping.metric_name)?.is_some() {
                continue;
            }
            if self.store.upsert_mapping(mapping)? == UpsertOutcome::Inserted {
                added += 1;
            }
        }
        debug!(added, "Seeded builtin mappings");
        Ok(added)
    }

    /// Resolve a metric name to a canonical code.
    ///
    /// Only storage failures are errors. Inference failures and timeouts are
    /// logged and yield an unresolved result.
    pub async fn resolve(
        &self,
        metric_name: &str,
        category: Option<&str>,
        unit: &str,
    ) -> Result<Resolution, RollupError> {
        let key = normalize_name(metric_name);
        if key.is_empty() {
            return Ok(Resolution::unresolved());
        }

        if let Some(hit) = self.cache.get(&key) {
            return Ok(Resolution::found(&hit.canonical_code, ResolutionSource::Cache));
        }

        if let Some(mapping) = self.store.find_mapping(metric_name)? {
            let resolution = Resolution::found(&mapping.canonical_code, ResolutionSource::Table);
            self.cache.insert(key, mapping);
            return Ok(resolution);
        }

        if let Some(mapping) = self.fuzzy_match(&key)? {
            debug!(metric = %metric_name, matched = %mapping.metric_name, "Fuzzy mapping match");
            let resolution = Resolution::found(&mapping.canonical_code, ResolutionSource::Fuzzy);
            self.cache.insert(key, mapping);
            return Ok(resolution);
        }

        let inferred = match tokio::time::timeout(
            self.timeout,
            self.inference.infer(metric_name, category, unit),
        )
        .await
        {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => {
                warn!(metric = %metric_name, error = %e, "Code inference failed");
                None
            }
            Err(_) => {
                warn!(
                    metric = %metric_name,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Code inference timed out"
                );
                None
            }
        };

        let Some(inferred) = inferred else {
            warn!(metric = %metric_name, "No canonical code; proceeding without one");
            return Ok(Resolution::unresolved());
        };

        let mapping = CanonicalMapping {
            metric_name: metric_name.trim().to_string(),
            canonical_code: inferred.code.clone(),
            unit: Some(unit.trim().to_string()).filter(|u| !u.is_empty()),
            category: category.map(str::to_string),
            source_of_mapping: MappingSource::Inferred,
        };
        self.store.upsert_mapping(mapping.clone())?;
        self.cache.insert(key, mapping);

        info!(
            metric = %metric_name,
            code = %inferred.code,
            inferred_by = %inferred.source,
            "Persisted inferred mapping"
        );
        Ok(Resolution::found(&inferred.code, ResolutionSource::Inference))
    }

    fn fuzzy_match(&self, key: &str) -> Result<Option<CanonicalMapping>, RollupError> {
        let wanted = tokens(key);
        let best = self
            .store
            .all_mappings()?
            .into_iter()
            .map(|m| (jaccard(&wanted, &tokens(&normalize_name(&m.metric_name))), m))
            .filter(|(score, _)| *score >= FUZZY_THRESHOLD)
            .max_by(|(a, ma), (b, mb)| {
                a.total_cmp(b)
                    .then_with(|| mb.metric_name.cmp(&ma.metric_name))
            })
            .map(|(_, m)| m);
        Ok(best)
    }
}

fn tokens(name: &str) -> BTreeSet<&str> {
    name.split(' ').filter(|t| !t.is_empty()).collect()
}

fn jaccard(a: &BTreeSet<&str>, b: &BTreeSet<&str>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Seed table of common vital, activity and lab codes
pub fn builtin_mappings() -> Vec<CanonicalMapping> {
    const SEED: &[(&str, &str, &str, &str)] = &[
        ("heart rate", "8867-4", "bpm", "vitals"),
        ("resting heart rate", "40443-4", "bpm", "vitals"),
        ("body temperature", "8310-5", "degC", "vitals"),
        ("systolic blood pressure", "8480-6", "mmHg", "vitals"),
        ("diastolic blood pressure", "8462-4", "mmHg", "vitals"),
        ("respiratory rate", "9279-1", "/min", "vitals"),
        ("oxygen saturation", "59408-5", "%", "vitals"),
        ("body weight", "29463-7", "kg", "vitals"),
        ("steps", "55423-8", "count", "activity"),
        ("step count", "55423-8", "count", "activity"),
        ("active energy burned", "41981-2", "kcal", "activity"),
        ("sleep duration", "93832-4", "hours", "sleep"),
        ("alt", "1742-6", "U/L", "lab_result"),
        ("alanine aminotransferase", "1742-6", "U/L", "lab_result"),
        ("glucose", "2345-7", "mg/dL", "lab_result"),
        ("hba1c", "4548-4", "%", "lab_result"),
        ("total cholesterol", "2093-3", "mg/dL", "lab_result"),
    ];

    SEED.iter()
        .map(|(name, code, unit, category)| CanonicalMapping {
            metric_name: name.to_string(),
            canonical_code: code.to_string(),
            unit: Some(unit.to_string()),
            category: Some(category.to_string()),
            source_of_mapping: MappingSource::Builtin,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MappingStore, MemoryStore};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers every name with a fixed code and counts calls
    struct CountingInference {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CodeInference for CountingInference {
        async fn infer(
            &self,
            _metric_name: &str,
            _category: Option<&str>,
            _unit: &str,
        ) -> Result<Option<InferredCode>, RollupError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Some(InferredCode {
                code: "8310-5".to_string(),
                source: "test-model".to_string(),
            }))
        }
    }

    struct SlowInference;

    #[async_trait]
    impl CodeInference for SlowInference {
        async fn infer(
            &self,
            _metric_name: &str,
            _category: Option<&str>,
            _unit: &str,
        ) -> Result<Option<InferredCode>, RollupError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Some(InferredCode {
                code: "never".to_string(),
                source: "slow".to_string(),
            }))
        }
    }

    struct FailingInference;

    #[async_trait]
    impl CodeInference for FailingInference {
        async fn infer(
            &self,
            _metric_name: &str,
            _category: Option<&str>,
            _unit: &str,
        ) -> Result<Option<InferredCode>, RollupError> {
            Err(RollupError::Inference("service unavailable".to_string()))
        }
    }

    fn mapper(store: Arc<MemoryStore>, inference: Arc<dyn CodeInference>) -> CategorizationMapper {
        let mapper = CategorizationMapper::new(
            store,
            inference,
            Arc::new(MappingCache::new(16)),
            Duration::from_millis(50),
        );
        mapper.seed_builtin().unwrap();
        mapper
    }

    #[tokio::test]
    async fn test_table_then_cache() {
        let store = Arc::new(MemoryStore::new());
        let m = mapper(store, Arc::new(NullInference));

        let first = m.resolve("Heart_Rate", Some("vitals"), "bpm").await.unwrap();
        assert_eq!(first, Resolution::found("8867-4", ResolutionSource::Table));

        let second = m.resolve("heart rate", None, "bpm").await.unwrap();
        assert_eq!(second.source, ResolutionSource::Cache);
    }

    #[tokio::test]
    async fn test_fuzzy_match_on_reordered_tokens() {
        let store = Arc::new(MemoryStore::new());
        let m = mapper(store, Arc::new(NullInference));

        let r = m.resolve("Blood Pressure Systolic", None, "mmHg").await.unwrap();
        assert_eq!(r, Resolution::found("8480-6", ResolutionSource::Fuzzy));
    }

    #[tokio::test]
    async fn test_inferred_mapping_is_persisted_and_reused() {
        let store = Arc::new(MemoryStore::new());
        let inference = Arc::new(CountingInference {
            calls: AtomicUsize::new(0),
        });
        let m = mapper(store.clone(), inference.clone());

        let first = m
            .resolve("Forehead Temperature", Some("vitals"), "degF")
            .await
            .unwrap();
        assert_eq!(first, Resolution::found("8310-5", ResolutionSource::Inference));

        let persisted = store.find_mapping("forehead temperature").unwrap().unwrap();
        assert_eq!(persisted.source_of_mapping, MappingSource::Inferred);
        assert_eq!(persisted.unit.as_deref(), Some("degF"));

        let second = m
            .resolve("Forehead Temperature", Some("vitals"), "degF")
            .await
            .unwrap();
        assert_eq!(second.code.as_deref(), Some("8310-5"));
        assert_eq!(inference.calls.load(Ordering::SeqCst), 1);

        // A fresh mapper with an empty cache still skips inference
        let fresh = CategorizationMapper::new(
            store,
            inference.clone(),
            Arc::new(MappingCache::new(16)),
            Duration::from_millis(50),
        );
        let third = fresh
            .resolve("forehead_temperature", None, "degF")
            .await
            .unwrap();
        assert_eq!(third.source, ResolutionSource::Table);
        assert_eq!(inference.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_miss_is_not_an_error() {
        let store = Arc::new(MemoryStore::new());
        let m = mapper(store, Arc::new(NullInference));
        let r = m.resolve("Mystery Metric", None, "").await.unwrap();
        assert_eq!(r, Resolution::unresolved());
    }

    #[tokio::test]
    async fn test_inference_timeout_and_failure_degrade() {
        let store = Arc::new(MemoryStore::new());
        let slow = mapper(store.clone(), Arc::new(SlowInference));
        assert_eq!(
            slow.resolve("Mystery Metric", None, "").await.unwrap(),
            Resolution::unresolved()
        );

        let failing = mapper(store, Arc::new(FailingInference));
        assert_eq!(
            failing.resolve("Mystery Metric", None, "").await.unwrap(),
            Resolution::unresolved()
        );
    }

    #[test]
    fn test_cache_evicts_oldest() {
        let cache = MappingCache::new(2);
        let mapping = |code: &str| CanonicalMapping {
            metric_name: code.to_string(),
            canonical_code: code.to_string(),
            unit: None,
            category: None,
            source_of_mapping: MappingSource::Table,
        };

        cache.insert("a".to_string(), mapping("1"));
        cache.insert("b".to_string(), mapping("2"));
        cache.insert("a".to_string(), mapping("1b"));
        cache.insert("c".to_string(), mapping("3"));

        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_none());
        assert_eq!(cache.get("b").unwrap().canonical_code, "2");
        assert_eq!(cache.get("c").unwrap().canonical_code, "3");
    }

    #[test]
    fn test_seed_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let m = mapper(store.clone(), Arc::new(NullInference));
        assert_eq!(m.seed_builtin().unwrap(), 0);
        assert_eq!(store.all_mappings().unwrap().len(), builtin_mappings().len());
    }

    #[test]
    fn test_jaccard() {
        let a = tokens("forehead temperature");
        let b = tokens("body temperature");
        assert!(jaccard(&a, &b) < FUZZY_THRESHOLD);
        assert_eq!(jaccard(&tokens("a b"), &tokens("b a")), 1.0);
    }
}
