//! Per-node model cache
//!
//! One entry per model id. An entry carries the local lifecycle state and
//! predictor when the model is deployed on this node, and the target and
//! actual worker-node sets the router maintains for every model in the
//! cluster. Entries live in a sharded map, so operations on one model id are
//! mutually exclusive while different ids rarely contend.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use modelplane_core::{
    FunctionCategory, GuardrailConfig, ModelPlaneError, ModelPlaneResult, ModelState,
    RateLimiterConfig,
};
use modelplane_runtime::{Guard, PredictorHandle};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::stats::{DurationSamples, DurationStats};
use crate::throttle::RateLimiter;

struct ModelCacheEntry {
    /// Local lifecycle state; `None` for entries that only carry routing
    state: Option<ModelState>,
    category: Option<FunctionCategory>,
    predictor: Option<Arc<PredictorHandle>>,
    /// Nodes the caller asked to host the model
    target_worker_nodes: BTreeSet<String>,
    /// Nodes confirmed to host the model
    worker_nodes: BTreeSet<String>,
    deploy_to_all_nodes: bool,
    rate_limiter_config: Option<RateLimiterConfig>,
    rate_limiter: Option<Arc<RateLimiter>>,
    user_rate_limiter_configs: HashMap<String, RateLimiterConfig>,
    user_rate_limiters: HashMap<String, Arc<RateLimiter>>,
    guard: Option<Arc<Guard>>,
    inference_durations: DurationSamples,
    predict_request_durations: DurationSamples,
}

impl ModelCacheEntry {
    fn new(max_samples: usize) -> Self {
        Self {
            state: None,
            category: None,
            predictor: None,
            target_worker_nodes: BTreeSet::new(),
            worker_nodes: BTreeSet::new(),
            deploy_to_all_nodes: false,
            rate_limiter_config: None,
            rate_limiter: None,
            user_rate_limiter_configs: HashMap::new(),
            user_rate_limiters: HashMap::new(),
            guard: None,
            inference_durations: DurationSamples::new(max_samples),
            predict_request_durations: DurationSamples::new(max_samples),
        }
    }

    fn is_local(&self) -> bool {
        self.state.is_some()
    }

    /// An entry is worth keeping while it hosts something locally, or still
    /// has confirmed or requested worker nodes
    fn is_valid(&self) -> bool {
        self.is_local() || !self.worker_nodes.is_empty() || !self.target_worker_nodes.is_empty()
    }

    fn resize_rate_limiters(&mut self, eligible_nodes: usize) -> ModelPlaneResult<()> {
        self.rate_limiter = self
            .rate_limiter_config
            .as_ref()
            .map(|config| RateLimiter::for_nodes(config, eligible_nodes).map(Arc::new))
            .transpose()?;
        self.user_rate_limiters = self
            .user_rate_limiter_configs
            .iter()
            .map(|(user, config)| {
                RateLimiter::for_nodes(config, eligible_nodes).map(|l| (user.clone(), Arc::new(l)))
            })
            .collect::<ModelPlaneResult<_>>()?;
        Ok(())
    }
}

/// Point-in-time view of one model for observability
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelProfile {
    pub model_id: String,
    pub model_state: Option<ModelState>,
    pub category: Option<FunctionCategory>,
    /// Kind of the predictor held on this node
    pub predictor: Option<String>,
    pub target_worker_nodes: Vec<String>,
    pub worker_nodes: Vec<String>,
    pub model_inference_stats: Option<DurationStats>,
    pub predict_request_stats: Option<DurationStats>,
}

/// Everything the predict path needs, cloned out of the entry
pub struct Admission {
    pub predictor: Arc<PredictorHandle>,
    pub guard: Option<Arc<Guard>>,
}

/// The node's model table
pub struct ModelCache {
    entries: DashMap<String, ModelCacheEntry>,
    max_samples: AtomicUsize,
}

impl ModelCache {
    pub fn new(max_samples: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_samples: AtomicUsize::new(max_samples),
        }
    }

    fn max_samples(&self) -> usize {
        self.max_samples.load(Ordering::Relaxed)
    }

    fn not_found(model_id: &str) -> ModelPlaneError {
        ModelPlaneError::not_found(format!("model {} is not in the cache", model_id))
    }

    /// Start tracking a model on this node.
    ///
    /// Fails with `DuplicateTask` when the model already has a local state.
    pub fn init_state(
        &self,
        model_id: &str,
        state: ModelState,
        category: FunctionCategory,
        target_worker_nodes: &[String],
        deploy_to_all_nodes: bool,
    ) -> ModelPlaneResult<()> {
        let max_samples = self.max_samples();
        let mut entry = match self.entries.entry(model_id.to_string()) {
            Entry::Occupied(occupied) => {
                if occupied.get().is_local() {
                    return Err(ModelPlaneError::DuplicateTask(model_id.to_string()));
                }
                occupied.into_ref()
            }
            Entry::Vacant(vacant) => vacant.insert(ModelCacheEntry::new(max_samples)),
        };
        entry.state = Some(state);
        entry.category = Some(category);
        entry.target_worker_nodes = target_worker_nodes.iter().cloned().collect();
        entry.deploy_to_all_nodes = deploy_to_all_nodes;
        debug!(model_id = model_id, state = %state, "Initialized model state");
        Ok(())
    }

    pub fn set_state(&self, model_id: &str, state: ModelState) -> ModelPlaneResult<()> {
        let mut entry = self
            .entries
            .get_mut(model_id)
            .ok_or_else(|| Self::not_found(model_id))?;
        entry.state = Some(state);
        Ok(())
    }

    pub fn state(&self, model_id: &str) -> Option<ModelState> {
        self.entries.get(model_id).and_then(|e| e.state)
    }

    pub fn is_model_deployed(&self, model_id: &str) -> bool {
        self.state(model_id) == Some(ModelState::Deployed)
    }

    pub fn contains(&self, model_id: &str) -> bool {
        self.entries.contains_key(model_id)
    }

    /// Number of models with a local state on this node
    pub fn local_model_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_local()).count()
    }

    /// Ids of models with a local state on this node
    pub fn local_model_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.is_local())
            .map(|e| e.key().clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn set_target_worker_nodes(&self, model_id: &str, nodes: &[String]) -> ModelPlaneResult<()> {
        let mut entry = self
            .entries
            .get_mut(model_id)
            .ok_or_else(|| Self::not_found(model_id))?;
        entry.target_worker_nodes = nodes.iter().cloned().collect();
        Ok(())
    }

    pub fn target_worker_nodes(&self, model_id: &str) -> Vec<String> {
        self.entries
            .get(model_id)
            .map(|e| e.target_worker_nodes.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn worker_nodes(&self, model_id: &str) -> Vec<String> {
        self.entries
            .get(model_id)
            .map(|e| e.worker_nodes.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Record that `node_id` hosts the model, creating a routing entry if needed
    pub fn add_worker_node(&self, model_id: &str, node_id: &str) {
        let max_samples = self.max_samples();
        self.entries
            .entry(model_id.to_string())
            .or_insert_with(|| ModelCacheEntry::new(max_samples))
            .worker_nodes
            .insert(node_id.to_string());
    }

    /// Drop `node_id` from the model's worker set.
    ///
    /// An undeploy also drops it from the targets. The entry is purged once it
    /// has no local state, no worker nodes and no targets left.
    pub fn remove_worker_node(&self, model_id: &str, node_id: &str, from_undeploy: bool) {
        let purge = match self.entries.get_mut(model_id) {
            Some(mut entry) => {
                if from_undeploy {
                    entry.target_worker_nodes.remove(node_id);
                }
                entry.worker_nodes.remove(node_id);
                !entry.is_valid()
            }
            None => return,
        };
        if purge {
            self.entries.remove_if(model_id, |_, e| !e.is_valid());
            debug!(model_id = model_id, "Purged model cache entry");
        }
    }

    /// Strip departed nodes from every model.
    ///
    /// A model whose confirmed worker set goes from non-empty to empty is no
    /// longer hosted anywhere and is evicted; returns the evicted ids.
    pub fn remove_worker_nodes(&self, node_ids: &BTreeSet<String>, from_undeploy: bool) -> Vec<String> {
        let mut evicted = Vec::new();
        self.entries.retain(|model_id, entry| {
            let hosted_before = !entry.worker_nodes.is_empty();
            entry.worker_nodes.retain(|n| !node_ids.contains(n));
            if from_undeploy {
                entry.target_worker_nodes.retain(|n| !node_ids.contains(n));
            }
            let keep = !(hosted_before && entry.worker_nodes.is_empty()) && entry.is_valid();
            if !keep {
                evicted.push(model_id.clone());
            }
            keep
        });
        evicted.sort();
        if !evicted.is_empty() {
            info!(models = ?evicted, nodes = ?node_ids, "Evicted unhosted models");
        }
        evicted
    }

    /// Reconcile with a complete model → worker-nodes snapshot.
    ///
    /// Models missing from the snapshot lose their worker nodes and are
    /// dropped unless they carry a local state; the rest take the snapshot's
    /// worker set.
    pub fn sync_worker_nodes(&self, snapshot: &HashMap<String, BTreeSet<String>>) {
        self.entries.retain(|model_id, entry| {
            if snapshot.contains_key(model_id) {
                return true;
            }
            entry.worker_nodes.clear();
            entry.is_local()
        });

        let max_samples = self.max_samples();
        for (model_id, nodes) in snapshot {
            let mut entry = self
                .entries
                .entry(model_id.clone())
                .or_insert_with(|| ModelCacheEntry::new(max_samples));
            entry.worker_nodes = nodes.clone();
        }
        debug!(models = snapshot.len(), "Synced worker nodes");
    }

    /// Every hosted model with its confirmed worker nodes
    pub fn routing_table(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.entries
            .iter()
            .filter(|e| !e.worker_nodes.is_empty())
            .map(|e| (e.key().clone(), e.worker_nodes.clone()))
            .collect()
    }

    pub fn set_predictor(&self, model_id: &str, predictor: Arc<PredictorHandle>) -> ModelPlaneResult<()> {
        let mut entry = self
            .entries
            .get_mut(model_id)
            .ok_or_else(|| Self::not_found(model_id))?;
        entry.predictor = Some(predictor);
        Ok(())
    }

    pub fn predictor(&self, model_id: &str) -> Option<Arc<PredictorHandle>> {
        self.entries.get(model_id).and_then(|e| e.predictor.clone())
    }

    /// Remove a model's entry, releasing its predictor
    pub fn remove_model(&self, model_id: &str) -> bool {
        match self.entries.remove(model_id) {
            Some((_, entry)) => {
                debug!(
                    model_id = model_id,
                    had_predictor = entry.predictor.is_some(),
                    "Removed model from cache"
                );
                true
            }
            None => false,
        }
    }

    /// Install the model and per-user limiters, sized for `eligible_nodes`
    pub fn set_rate_limiters(
        &self,
        model_id: &str,
        model_limit: Option<RateLimiterConfig>,
        user_limits: HashMap<String, RateLimiterConfig>,
        eligible_nodes: usize,
    ) -> ModelPlaneResult<()> {
        let mut entry = self
            .entries
            .get_mut(model_id)
            .ok_or_else(|| Self::not_found(model_id))?;
        entry.rate_limiter_config = model_limit;
        entry.user_rate_limiter_configs = user_limits;
        entry.resize_rate_limiters(eligible_nodes)
    }

    /// Re-split every configured limiter over a new eligible-node count
    pub fn resize_rate_limiters(&self, eligible_nodes: usize) {
        for mut entry in self.entries.iter_mut() {
            if entry.rate_limiter_config.is_none() && entry.user_rate_limiter_configs.is_empty() {
                continue;
            }
            if let Err(e) = entry.resize_rate_limiters(eligible_nodes) {
                warn!(model_id = %entry.key(), error = %e, "Keeping previous rate limiters");
            }
        }
    }

    pub fn rate_limiter(&self, model_id: &str) -> Option<Arc<RateLimiter>> {
        self.entries.get(model_id).and_then(|e| e.rate_limiter.clone())
    }

    pub fn user_rate_limiter(&self, model_id: &str, user: &str) -> Option<Arc<RateLimiter>> {
        self.entries
            .get(model_id)
            .and_then(|e| e.user_rate_limiters.get(user).cloned())
    }

    pub fn set_guard(&self, model_id: &str, guardrails: Option<&GuardrailConfig>) -> ModelPlaneResult<()> {
        let mut entry = self
            .entries
            .get_mut(model_id)
            .ok_or_else(|| Self::not_found(model_id))?;
        entry.guard = guardrails
            .map(Guard::new)
            .filter(|g| !g.is_empty())
            .map(Arc::new);
        Ok(())
    }

    /// Admit one prediction: the model must be deployed here and both the
    /// model and the caller's limiter must yield a token
    pub fn admit(&self, model_id: &str, user: Option<&str>) -> ModelPlaneResult<Admission> {
        let entry = self.entries.get(model_id).ok_or_else(|| {
            ModelPlaneError::not_found(format!("model {} is not deployed on this node", model_id))
        })?;
        let predictor = match (entry.state, &entry.predictor) {
            (Some(ModelState::Deployed), Some(predictor)) => predictor.clone(),
            _ => {
                return Err(ModelPlaneError::validation(format!(
                    "model {} is not ready, state {}",
                    model_id,
                    entry.state.map_or("UNKNOWN".to_string(), |s| s.to_string())
                )))
            }
        };
        if let Some(limiter) = &entry.rate_limiter {
            if !limiter.try_acquire() {
                return Err(ModelPlaneError::limit_exceeded(
                    "Request is throttled at model level",
                ));
            }
        }
        if let Some(limiter) = user.and_then(|u| entry.user_rate_limiters.get(u)) {
            if !limiter.try_acquire() {
                return Err(ModelPlaneError::limit_exceeded(
                    "Request is throttled at user level",
                ));
            }
        }
        Ok(Admission {
            predictor,
            guard: entry.guard.clone(),
        })
    }

    /// Record a predictor execution time in milliseconds
    pub fn add_inference_duration(&self, model_id: &str, millis: f64) {
        if let Some(mut entry) = self.entries.get_mut(model_id) {
            entry.inference_durations.push(millis);
        }
    }

    /// Record an end-to-end predict request time in milliseconds
    pub fn add_predict_request_duration(&self, model_id: &str, millis: f64) {
        if let Some(mut entry) = self.entries.get_mut(model_id) {
            entry.predict_request_durations.push(millis);
        }
    }

    pub fn inference_stats(&self, model_id: &str) -> Option<DurationStats> {
        self.entries
            .get(model_id)
            .and_then(|e| e.inference_durations.stats())
    }

    /// Change the sample bound of every model's buffers
    pub fn resize_monitoring_queue(&self, max_samples: usize) {
        self.max_samples.store(max_samples, Ordering::Relaxed);
        for mut entry in self.entries.iter_mut() {
            entry.inference_durations.resize(max_samples);
            entry.predict_request_durations.resize(max_samples);
        }
        info!(max_samples = max_samples, "Resized monitoring queues");
    }

    pub fn profile(&self, model_id: &str) -> Option<ModelProfile> {
        let entry = self.entries.get(model_id)?;
        Some(ModelProfile {
            model_id: model_id.to_string(),
            model_state: entry.state,
            category: entry.category,
            predictor: entry.predictor.as_ref().map(|p| p.name().to_string()),
            target_worker_nodes: entry.target_worker_nodes.iter().cloned().collect(),
            worker_nodes: entry.worker_nodes.iter().cloned().collect(),
            model_inference_stats: entry.inference_durations.stats(),
            predict_request_stats: entry.predict_request_durations.stats(),
        })
    }

    pub fn profiles(&self) -> Vec<ModelProfile> {
        let mut ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids.iter().filter_map(|id| self.profile(id)).collect()
    }
}
