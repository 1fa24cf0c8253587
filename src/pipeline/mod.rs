//! Versioned pipelines and named routes.
//!
//! A pipeline is a stack of versions; the top is active. Each version is an
//! ordered list of [`Step`]s, which resolve to a concrete digest list per
//! invocation. Resolutions are cached per pipeline for a short window so a burst
//! of calls doesn't re-roll its split draws; any push or pop across any
//! pipeline flushes the whole cache.

pub mod routes;
pub mod step;

pub use routes::{RouteEntry, RouteTable};
pub use step::{resolve_steps, SplitStep, Step};

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::types::{Digest, Error, Result};

#[derive(Debug, Clone)]
struct CachedResolution {
    resolved_at: Instant,
    digests: Vec<Digest>,
}

/// Snapshot of one pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineInfo {
    pub name: String,
    pub versions: usize,
    pub active: Vec<Step>,
}

/// Pipeline version stacks plus the resolution cache.
///
/// NOT a separate actor - owned by the coordinator core and called via &mut self.
#[derive(Debug)]
pub struct PipelineEngine {
    stacks: HashMap<String, Vec<Vec<Step>>>,
    cache: HashMap<String, CachedResolution>,
    cache_ttl: Duration,
    rng: StdRng,
}

impl PipelineEngine {
    pub fn new(cache_ttl: Duration) -> Self {
        Self::with_rng(cache_ttl, StdRng::from_entropy())
    }

    /// Engine with a deterministic split sequence.
    pub fn seeded(cache_ttl: Duration, seed: u64) -> Self {
        Self::with_rng(cache_ttl, StdRng::seed_from_u64(seed))
    }

    fn with_rng(cache_ttl: Duration, rng: StdRng) -> Self {
        Self {
            stacks: HashMap::new(),
            cache: HashMap::new(),
            cache_ttl,
            rng,
        }
    }

    /// Check a version before it is pushed.
    pub fn validate(name: &str, steps: &[Step]) -> Result<()> {
        if name.is_empty() {
            return Err(Error::validation("pipeline name cannot be empty"));
        }
        if steps.is_empty() {
            return Err(Error::validation(format!("pipeline {} has no steps", name)));
        }
        steps.iter().try_for_each(Step::validate)
    }

    /// Push a new active version. Returns the stack depth.
    pub fn push(&mut self, name: &str, steps: Vec<Step>) -> Result<usize> {
        Self::validate(name, &steps)?;
        let stack = self.stacks.entry(name.to_string()).or_default();
        stack.push(steps);
        let depth = stack.len();
        self.flush_cache();
        tracing::debug!("Pipeline {} now at version {}", name, depth);
        Ok(depth)
    }

    /// Pop the active version. An emptied pipeline disappears.
    pub fn pop(&mut self, name: &str) -> bool {
        let Some(stack) = self.stacks.get_mut(name) else {
            return false;
        };
        if stack.pop().is_none() {
            return false;
        }
        if stack.is_empty() {
            self.stacks.remove(name);
        }
        self.flush_cache();
        true
    }

    /// Drop every version of `name` and its cached resolution.
    pub fn remove(&mut self, name: &str) -> bool {
        self.cache.remove(name);
        self.stacks.remove(name).is_some()
    }

    pub fn active(&self, name: &str) -> Option<&[Step]> {
        self.stacks
            .get(name)
            .and_then(|stack| stack.last())
            .map(Vec::as_slice)
    }

    pub fn depth(&self, name: &str) -> usize {
        self.stacks.get(name).map_or(0, Vec::len)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.depth(name) > 0
    }

    pub fn list(&self) -> Vec<PipelineInfo> {
        let mut infos: Vec<PipelineInfo> = self
            .stacks
            .iter()
            .filter_map(|(name, stack)| {
                stack.last().map(|active| PipelineInfo {
                    name: name.clone(),
                    versions: stack.len(),
                    active: active.clone(),
                })
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Concrete digest list for the active version, reusing a fresh cached
    /// resolution when there is one.
    pub fn resolve(&mut self, name: &str) -> Result<Vec<Digest>> {
        if let Some(cached) = self.cache.get(name) {
            if cached.resolved_at.elapsed() < self.cache_ttl {
                return Ok(cached.digests.clone());
            }
        }

        let steps = self
            .stacks
            .get(name)
            .and_then(|stack| stack.last())
            .ok_or_else(|| Error::not_found(format!("pipeline {}", name)))?;
        let digests = resolve_steps(steps, &mut self.rng);

        if !self.cache_ttl.is_zero() {
            self.cache.insert(
                name.to_string(),
                CachedResolution {
                    resolved_at: Instant::now(),
                    digests: digests.clone(),
                },
            );
        }
        Ok(digests)
    }

    pub fn flush_cache(&mut self) {
        self.cache.clear();
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn digest(s: &str) -> Digest {
        Digest::from_string(s).unwrap()
    }

    fn steps(names: &[&str]) -> Vec<Step> {
        names.iter().map(|n| Step::digest(digest(n))).collect()
    }

    #[test]
    fn test_stack_push_and_rollback() {
        let mut engine = PipelineEngine::new(Duration::ZERO);
        engine.push("p", steps(&["d1"])).unwrap();
        engine.push("p", steps(&["d2"])).unwrap();
        assert_eq!(engine.depth("p"), 2);

        assert!(engine.pop("p"));
        assert_eq!(engine.active("p").unwrap(), steps(&["d1"]).as_slice());

        assert!(engine.pop("p"));
        assert!(engine.active("p").is_none());
        assert!(!engine.contains("p"));
        assert!(!engine.pop("p"));
        assert!(matches!(engine.resolve("p"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_push_validates() {
        let mut engine = PipelineEngine::new(Duration::ZERO);
        assert!(engine.push("p", vec![]).is_err());
        assert!(engine.push("", steps(&["d1"])).is_err());
        assert!(engine
            .push("p", vec![Step::split([(digest("a"), -1.0)])])
            .is_err());
        assert!(!engine.contains("p"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolution_cached_within_window() {
        let mut engine = PipelineEngine::seeded(Duration::from_secs(1), 9);
        engine
            .push("p", vec![Step::split([(digest("a"), 0.5), (digest("b"), 0.5)])])
            .unwrap();

        let first = engine.resolve("p").unwrap();
        for _ in 0..20 {
            assert_eq!(engine.resolve("p").unwrap(), first);
        }
        assert_eq!(engine.cached(), 1);

        tokio::time::advance(Duration::from_millis(1001)).await;
        engine.resolve("p").unwrap();
        assert_eq!(engine.cached(), 1);
    }

    #[test]
    fn test_push_anywhere_flushes_all() {
        let mut engine = PipelineEngine::new(Duration::from_secs(60));
        engine.push("a", steps(&["d1"])).unwrap();
        engine.push("b", steps(&["d2"])).unwrap();
        engine.resolve("a").unwrap();
        engine.resolve("b").unwrap();
        assert_eq!(engine.cached(), 2);

        engine.push("c", steps(&["d3"])).unwrap();
        assert_eq!(engine.cached(), 0);

        engine.resolve("a").unwrap();
        engine.resolve("b").unwrap();
        engine.remove("a");
        assert_eq!(engine.cached(), 1);
    }

    #[test]
    fn test_split_ratio_through_engine() {
        let mut engine = PipelineEngine::seeded(Duration::ZERO, 1234);
        engine
            .push("p", vec![Step::split([(digest("A"), 0.3), (digest("B"), 0.7)])])
            .unwrap();
        let hits = (0..500)
            .filter(|_| engine.resolve("p").unwrap() == vec![digest("A")])
            .count();
        let ratio = hits as f64 / 500.0;
        assert!((ratio - 0.3).abs() <= 0.07, "ratio {}", ratio);
    }

    #[test]
    fn test_list_sorted() {
        let mut engine = PipelineEngine::new(Duration::ZERO);
        engine.push("zeta", steps(&["d1"])).unwrap();
        engine.push("alpha", steps(&["d2"])).unwrap();
        engine.push("alpha", steps(&["d3"])).unwrap();
        let names: Vec<(String, usize)> = engine
            .list()
            .into_iter()
            .map(|p| (p.name, p.versions))
            .collect();
        assert_eq!(names, vec![("alpha".to_string(), 2), ("zeta".to_string(), 1)]);
    }
}
