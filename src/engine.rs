//! Detection engine: runs indicators in priority order, stops early once the
//! evidence is conclusive, and folds the collected results into one
//! explainable [`DetectionResult`].
//!
//! Aggregation over the collected results:
//!
//! 1. weighted average of `Success` results (others add no weight),
//! 2. `x1.1` when outcomes are unanimous, `x0.8` on contradiction,
//! 3. `x1.05` when two or more results are above 0.8,
//! 4. clamp to [0, 1] and compare with the threshold for the result count.
//!
//! The final score is a pure function of the collected set, so the
//! sequential and pooled modes agree whenever they collect the same results.

use log::{debug, info, warn};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::config::{EngineConfig, ExecutionMode};
use crate::errors::panic_message;
use crate::indicator::{Indicator, IndicatorRegistry, IndicatorResult, clamp_confidence};
use crate::model::Archive;
use crate::pool::{IndicatorPool, PoolStats};

const UNANIMITY_FACTOR: f64 = 1.1;
const CONTRADICTION_FACTOR: f64 = 0.8;
const CERTAINTY_FACTOR: f64 = 1.05;
const CERTAINTY_LEVEL: f64 = 0.8;

/// Why evaluation ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StopReason {
    Completed,
    SingleIndicator { indicator: String },
    CombinedConfidence,
    Timeout,
    EngineFailure { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionResult {
    pub archive: String,
    pub is_positive: bool,
    pub confidence: f64,
    /// Confidence required for `is_positive`, chosen by result count.
    pub threshold: f64,
    pub indicator_results: BTreeMap<String, IndicatorResult>,
    pub features: BTreeSet<String>,
    pub version: Option<String>,
    pub main_class: Option<String>,
    pub stop_reason: StopReason,
    /// Seconds since the UNIX epoch.
    pub timestamp: u64,
}

impl DetectionResult {
    fn empty(archive: &Archive, threshold: f64, stop_reason: StopReason) -> Self {
        Self {
            archive: archive.location.display_name.clone(),
            is_positive: false,
            confidence: 0.0,
            threshold,
            indicator_results: BTreeMap::new(),
            features: BTreeSet::new(),
            version: None,
            main_class: None,
            stop_reason,
            timestamp: unix_now(),
        }
    }
}

/// Read-only snapshot of [`DetectionEngine`] counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnginePerformanceStats {
    pub analyses: u64,
    pub total_elapsed_ms: f64,
    pub average_elapsed_ms: f64,
    /// Share of analyses classified positive.
    pub success_ratio: f64,
    pub early_terminations: u64,
    pub timeouts: u64,
    /// `None` when indicators run inline.
    pub pool: Option<PoolStats>,
}

#[derive(Debug, Default)]
struct EngineStats {
    analyses: AtomicU64,
    elapsed_us: AtomicU64,
    positives: AtomicU64,
    early_terminations: AtomicU64,
    timeouts: AtomicU64,
}

impl EngineStats {
    fn record(&self, elapsed: Duration, result: &DetectionResult) {
        self.analyses.fetch_add(1, Ordering::Relaxed);
        self.elapsed_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        if result.is_positive {
            self.positives.fetch_add(1, Ordering::Relaxed);
        }
        match result.stop_reason {
            StopReason::SingleIndicator { .. } | StopReason::CombinedConfidence => {
                self.early_terminations.fetch_add(1, Ordering::Relaxed);
            }
            StopReason::Timeout => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    fn snapshot(&self) -> EnginePerformanceStats {
        let analyses = self.analyses.load(Ordering::Relaxed);
        let total_ms = self.elapsed_us.load(Ordering::Relaxed) as f64 / 1000.0;
        let ratio = |n: u64| {
            if analyses == 0 {
                0.0
            } else {
                n as f64 / analyses as f64
            }
        };
        EnginePerformanceStats {
            analyses,
            total_elapsed_ms: total_ms,
            average_elapsed_ms: if analyses == 0 {
                0.0
            } else {
                total_ms / analyses as f64
            },
            success_ratio: ratio(self.positives.load(Ordering::Relaxed)),
            early_terminations: self.early_terminations.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            pool: None,
        }
    }
}

/// Worker pool and performance counters shared by every engine built on it.
///
/// One runtime serves the whole process; engines are cheap and may be built
/// per archive around their own indicators.
pub struct EngineRuntime {
    pool: Option<IndicatorPool>,
    stats: EngineStats,
}

impl EngineRuntime {
    /// Indicators run on a bounded worker pool so the deadline holds even
    /// for an indicator that never returns. If the pool cannot be built they
    /// run inline and the deadline is only checked between indicators.
    pub fn new(max_workers: usize) -> Self {
        let pool = match IndicatorPool::new(max_workers) {
            Ok(pool) => Some(pool),
            Err(e) => {
                warn!("engine: running indicators inline: {e:#}");
                None
            }
        };
        Self {
            pool,
            stats: EngineStats::default(),
        }
    }

    pub fn stats(&self) -> EnginePerformanceStats {
        EnginePerformanceStats {
            pool: self.pool.as_ref().map(IndicatorPool::stats),
            ..self.stats.snapshot()
        }
    }
}

impl std::fmt::Debug for EngineRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRuntime")
            .field("pool", &self.pool)
            .field("stats", &self.stats)
            .finish()
    }
}

/// One result as collected, with the weight of the indicator that made it.
#[derive(Debug, Clone)]
struct Collected {
    name: String,
    weight: f64,
    result: IndicatorResult,
}

pub struct DetectionEngine {
    indicators: Vec<Arc<dyn Indicator>>,
    config: EngineConfig,
    runtime: Arc<EngineRuntime>,
}

impl DetectionEngine {
    /// Engine with a runtime of its own.
    pub fn new(registry: &IndicatorRegistry, config: EngineConfig) -> Self {
        let runtime = Arc::new(EngineRuntime::new(config.max_workers));
        Self::with_runtime(registry, config, runtime)
    }

    pub fn with_runtime(
        registry: &IndicatorRegistry,
        config: EngineConfig,
        runtime: Arc<EngineRuntime>,
    ) -> Self {
        Self {
            indicators: registry.ordered(),
            config,
            runtime,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn indicator_names(&self) -> Vec<&str> {
        self.indicators.iter().map(|i| i.name()).collect()
    }

    /// Counters of the runtime, covering every engine that shares it.
    pub fn stats(&self) -> EnginePerformanceStats {
        self.runtime.stats()
    }

    /// Always yields a well-formed result; failures outside the indicators
    /// produce a zero-confidence negative one.
    pub fn detect(&self, archive: &Archive) -> DetectionResult {
        let started = Instant::now();
        let result = match catch_unwind(AssertUnwindSafe(|| self.run(archive, started))) {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!("engine: {} failed: {message}", archive.location.display_name);
                DetectionResult::empty(
                    archive,
                    self.config.thresholds.for_count(0),
                    StopReason::EngineFailure { message },
                )
            }
        };
        self.runtime.stats.record(started.elapsed(), &result);
        debug!(
            "engine: {} -> positive={} confidence={:.3} threshold={:.2} ({} results, {:?})",
            result.archive,
            result.is_positive,
            result.confidence,
            result.threshold,
            result.indicator_results.len(),
            started.elapsed()
        );
        result
    }

    fn run(&self, archive: &Archive, started: Instant) -> DetectionResult {
        let deadline = started + self.config.timeout();
        if archive.is_empty() {
            debug!("engine: {} has no compiled units", archive.location.display_name);
            return DetectionResult::empty(
                archive,
                self.config.thresholds.for_count(0),
                StopReason::Completed,
            );
        }

        let eligible: Vec<Arc<dyn Indicator>> = self
            .indicators
            .iter()
            .filter(|i| check_applicable(i.as_ref(), archive))
            .cloned()
            .collect();

        if eligible.is_empty() {
            debug!("engine: no applicable indicators for {}", archive.location.display_name);
            return DetectionResult::empty(
                archive,
                self.config.thresholds.for_count(0),
                StopReason::Completed,
            );
        }

        let (collected, stop_reason) = match (&self.runtime.pool, self.config.mode) {
            (Some(pool), ExecutionMode::Pooled) => self.run_pooled(pool, &eligible, archive, deadline),
            (pool, _) => self.run_sequential(pool.as_ref(), &eligible, archive, deadline),
        };
        self.finish(archive, collected, stop_reason)
    }

    fn run_sequential(
        &self,
        pool: Option<&IndicatorPool>,
        eligible: &[Arc<dyn Indicator>],
        archive: &Archive,
        deadline: Instant,
    ) -> (Vec<Collected>, StopReason) {
        let shared = pool.map(|_| Arc::new(archive.clone()));
        let mut collected: Vec<Collected> = Vec::with_capacity(eligible.len());

        for indicator in eligible {
            if Instant::now() >= deadline {
                warn!("engine: deadline reached before {}", indicator.name());
                return (collected, StopReason::Timeout);
            }

            let result = match (pool, &shared) {
                (Some(pool), Some(shared)) => {
                    let task = indicator_task(Arc::clone(indicator), Arc::clone(shared));
                    match pool.run_until(vec![task], deadline).completed.pop() {
                        Some((_, result)) => result,
                        None => {
                            warn!("engine: {} did not finish before the deadline", indicator.name());
                            return (collected, StopReason::Timeout);
                        }
                    }
                }
                _ => run_indicator(indicator.as_ref(), archive),
            };

            collected.push(Collected {
                name: indicator.name().to_string(),
                weight: indicator.weight(),
                result,
            });
            if let Some(reason) = self.early_stop(&collected) {
                return (collected, reason);
            }
        }
        (collected, StopReason::Completed)
    }

    /// Runs every eligible indicator concurrently, then replays the stop
    /// rules over the completed results in priority order.
    fn run_pooled(
        &self,
        pool: &IndicatorPool,
        eligible: &[Arc<dyn Indicator>],
        archive: &Archive,
        deadline: Instant,
    ) -> (Vec<Collected>, StopReason) {
        let shared = Arc::new(archive.clone());
        let tasks: Vec<_> = eligible
            .iter()
            .map(|i| indicator_task(Arc::clone(i), Arc::clone(&shared)))
            .collect();
        let outcome = pool.run_until(tasks, deadline);
        if outcome.timed_out {
            warn!(
                "engine: deadline reached with {}/{} indicators complete",
                outcome.completed.len(),
                eligible.len()
            );
        }

        let mut collected = Vec::with_capacity(outcome.completed.len());
        for (index, result) in outcome.completed {
            let indicator = &eligible[index];
            collected.push(Collected {
                name: indicator.name().to_string(),
                weight: indicator.weight(),
                result,
            });
            if let Some(reason) = self.early_stop(&collected) {
                return (collected, reason);
            }
        }
        let reason = if outcome.timed_out {
            StopReason::Timeout
        } else {
            StopReason::Completed
        };
        (collected, reason)
    }

    /// Stop rules, checked after each newly collected result.
    fn early_stop(&self, collected: &[Collected]) -> Option<StopReason> {
        let latest = collected.last()?;
        if latest.result.confidence() > self.config.single_indicator_threshold {
            info!(
                "engine: {} reported {:.3}, stopping",
                latest.name,
                latest.result.confidence()
            );
            return Some(StopReason::SingleIndicator {
                indicator: latest.name.clone(),
            });
        }
        if latest.result.is_success() && collected.len() >= 2 {
            let combined = weighted_average(collected);
            if combined > self.config.combined_threshold {
                info!("engine: combined confidence {combined:.3} after {}, stopping", latest.name);
                return Some(StopReason::CombinedConfidence);
            }
        }
        None
    }

    fn finish(
        &self,
        archive: &Archive,
        collected: Vec<Collected>,
        stop_reason: StopReason,
    ) -> DetectionResult {
        let threshold = self.config.thresholds.for_count(collected.len());
        if collected.is_empty() {
            return DetectionResult::empty(archive, threshold, stop_reason);
        }

        let confidence = aggregate(&collected);
        let mut result = DetectionResult {
            is_positive: confidence >= threshold,
            confidence,
            threshold,
            stop_reason,
            ..DetectionResult::empty(archive, threshold, StopReason::Completed)
        };
        extract_features(&collected, &mut result);
        result.indicator_results = collected.into_iter().map(|c| (c.name, c.result)).collect();
        result
    }
}

impl std::fmt::Debug for DetectionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectionEngine")
            .field("indicators", &self.indicator_names())
            .field("config", &self.config)
            .field("runtime", &self.runtime)
            .finish()
    }
}

fn check_applicable(indicator: &dyn Indicator, archive: &Archive) -> bool {
    match catch_unwind(AssertUnwindSafe(|| indicator.can_analyze(archive))) {
        Ok(applicable) => {
            if !applicable {
                debug!("engine: {} not applicable", indicator.name());
            }
            applicable
        }
        Err(payload) => {
            warn!(
                "engine: {} precondition failed: {}",
                indicator.name(),
                panic_message(payload.as_ref())
            );
            false
        }
    }
}

fn indicator_task(
    indicator: Arc<dyn Indicator>,
    archive: Arc<Archive>,
) -> impl FnOnce() -> IndicatorResult + Send + 'static {
    move || run_indicator(indicator.as_ref(), &archive)
}

/// Runs one indicator, converting a panic into an `Error` result.
fn run_indicator(indicator: &dyn Indicator, archive: &Archive) -> IndicatorResult {
    let started = Instant::now();
    let result = match catch_unwind(AssertUnwindSafe(|| indicator.analyze(archive))) {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            warn!("engine: indicator {} failed: {message}", indicator.name());
            IndicatorResult::error(message)
        }
    };
    let result = result.with_elapsed(started.elapsed());
    debug!(
        "engine: {} -> {:?} {:.3} in {:?}",
        indicator.name(),
        result.status(),
        result.confidence(),
        result.elapsed()
    );
    result
}

/// Weighted mean over `Success` results only; 0 when none succeeded.
fn weighted_average(collected: &[Collected]) -> f64 {
    let (sum, weights) = collected
        .iter()
        .filter(|c| c.result.is_success())
        .fold((0.0, 0.0), |(sum, weights), c| {
            (sum + c.weight * c.result.confidence(), weights + c.weight)
        });
    if weights > 0.0 { sum / weights } else { 0.0 }
}

fn aggregate(collected: &[Collected]) -> f64 {
    let mut score = weighted_average(collected);

    let successes = collected.iter().filter(|c| c.result.is_success()).count();
    if successes == collected.len() || successes == 0 {
        score *= UNANIMITY_FACTOR;
    }
    if has_contradiction(collected) {
        score *= CONTRADICTION_FACTOR;
    }
    let certain = collected
        .iter()
        .filter(|c| c.result.confidence() > CERTAINTY_LEVEL)
        .count();
    if certain >= 2 {
        score *= CERTAINTY_FACTOR;
    }

    clamp_confidence(score)
}

/// Hook for indicator pairs that can disagree; none of the current
/// indicators can, so it never fires.
fn has_contradiction(_collected: &[Collected]) -> bool {
    false
}

/// Merges `version`, `main_class` and `features` evidence from successful
/// results, in priority order. Does not touch the confidence.
fn extract_features(collected: &[Collected], result: &mut DetectionResult) {
    for c in collected.iter().filter(|c| c.result.is_success()) {
        let evidence = c.result.evidence();
        if result.version.is_none() {
            result.version = evidence
                .get("version")
                .and_then(|v| v.as_str())
                .map(str::to_string);
        }
        if result.main_class.is_none() {
            result.main_class = evidence
                .get("main_class")
                .and_then(|v| v.as_str())
                .map(str::to_string);
        }
        if let Some(features) = evidence.get("features").and_then(|v| v.as_array()) {
            result
                .features
                .extend(features.iter().filter_map(|f| f.as_str()).map(str::to_string));
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicator::IndicatorStatus;
    use crate::model::{ArchiveLocation, CompiledUnit, Manifest, UnitKind};
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;

    /// Scripted indicator; counts its calls.
    struct Scripted {
        name: &'static str,
        priority: i32,
        weight: f64,
        outcome: Outcome,
        calls: Arc<AtomicUsize>,
    }

    #[derive(Clone)]
    enum Outcome {
        Success(f64),
        NotFound,
        Panic,
        Sleep(Duration, f64),
        Evidence(f64, serde_json::Value),
    }

    impl Scripted {
        fn new(name: &'static str, priority: i32, outcome: Outcome) -> Self {
            Self {
                name,
                priority,
                weight: 1.0,
                outcome,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn weighted(mut self, weight: f64) -> Self {
            self.weight = weight;
            self
        }
    }

    impl Indicator for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        fn analyze(&self, _: &Archive) -> IndicatorResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.outcome {
                Outcome::Success(c) => IndicatorResult::success(*c),
                Outcome::NotFound => IndicatorResult::not_found(),
                Outcome::Panic => panic!("scripted failure in {}", self.name),
                Outcome::Sleep(d, c) => {
                    std::thread::sleep(*d);
                    IndicatorResult::success(*c)
                }
                Outcome::Evidence(c, ev) => ev
                    .as_object()
                    .into_iter()
                    .flatten()
                    .fold(IndicatorResult::success(*c), |r, (k, v)| {
                        r.with_evidence(k.clone(), v.clone())
                    }),
            }
        }

        fn weight(&self) -> f64 {
            self.weight
        }

        fn priority(&self) -> i32 {
            self.priority
        }
    }

    fn archive() -> Archive {
        Archive::new(
            ArchiveLocation::from_path(Path::new("app.jar")),
            vec![CompiledUnit::new("com.example.App", UnitKind::Class)],
            Manifest::default(),
        )
    }

    fn engine(indicators: Vec<Scripted>, config: EngineConfig) -> DetectionEngine {
        let mut registry = IndicatorRegistry::new();
        for i in indicators {
            registry.register(i);
        }
        DetectionEngine::new(&registry, config)
    }

    fn pooled() -> EngineConfig {
        EngineConfig {
            mode: ExecutionMode::Pooled,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn three_indicator_scenario_is_positive() {
        let e = engine(
            vec![
                Scripted::new("a", 1, Outcome::Success(0.9)),
                Scripted::new("b", 2, Outcome::Success(0.85)),
                Scripted::new("c", 3, Outcome::Success(0.3)),
            ],
            EngineConfig::default(),
        );
        let r = e.detect(&archive());

        // (0.9 + 0.85 + 0.3) / 3 * 1.1 * 1.05
        let expected = (2.05 / 3.0) * 1.1 * 1.05;
        assert_eq!(r.indicator_results.len(), 3);
        assert!((r.confidence - expected).abs() < 1e-9);
        assert_eq!(r.threshold, 0.55);
        assert!(r.is_positive);
        assert_eq!(r.stop_reason, StopReason::Completed);
    }

    #[test]
    fn single_indicator_uses_strictest_threshold() {
        let e = engine(
            vec![Scripted::new("only", 1, Outcome::Success(0.6))],
            EngineConfig::default(),
        );
        let r = e.detect(&archive());
        assert_eq!(r.threshold, 0.75);
        assert!((r.confidence - 0.66).abs() < 1e-9);
        assert!(!r.is_positive);
    }

    #[test]
    fn very_confident_indicator_stops_the_run() {
        let late = Scripted::new("late", 2, Outcome::Success(0.2));
        let late_calls = Arc::clone(&late.calls);
        let e = engine(
            vec![Scripted::new("sure", 1, Outcome::Success(0.97)), late],
            EngineConfig::default(),
        );
        let r = e.detect(&archive());
        assert_eq!(
            r.stop_reason,
            StopReason::SingleIndicator {
                indicator: "sure".into()
            }
        );
        assert_eq!(late_calls.load(Ordering::SeqCst), 0);
        assert_eq!(r.indicator_results.len(), 1);
        assert!(r.is_positive);
    }

    #[test]
    fn threshold_is_strictly_exceeded() {
        let e = engine(
            vec![
                Scripted::new("edge", 1, Outcome::Success(0.95)),
                Scripted::new("next", 2, Outcome::NotFound),
            ],
            EngineConfig::default(),
        );
        assert_eq!(e.detect(&archive()).indicator_results.len(), 2);
    }

    #[test]
    fn combined_confidence_stops_the_run() {
        let third = Scripted::new("third", 3, Outcome::Success(0.1));
        let third_calls = Arc::clone(&third.calls);
        let e = engine(
            vec![
                Scripted::new("first", 1, Outcome::Success(0.93)),
                Scripted::new("second", 2, Outcome::Success(0.92)),
                third,
            ],
            EngineConfig::default(),
        );
        let r = e.detect(&archive());
        assert_eq!(r.stop_reason, StopReason::CombinedConfidence);
        assert_eq!(third_calls.load(Ordering::SeqCst), 0);
        assert_eq!(r.threshold, 0.6);
        assert!(r.is_positive);
    }

    #[test]
    fn panicking_indicator_is_recorded_and_excluded() {
        let after = Scripted::new("after", 3, Outcome::Success(0.7)).weighted(2.0);
        let after_calls = Arc::clone(&after.calls);
        let e = engine(
            vec![
                Scripted::new("ok", 1, Outcome::Success(0.8)),
                Scripted::new("boom", 2, Outcome::Panic).weighted(5.0),
                after,
            ],
            EngineConfig::default(),
        );
        let r = e.detect(&archive());

        let failed = &r.indicator_results["boom"];
        assert_eq!(failed.status(), IndicatorStatus::Error);
        assert!(failed.error_message().unwrap().contains("scripted failure"));
        assert_eq!(after_calls.load(Ordering::SeqCst), 1);
        // (0.8 * 1 + 0.7 * 2) / 3; mixed outcomes get no bonus.
        assert!((r.confidence - 2.2 / 3.0).abs() < 1e-9);
        assert!(r.is_positive);
    }

    #[test]
    fn no_applicable_indicator_gives_empty_negative_result() {
        let e = engine(Vec::new(), EngineConfig::default());
        let r = e.detect(&archive());
        assert_eq!(r.confidence, 0.0);
        assert!(!r.is_positive);
        assert!(r.indicator_results.is_empty());
        assert!(r.features.is_empty());
    }

    #[test]
    fn all_not_found_stays_at_zero() {
        let e = engine(
            vec![
                Scripted::new("a", 1, Outcome::NotFound),
                Scripted::new("b", 2, Outcome::NotFound),
            ],
            EngineConfig::default(),
        );
        let r = e.detect(&archive());
        assert_eq!(r.confidence, 0.0);
        assert!(!r.is_positive);
        assert_eq!(r.indicator_results.len(), 2);
    }

    #[test]
    fn confidence_stays_within_bounds() {
        let levels = [0.0, 0.3, 0.81, 0.9, 0.95, 1.0];
        for &a in &levels {
            for &b in &levels {
                for &c in &levels {
                    let e = engine(
                        vec![
                            Scripted::new("a", 1, Outcome::Success(a)),
                            Scripted::new("b", 2, Outcome::Success(b)).weighted(0.5),
                            Scripted::new("c", 3, Outcome::Success(c)).weighted(2.0),
                        ],
                        EngineConfig::default(),
                    );
                    let r = e.detect(&archive());
                    assert!((0.0..=1.0).contains(&r.confidence), "{a} {b} {c}: {}", r.confidence);
                }
            }
        }
    }

    #[test]
    fn repeated_runs_agree() {
        let e = engine(
            vec![
                Scripted::new("a", 1, Outcome::Success(0.7)),
                Scripted::new("b", 2, Outcome::NotFound),
                Scripted::new("c", 3, Outcome::Success(0.85)),
            ],
            EngineConfig::default(),
        );
        let first = e.detect(&archive());
        let second = e.detect(&archive());
        assert_eq!(first.confidence, second.confidence);
        assert_eq!(first.is_positive, second.is_positive);
        assert_eq!(first.stop_reason, second.stop_reason);
        assert_eq!(
            first.indicator_results.keys().collect::<Vec<_>>(),
            second.indicator_results.keys().collect::<Vec<_>>()
        );
    }

    #[test]
    fn pooled_mode_selects_the_same_results() {
        let scripts = || {
            vec![
                Scripted::new("a", 1, Outcome::Success(0.93)),
                Scripted::new("b", 2, Outcome::Success(0.92)),
                Scripted::new("c", 3, Outcome::Success(0.1)),
            ]
        };
        let sequential = engine(scripts(), EngineConfig::default()).detect(&archive());
        let concurrent = engine(scripts(), pooled()).detect(&archive());

        assert_eq!(concurrent.stop_reason, StopReason::CombinedConfidence);
        assert_eq!(sequential.confidence, concurrent.confidence);
        assert_eq!(sequential.is_positive, concurrent.is_positive);
        assert_eq!(
            sequential.indicator_results.keys().collect::<Vec<_>>(),
            concurrent.indicator_results.keys().collect::<Vec<_>>()
        );
    }

    #[test]
    fn deadline_yields_partial_result() {
        for config in [EngineConfig::default(), pooled()] {
            let config = EngineConfig {
                timeout_ms: 100,
                ..config
            };
            let e = engine(
                vec![
                    Scripted::new("fast", 1, Outcome::Success(0.8)),
                    Scripted::new("slow", 2, Outcome::Sleep(Duration::from_millis(600), 0.9)),
                ],
                config,
            );
            let started = Instant::now();
            let r = e.detect(&archive());
            assert!(started.elapsed() < Duration::from_millis(500));
            assert_eq!(r.stop_reason, StopReason::Timeout);
            assert_eq!(r.indicator_results.keys().collect::<Vec<_>>(), vec!["fast"]);
            assert!(r.is_positive);
            assert_eq!(e.stats().timeouts, 1);
        }
    }

    #[test]
    fn features_come_from_successful_results_only() {
        let e = engine(
            vec![
                Scripted::new(
                    "manifest",
                    1,
                    Outcome::Evidence(
                        0.6,
                        serde_json::json!({"version": "3.2.1", "features": ["fat-jar"]}),
                    ),
                ),
                Scripted::new(
                    "marker",
                    2,
                    Outcome::Evidence(
                        0.7,
                        serde_json::json!({"version": "9.9", "main_class": "com.example.App",
                                           "features": ["scheduling", "fat-jar"]}),
                    ),
                ),
            ],
            EngineConfig::default(),
        );
        let r = e.detect(&archive());
        assert_eq!(r.version.as_deref(), Some("3.2.1"));
        assert_eq!(r.main_class.as_deref(), Some("com.example.App"));
        assert_eq!(
            r.features.iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["fat-jar", "scheduling"]
        );
        // 0.65 * 1.1
        assert!((r.confidence - 0.715).abs() < 1e-9);
    }

    #[test]
    fn stats_accumulate_across_runs() {
        let e = engine(
            vec![Scripted::new("a", 1, Outcome::Success(0.9))],
            EngineConfig::default(),
        );
        e.detect(&archive());
        e.detect(&archive());
        let empty = Archive::new(
            ArchiveLocation::from_path(Path::new("empty.jar")),
            Vec::new(),
            Manifest::default(),
        );
        assert!(!e.detect(&empty).is_positive);

        let stats = e.stats();
        assert_eq!(stats.analyses, 3);
        assert!((stats.success_ratio - 2.0 / 3.0).abs() < 1e-9);
        assert!(stats.total_elapsed_ms >= stats.average_elapsed_ms);
        let pool = stats.pool.expect("pool");
        assert_eq!(pool.submitted, 2);
        assert_eq!(pool.completed, 2);
    }

    #[test]
    fn engines_sharing_a_runtime_share_stats() {
        let runtime = Arc::new(EngineRuntime::new(2));
        for confidence in [0.9, 0.2] {
            let mut registry = IndicatorRegistry::new();
            registry.register(Scripted::new("a", 1, Outcome::Success(confidence)));
            let e = DetectionEngine::with_runtime(
                &registry,
                EngineConfig::default(),
                Arc::clone(&runtime),
            );
            e.detect(&archive());
        }

        let stats = runtime.stats();
        assert_eq!(stats.analyses, 2);
        assert!((stats.success_ratio - 0.5).abs() < 1e-9);
    }

    #[test]
    fn archive_without_units_runs_no_indicator() {
        let cache = Arc::new(crate::cache::UnitCache::with_capacity(8));
        let registry =
            crate::indicators::default_registry(&crate::config::ScannerConfig::default(), cache);
        let e = DetectionEngine::new(&registry, EngineConfig::default());
        let manifest = Manifest::parse(
            "Manifest-Version: 1.0\nSpring-Boot-Version: 3.2.1\nStart-Class: a.App\nSpring-Boot-Lib: BOOT-INF/lib/\n",
        );
        let empty = Archive::new(
            ArchiveLocation::from_path(Path::new("hollow.jar")),
            Vec::new(),
            manifest,
        );

        let r = e.detect(&empty);
        assert_eq!(r.confidence, 0.0);
        assert!(!r.is_positive);
        assert!(r.indicator_results.is_empty());
        assert!(r.features.is_empty());
        assert_eq!(r.version, None);
        assert_eq!(r.stop_reason, StopReason::Completed);
    }

    /// Panics outside `analyze`, where the per-indicator guard does not reach.
    struct Unweighable;

    impl Indicator for Unweighable {
        fn name(&self) -> &str {
            "unweighable"
        }

        fn analyze(&self, _: &Archive) -> IndicatorResult {
            IndicatorResult::success(0.9)
        }

        fn weight(&self) -> f64 {
            panic!("weight lookup failed")
        }

        fn priority(&self) -> i32 {
            1
        }
    }

    #[test]
    fn engine_failure_yields_zero_confidence_result() {
        for config in [EngineConfig::default(), pooled()] {
            let mut registry = IndicatorRegistry::new();
            registry.register(Unweighable);
            let e = DetectionEngine::new(&registry, config);

            let r = e.detect(&archive());
            assert_eq!(r.confidence, 0.0);
            assert!(!r.is_positive);
            assert!(r.indicator_results.is_empty());
            match &r.stop_reason {
                StopReason::EngineFailure { message } => {
                    assert!(message.contains("weight lookup failed"))
                }
                other => panic!("unexpected stop reason: {other:?}"),
            }
            assert_eq!(e.stats().analyses, 1);
        }
    }
}
