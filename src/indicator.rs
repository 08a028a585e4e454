use serde::{Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::model::Archive;

pub type Evidence = BTreeMap<String, Value>;

/// One pluggable evidence collector.
///
/// `analyze` reports "nothing found" as [`IndicatorStatus::NotFound`] and
/// converts its own failures into [`IndicatorStatus::Error`]; the engine
/// additionally contains panics. Implementations keep no state between
/// calls beyond what they own privately.
pub trait Indicator: Send + Sync {
    /// Stable identity; results are keyed by it.
    fn name(&self) -> &str;

    fn analyze(&self, archive: &Archive) -> IndicatorResult;

    /// Reliability weight used in aggregation.
    fn weight(&self) -> f64;

    /// Lower runs earlier.
    fn priority(&self) -> i32;

    /// Cheap precondition checked before `analyze`.
    fn can_analyze(&self, archive: &Archive) -> bool {
        let _ = archive;
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorStatus {
    Success,
    NotFound,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndicatorResult {
    confidence: f64,
    status: IndicatorStatus,
    evidence: Evidence,
    #[serde(rename = "elapsed_ms", serialize_with = "duration_ms")]
    elapsed: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl IndicatorResult {
    pub fn success(confidence: f64) -> Self {
        Self::build(IndicatorStatus::Success, confidence, None)
    }

    pub fn not_found() -> Self {
        Self::build(IndicatorStatus::NotFound, 0.0, None)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::build(IndicatorStatus::Error, 0.0, Some(message.into()))
    }

    fn build(status: IndicatorStatus, confidence: f64, error: Option<String>) -> Self {
        Self {
            confidence: clamp_confidence(confidence),
            status,
            evidence: Evidence::new(),
            elapsed: Duration::ZERO,
            error,
        }
    }

    pub fn with_evidence(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.evidence.insert(key.into(), value.into());
        self
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = elapsed;
        self
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn status(&self) -> IndicatorStatus {
        self.status
    }

    pub fn is_success(&self) -> bool {
        self.status == IndicatorStatus::Success
    }

    pub fn evidence(&self) -> &Evidence {
        &self.evidence
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

/// Clamps into [0, 1]; NaN becomes 0.
pub fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) }
}

fn duration_ms<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_micros() as f64 / 1000.0)
}

/// Explicit, priority-ordered set of indicators.
#[derive(Clone, Default)]
pub struct IndicatorRegistry {
    indicators: Vec<Arc<dyn Indicator>>,
}

impl IndicatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, indicator: impl Indicator + 'static) -> &mut Self {
        self.register_shared(Arc::new(indicator))
    }

    /// Registering a name twice replaces the earlier indicator.
    pub fn register_shared(&mut self, indicator: Arc<dyn Indicator>) -> &mut Self {
        self.indicators.retain(|i| i.name() != indicator.name());
        self.indicators.push(indicator);
        self
    }

    /// Ascending priority; ties keep registration order.
    pub fn ordered(&self) -> Vec<Arc<dyn Indicator>> {
        let mut out = self.indicators.clone();
        out.sort_by_key(|i| i.priority());
        out
    }

    pub fn names(&self) -> Vec<String> {
        self.ordered().iter().map(|i| i.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.indicators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indicators.is_empty()
    }
}

impl std::fmt::Debug for IndicatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ArchiveLocation, Manifest};
    use std::path::Path;

    struct Fixed(&'static str, i32);

    impl Indicator for Fixed {
        fn name(&self) -> &str {
            self.0
        }
        fn analyze(&self, _: &Archive) -> IndicatorResult {
            IndicatorResult::success(0.5)
        }
        fn weight(&self) -> f64 {
            1.0
        }
        fn priority(&self) -> i32 {
            self.1
        }
    }

    #[test]
    fn confidence_is_clamped() {
        assert_eq!(IndicatorResult::success(1.7).confidence(), 1.0);
        assert_eq!(IndicatorResult::success(-0.2).confidence(), 0.0);
        assert_eq!(IndicatorResult::success(f64::NAN).confidence(), 0.0);
        assert_eq!(IndicatorResult::not_found().confidence(), 0.0);
    }

    #[test]
    fn error_result_carries_message_and_serializes() {
        let r = IndicatorResult::error("boom")
            .with_evidence("unit", "a.B")
            .with_elapsed(Duration::from_millis(3));
        assert_eq!(r.status(), IndicatorStatus::Error);
        assert_eq!(r.error_message(), Some("boom"));

        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["evidence"]["unit"], "a.B");
        assert_eq!(json["elapsed_ms"], 3.0);
        assert!(serde_json::to_value(IndicatorResult::not_found()).unwrap()["error"].is_null());
    }

    #[test]
    fn registry_orders_by_priority_and_keeps_ties_stable() {
        let mut registry = IndicatorRegistry::new();
        registry
            .register(Fixed("late", 30))
            .register(Fixed("tie-a", 10))
            .register(Fixed("tie-b", 10))
            .register(Fixed("early", -5));
        assert_eq!(registry.names(), vec!["early", "tie-a", "tie-b", "late"]);
    }

    #[test]
    fn registering_same_name_replaces() {
        let mut registry = IndicatorRegistry::new();
        registry.register(Fixed("x", 5)).register(Fixed("x", 1));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.ordered()[0].priority(), 1);
    }

    #[test]
    fn can_analyze_defaults_to_true() {
        let archive = Archive::new(
            ArchiveLocation::from_path(Path::new("empty.jar")),
            Vec::new(),
            Manifest::default(),
        );
        assert!(Fixed("x", 0).can_analyze(&archive));
    }
}
