use log::{debug, info};
use serde_json::Value;
use std::sync::Arc;

use crate::cache::UnitCache;
use crate::config::ScannerConfig;
use crate::indicator::{Indicator, IndicatorResult};
use crate::model::Archive;
use crate::scanner::{InstructionScanner, MethodScan};

const CALL_CONFIDENCE: f64 = 0.9;
const RESOLVED_ARGUMENT_CONFIDENCE: f64 = 0.95;

/// Finds entry-point methods that hand control to the framework's launcher
/// call, e.g. `SpringApplication.run(App.class, args)`.
pub struct EntryPointIndicator {
    scanner: InstructionScanner,
    cache: Arc<UnitCache>,
}

impl EntryPointIndicator {
    pub const NAME: &'static str = "entry_point";

    pub fn new(config: &ScannerConfig, cache: Arc<UnitCache>) -> Self {
        Self {
            scanner: InstructionScanner::new(config),
            cache,
        }
    }
}

impl Indicator for EntryPointIndicator {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn weight(&self) -> f64 {
        0.9
    }

    fn priority(&self) -> i32 {
        30
    }

    fn can_analyze(&self, archive: &Archive) -> bool {
        !archive.is_empty()
    }

    fn analyze(&self, archive: &Archive) -> IndicatorResult {
        let scan = self.scanner.scan_archive(archive, &self.cache);
        let scan_errors: Vec<String> = scan.errors.iter().map(ToString::to_string).collect();
        let matches: Vec<&MethodScan> = scan.matches().collect();

        let Some(first) = matches.first() else {
            if scan.methods.is_empty() && !scan.errors.is_empty() {
                return IndicatorResult::error(format!(
                    "no unit could be scanned ({} failed)",
                    scan.errors.len()
                ))
                .with_evidence("scan_errors", scan_errors);
            }
            debug!(
                "{}: no call to {} in {} candidate methods",
                archive.location.display_name,
                self.scanner.target(),
                scan.methods.len()
            );
            return IndicatorResult::not_found()
                .with_evidence("candidate_methods", scan.methods.len())
                .with_evidence("scan_errors", scan_errors);
        };

        let mut arguments: Vec<String> = Vec::new();
        for call in matches.iter().flat_map(|m| &m.calls) {
            for arg in &call.arguments {
                if !arguments.contains(arg) {
                    arguments.push(arg.clone());
                }
            }
        }
        let resolved = arguments.iter().find(|a| archive.unit(a).is_some());
        let confidence = if resolved.is_some() {
            RESOLVED_ARGUMENT_CONFIDENCE
        } else {
            CALL_CONFIDENCE
        };
        let main_class = resolved.cloned().unwrap_or_else(|| first.unit.clone());
        info!(
            "{}: {} calls {} at op {:?}",
            archive.location.display_name,
            first.unit,
            self.scanner.target(),
            first.call_location
        );

        let descriptor = first
            .calls
            .first()
            .map(|c| c.descriptor.clone())
            .unwrap_or_default();
        IndicatorResult::success(confidence)
            .with_evidence("has_call", true)
            .with_evidence("call_location", first.call_location)
            .with_evidence("method_descriptor", descriptor)
            .with_evidence("entry_method", format!("{}.{}", first.unit, first.method))
            .with_evidence("calls", serde_json::to_value(&matches).unwrap_or(Value::Null))
            .with_evidence("candidate_arguments", arguments.clone())
            .with_evidence("main_class", main_class)
            .with_evidence("scan_errors", scan_errors)
    }
}
