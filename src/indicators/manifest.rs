use log::debug;

use crate::indicator::{Indicator, IndicatorResult};
use crate::model::{Archive, Manifest};

pub const LAUNCHER_PREFIX: &str = "org.springframework.boot.loader.";

/// (manifest key, confidence when present)
const SIGNALS: [(&str, f64); 4] = [
    ("Spring-Boot-Version", 0.9),
    ("Start-Class", 0.7),
    ("Spring-Boot-Classes", 0.6),
    ("Spring-Boot-Lib", 0.6),
];
const LAUNCHER_CONFIDENCE: f64 = 0.8;
const CORROBORATION_BONUS: f64 = 0.05;
/// Upper bound for manifest-only evidence.
const MAX_CONFIDENCE: f64 = 0.95;

/// Plain key lookups in `META-INF/MANIFEST.MF`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ManifestIndicator;

impl ManifestIndicator {
    pub const NAME: &'static str = "manifest";

    fn launcher(manifest: &Manifest) -> Option<&str> {
        manifest
            .get("Main-Class")
            .filter(|m| m.starts_with(LAUNCHER_PREFIX))
    }
}

impl Indicator for ManifestIndicator {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn weight(&self) -> f64 {
        0.8
    }

    fn priority(&self) -> i32 {
        10
    }

    fn can_analyze(&self, archive: &Archive) -> bool {
        !archive.manifest.is_empty()
    }

    fn analyze(&self, archive: &Archive) -> IndicatorResult {
        let manifest = &archive.manifest;
        let mut matched: Vec<&str> = Vec::new();
        let mut confidence: f64 = 0.0;

        for (key, score) in SIGNALS {
            if manifest.get(key).is_some_and(|v| !v.trim().is_empty()) {
                matched.push(key);
                confidence = confidence.max(score);
            }
        }
        let launcher = Self::launcher(manifest);
        if launcher.is_some() {
            matched.push("Main-Class");
            confidence = confidence.max(LAUNCHER_CONFIDENCE);
        }

        if matched.is_empty() {
            debug!("{}: no Spring Boot manifest keys", archive.location.display_name);
            return IndicatorResult::not_found();
        }
        if matched.len() >= 3 {
            confidence = (confidence + CORROBORATION_BONUS).min(MAX_CONFIDENCE);
        }

        let mut features: Vec<String> = Vec::new();
        if launcher.is_some() {
            features.push("executable-archive".to_string());
        }
        if let Some(lib) = manifest.get("Spring-Boot-Lib") {
            features.push(if lib.starts_with("WEB-INF/") {
                "war-packaging".to_string()
            } else {
                "fat-jar".to_string()
            });
        }

        let mut result = IndicatorResult::success(confidence)
            .with_evidence("matched_keys", matched)
            .with_evidence("features", features);
        if let Some(version) = manifest.get("Spring-Boot-Version") {
            result = result.with_evidence("version", version);
        }
        if let Some(start) = manifest.get("Start-Class") {
            result = result.with_evidence("main_class", start);
        }
        if let Some(launcher) = launcher {
            result = result.with_evidence("launcher", launcher);
        }
        result
    }
}
