use log::debug;
use std::collections::BTreeSet;

use crate::indicator::{Indicator, IndicatorResult};
use crate::model::{Archive, CompiledUnit};

pub const SPRING_BOOT_APPLICATION: &str =
    "org.springframework.boot.autoconfigure.SpringBootApplication";
pub const SPRING_BOOT_CONFIGURATION: &str = "org.springframework.boot.SpringBootConfiguration";
pub const ENABLE_AUTO_CONFIGURATION: &str =
    "org.springframework.boot.autoconfigure.EnableAutoConfiguration";

/// Boot markers, strongest first.
const MARKERS: [(&str, f64); 3] = [
    (SPRING_BOOT_APPLICATION, 0.95),
    (SPRING_BOOT_CONFIGURATION, 0.85),
    (ENABLE_AUTO_CONFIGURATION, 0.85),
];

const FEATURE_TAGS: [(&str, &str); 9] = [
    (ENABLE_AUTO_CONFIGURATION, "auto-configuration"),
    ("org.springframework.context.annotation.ComponentScan", "component-scan"),
    ("org.springframework.scheduling.annotation.EnableScheduling", "scheduling"),
    ("org.springframework.scheduling.annotation.EnableAsync", "async"),
    ("org.springframework.cache.annotation.EnableCaching", "caching"),
    ("org.springframework.web.servlet.config.annotation.EnableWebMvc", "web-mvc"),
    ("org.springframework.web.bind.annotation.RestController", "rest-controller"),
    (
        "org.springframework.transaction.annotation.EnableTransactionManagement",
        "transactions",
    ),
    (
        "org.springframework.boot.context.properties.EnableConfigurationProperties",
        "configuration-properties",
    ),
];

/// Matches Spring Boot's declarative class-level markers.
#[derive(Debug, Default, Clone, Copy)]
pub struct MarkerIndicator;

impl MarkerIndicator {
    pub const NAME: &'static str = "marker";

    fn strongest_marker(unit: &CompiledUnit) -> Option<f64> {
        MARKERS
            .iter()
            .find(|(tag, _)| unit.has_tag(tag))
            .map(|(_, score)| *score)
    }
}

impl Indicator for MarkerIndicator {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn weight(&self) -> f64 {
        1.0
    }

    fn priority(&self) -> i32 {
        20
    }

    fn can_analyze(&self, archive: &Archive) -> bool {
        archive.units.iter().any(|u| !u.tags.is_empty())
    }

    fn analyze(&self, archive: &Archive) -> IndicatorResult {
        let mut best: Option<(f64, &CompiledUnit)> = None;
        let mut marked: Vec<&str> = Vec::new();
        let mut features: BTreeSet<&str> = BTreeSet::new();
        let mut scan_packages: Vec<String> = Vec::new();

        for unit in archive.units.iter().map(|u| &**u) {
            for (tag, feature) in FEATURE_TAGS {
                if unit.has_tag(tag) {
                    features.insert(feature);
                }
            }

            let Some(score) = Self::strongest_marker(unit) else {
                continue;
            };
            marked.push(&unit.name);
            if best.is_none_or(|(s, _)| score > s) {
                best = Some((score, unit));
            }

            if let Some(app) = unit.tag(SPRING_BOOT_APPLICATION) {
                // The composed annotation implies both.
                features.insert("auto-configuration");
                features.insert("component-scan");
                if let Some(packages) = app.get("scanBasePackages") {
                    scan_packages.extend(packages.as_str_list().into_iter().map(str::to_string));
                }
            }
        }

        let Some((confidence, main)) = best else {
            debug!("{}: no Spring Boot markers", archive.location.display_name);
            return IndicatorResult::not_found();
        };

        let mut result = IndicatorResult::success(confidence)
            .with_evidence("main_class", main.name.as_str())
            .with_evidence("marked_units", marked)
            .with_evidence("features", features.into_iter().collect::<Vec<_>>());
        if !scan_packages.is_empty() {
            result = result.with_evidence("scan_base_packages", scan_packages);
        }
        result
    }
}
