//! Spring Boot indicators, registered in priority order by [`default_registry`].

pub mod entry_point;
pub mod manifest;
pub mod marker;

use std::sync::Arc;

use crate::cache::UnitCache;
use crate::config::ScannerConfig;
use crate::indicator::IndicatorRegistry;

pub use entry_point::EntryPointIndicator;
pub use manifest::ManifestIndicator;
pub use marker::MarkerIndicator;

pub fn default_registry(scanner: &ScannerConfig, cache: Arc<UnitCache>) -> IndicatorRegistry {
    let mut registry = IndicatorRegistry::new();
    registry
        .register(ManifestIndicator)
        .register(MarkerIndicator)
        .register(EntryPointIndicator::new(scanner, cache));
    registry
}
