use anyhow::{Context, Result};
use boot_finder::archive::{LoadOptions, load_archive};
use boot_finder::cache::{CacheStats, UnitCache};
use boot_finder::cli::{Cli, Commands, OutputFormat};
use boot_finder::config::Settings;
use boot_finder::engine::{
    DetectionEngine, DetectionResult, EnginePerformanceStats, EngineRuntime, StopReason,
};
use boot_finder::indicators::default_registry;
use boot_finder::scan::scan_archives;
use clap::Parser;
use log::{debug, info, warn};
use rayon::prelude::*;
use serde::Serialize;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let settings = Settings::load(cli.config.as_deref())?;
    debug!("settings: {settings:?}");
    let runtime = Arc::new(EngineRuntime::new(settings.engine.max_workers));

    match cli.command.clone() {
        Commands::Detect {
            jar_path,
            deep,
            format,
        } => {
            let mut output = analyze_archive(&settings, &runtime, &cli.search_paths, &jar_path, deep)?;
            output.engine = Some(runtime.stats());
            write_output(&output, format, render_detect_text)?;
        }
        Commands::Scan { path, deep, format } => {
            let output = scan_directory(&settings, &runtime, &cli.search_paths, &path, deep)?;
            write_output(&output, format, render_scan_text)?;
        }
    }

    Ok(())
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

#[derive(Debug, Serialize)]
struct DetectOutput {
    jar_path: String,
    classes_loaded: usize,
    duration_ms: u64,
    result: DetectionResult,
    cache: CacheStats,
    /// Process-wide engine counters; only set for a single-archive run.
    #[serde(skip_serializing_if = "Option::is_none")]
    engine: Option<EnginePerformanceStats>,
}

#[derive(Debug, Serialize)]
struct ScanFailure {
    jar_path: String,
    error: String,
}

#[derive(Debug, Serialize)]
struct ScanOutput {
    scanned_root: String,
    archives: usize,
    positives: usize,
    duration_ms: u64,
    results: Vec<DetectOutput>,
    failures: Vec<ScanFailure>,
    engine: EnginePerformanceStats,
}

/// One analysis session: the cache and indicators live only for this
/// archive, and every cached handle is released before returning. The
/// engine runtime is shared by every session in the process.
fn analyze_archive(
    settings: &Settings,
    runtime: &Arc<EngineRuntime>,
    extra_search_paths: &[PathBuf],
    jar_path: &Path,
    deep: bool,
) -> Result<DetectOutput> {
    let start = Instant::now();
    let archive = load_archive(jar_path, LoadOptions { deep })
        .with_context(|| format!("Failed to load archive: {}", jar_path.display()))?;

    let cache = Arc::new(UnitCache::new(&settings.cache));
    cache.add_search_path(jar_path);
    for p in extra_search_paths {
        cache.add_search_path(p);
    }

    let registry = default_registry(&settings.scanner, Arc::clone(&cache));
    let engine = DetectionEngine::with_runtime(&registry, settings.engine.clone(), Arc::clone(runtime));
    let result = engine.detect(&archive);
    let cache_stats = cache.stats();
    let cleared = cache.clear();
    if cleared.failed > 0 {
        warn!(
            "{}: {} cached handles failed to release",
            jar_path.display(),
            cleared.failed
        );
    }
    info!(
        "{}: positive={} confidence={:.3}",
        jar_path.display(),
        result.is_positive,
        result.confidence
    );

    Ok(DetectOutput {
        jar_path: jar_path.to_string_lossy().to_string(),
        classes_loaded: archive.units.len(),
        duration_ms: start.elapsed().as_millis() as u64,
        result,
        cache: cache_stats,
        engine: None,
    })
}

fn scan_directory(
    settings: &Settings,
    runtime: &Arc<EngineRuntime>,
    extra_search_paths: &[PathBuf],
    root: &Path,
    deep: bool,
) -> Result<ScanOutput> {
    let start = Instant::now();
    let jars = scan_archives(root)?;
    info!("{}: {} archives found", root.display(), jars.len());

    let outcomes: Vec<(PathBuf, Result<DetectOutput>)> = jars
        .par_iter()
        .map(|jar| {
            (
                jar.clone(),
                analyze_archive(settings, runtime, extra_search_paths, jar, deep),
            )
        })
        .collect();

    let mut results = Vec::new();
    let mut failures = Vec::new();
    for (jar, outcome) in outcomes {
        match outcome {
            Ok(output) => results.push(output),
            Err(e) => {
                warn!("{e:#}");
                failures.push(ScanFailure {
                    jar_path: jar.to_string_lossy().to_string(),
                    error: format!("{e:#}"),
                });
            }
        }
    }

    Ok(ScanOutput {
        scanned_root: root.to_string_lossy().to_string(),
        archives: jars.len(),
        positives: results.iter().filter(|r| r.result.is_positive).count(),
        duration_ms: start.elapsed().as_millis() as u64,
        results,
        failures,
        engine: runtime.stats(),
    })
}

fn write_output<T: Serialize>(value: &T, format: OutputFormat, text: fn(&T) -> String) -> Result<()> {
    let content = match format {
        OutputFormat::Json => serde_json::to_string_pretty(value)?,
        OutputFormat::Text => text(value),
    };
    print!("{content}");
    if !content.ends_with('\n') {
        println!();
    }
    Ok(())
}

fn render_detect_text(output: &DetectOutput) -> String {
    let r = &output.result;
    let mut out = String::new();
    let _ = writeln!(out, "archive: {}", output.jar_path);
    let _ = writeln!(
        out,
        "spring_boot: {} (confidence {:.3}, threshold {:.2})",
        r.is_positive, r.confidence, r.threshold
    );
    if let Some(version) = &r.version {
        let _ = writeln!(out, "version: {version}");
    }
    if let Some(main_class) = &r.main_class {
        let _ = writeln!(out, "main_class: {main_class}");
    }
    if !r.features.is_empty() {
        let features: Vec<&str> = r.features.iter().map(String::as_str).collect();
        let _ = writeln!(out, "features: {}", features.join(", "));
    }
    let _ = writeln!(out, "stop: {}", stop_label(&r.stop_reason));
    for (name, ind) in &r.indicator_results {
        let _ = write!(
            out,
            "- {name}: {:?} {:.3} ({:.1} ms)",
            ind.status(),
            ind.confidence(),
            ind.elapsed().as_secs_f64() * 1000.0
        );
        if let Some(err) = ind.error_message() {
            let _ = write!(out, " error: {err}");
        }
        out.push('\n');
    }
    let _ = writeln!(
        out,
        "cache: {} hits, {} misses, {} resident",
        output.cache.hits, output.cache.misses, output.cache.size
    );
    if let Some(engine) = &output.engine {
        render_engine_text(&mut out, engine);
    }
    let _ = writeln!(out, "duration_ms: {}", output.duration_ms);
    out
}

fn render_engine_text(out: &mut String, stats: &EnginePerformanceStats) {
    let _ = writeln!(
        out,
        "engine: {} analyses, {:.1} ms avg, {} early, {} timed out",
        stats.analyses, stats.average_elapsed_ms, stats.early_terminations, stats.timeouts
    );
}

fn render_scan_text(output: &ScanOutput) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "scanned_root: {}", output.scanned_root);
    let _ = writeln!(
        out,
        "archives: {}, spring_boot: {}, failed: {}",
        output.archives,
        output.positives,
        output.failures.len()
    );
    for r in &output.results {
        let _ = writeln!(
            out,
            "- {}: {} ({:.3}){}",
            r.jar_path,
            r.result.is_positive,
            r.result.confidence,
            r.result
                .version
                .as_deref()
                .map(|v| format!(" version {v}"))
                .unwrap_or_default()
        );
    }
    for f in &output.failures {
        let _ = writeln!(out, "! {}: {}", f.jar_path, f.error);
    }
    render_engine_text(&mut out, &output.engine);
    let _ = writeln!(out, "duration_ms: {}", output.duration_ms);
    out
}

fn stop_label(reason: &StopReason) -> String {
    match reason {
        StopReason::Completed => "completed".to_string(),
        StopReason::SingleIndicator { indicator } => format!("early ({indicator} conclusive)"),
        StopReason::CombinedConfidence => "early (combined confidence)".to_string(),
        StopReason::Timeout => "timeout".to_string(),
        StopReason::EngineFailure { message } => format!("engine failure: {message}"),
    }
}
