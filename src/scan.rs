use anyhow::Result;
use ignore::WalkBuilder;
use std::path::{Path, PathBuf};
use std::sync::mpsc;

/// Directory prefixes under which an archive may keep its own classes.
/// The empty prefix is the plain JAR layout.
pub const CLASS_ROOTS: [&str; 3] = ["", "BOOT-INF/classes/", "WEB-INF/classes/"];

const ARCHIVE_EXTENSIONS: [&str; 2] = ["jar", "war"];

/// Finds every `.jar`/`.war` under `base_path`, sorted for stable output.
pub fn scan_archives(base_path: &Path) -> Result<Vec<PathBuf>> {
    let (tx, rx) = mpsc::channel();

    let walker = WalkBuilder::new(base_path)
        .hidden(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .build_parallel();

    walker.run(|| {
        let tx = tx.clone();
        Box::new(move |entry| {
            if let Ok(entry) = entry {
                let path = entry.path();
                if path
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| ARCHIVE_EXTENSIONS.contains(&e))
                {
                    let _ = tx.send(path.to_path_buf());
                }
            }
            ignore::WalkState::Continue
        })
    });

    drop(tx);
    let mut found: Vec<PathBuf> = rx.iter().collect();
    found.sort();
    Ok(found)
}

pub fn class_name_to_class_path(class_name: &str) -> String {
    format!("{}.class", class_name.replace('.', "/"))
}

/// Entry names to try, in order, when resolving `class_name` in an archive.
pub fn class_entry_candidates(class_name: &str) -> Vec<String> {
    let path = class_name_to_class_path(class_name);
    CLASS_ROOTS.iter().map(|root| format!("{root}{path}")).collect()
}

/// Maps an archive entry to the dotted class name it defines, if it is an
/// application class (not a nested library, module or package descriptor).
pub fn entry_class_name(entry: &str) -> Option<String> {
    let stem = entry.strip_suffix(".class")?;
    let stem = CLASS_ROOTS
        .iter()
        .filter(|root| !root.is_empty())
        .find_map(|root| stem.strip_prefix(root))
        .unwrap_or(stem);

    if stem.starts_with("META-INF/") || stem.starts_with("BOOT-INF/") || stem.starts_with("WEB-INF/")
    {
        return None;
    }
    if stem.ends_with("module-info") || stem.ends_with("package-info") {
        return None;
    }
    Some(stem.replace(['/', '\\'], "."))
}
