use std::collections::BTreeSet;
use std::path::Path;
use std::{fs, io};

use tracing::{info, warn};

/// Scan a directory of key files and collect every credential string.
///
/// Files may hold keys separated by any mix of whitespace and commas; after a
/// scan each file is rewritten one key per line when normalization changed its
/// contents. Unreadable entries are skipped with a warning so one bad file
/// cannot block the sync pass.
pub fn load_from_dir(dir: &Path) -> io::Result<BTreeSet<String>> {
    if !dir.exists() {
        info!(path = %dir.display(), "keys directory not found; skipping load");
        return Ok(BTreeSet::new());
    }

    let mut all_keys = BTreeSet::new();
    for entry in fs::read_dir(dir)? {
        let path = match entry {
            Ok(e) => e.path(),
            Err(e) => {
                warn!(error = %e, "failed to read keys dir entry");
                continue;
            }
        };
        if !path.is_file() {
            continue;
        }

        let Some(contents) = read_file(&path) else {
            continue;
        };
        let keys = split_keys(&contents);
        if keys.is_empty() {
            continue;
        }

        let normalized = keys.join("\n");
        if normalized != contents {
            if let Err(e) = fs::write(&path, &normalized) {
                warn!(path = %path.display(), error = %e, "failed to normalize key file");
            }
        }

        all_keys.extend(keys);
    }
    Ok(all_keys)
}

fn split_keys(contents: &str) -> Vec<String> {
    contents
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn read_file(path: &Path) -> Option<String> {
    match fs::read_to_string(path) {
        Ok(contents) => Some(contents),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read key file");
            None
        }
    }
}
