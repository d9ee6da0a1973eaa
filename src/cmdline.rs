//! Merges baseline and per-test command-line option lists.
//!
//! The server refuses unknown config keys, so per-test command-line overlays
//! must be merged by name rather than appended; see [`merge_cmdline_options`].

/// Sentinel meaning "delete this flag from the merged result".
pub const REMOVE: &str = "__remove__";
/// Sentinel meaning "keep this flag but unset its value".
pub const MISSING: &str = "__missing__";

/// Baseline command-line flags passed to every server, before any per-test overlay.
pub const BASELINE_CMDLINE: &[&str] = &[
    "--smp",
    "2",
    "-m",
    "1G",
    "--collectd",
    "0",
    "--overprovisioned",
    "--max-networking-io-control-blocks",
    "1000",
    "--unsafe-bypass-fsync",
    "1",
    "--kernel-page-cache",
    "1",
    "--commitlog-use-o-dsync",
    "0",
    "--abort-on-lsa-bad-alloc",
    "1",
    "--abort-on-seastar-bad-alloc",
    "--abort-on-internal-error",
    "1",
    "--abort-on-ebadf",
    "1",
];

/// One parsed `--name value`, `--name=value`, or bare `--name` token.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    name: String,
    value: Option<String>,
}

/// Parses an ordered argument list into name-ordered entries, preserving the
/// first-seen order of each distinct flag name. Repeated flag names are kept
/// as repeated entries in order (e.g. repeated `--experimental-features`).
fn parse(args: &[impl AsRef<str>]) -> Vec<Entry> {
    let mut entries = Vec::new();
    let mut iter = args.iter().map(|s| s.as_ref()).peekable();
    while let Some(tok) = iter.next() {
        if let Some((name, value)) = tok.split_once('=') {
            entries.push(Entry {
                name: name.to_string(),
                value: Some(value.to_string()),
            });
            continue;
        }
        let name = tok.to_string();
        let takes_value = iter
            .peek()
            .is_some_and(|next| !next.starts_with("--") && !next.starts_with('-'));
        let value = if takes_value {
            iter.next().map(|s| s.to_string())
        } else {
            None
        };
        entries.push(Entry { name, value });
    }
    entries
}

/// Merges `base` and `override_` per the command-line merge rule: an override
/// value of [`REMOVE`] deletes the flag; otherwise the override's value list
/// replaces the base's (with [`MISSING`] meaning "unset"). Names keep base
/// insertion order; names new to the override are appended in override order.
pub fn merge_cmdline_options(
    base: &[impl AsRef<str>],
    override_: &[impl AsRef<str>],
) -> Vec<String> {
    let base_entries = parse(base);
    let override_entries = parse(override_);

    let mut order: Vec<String> = Vec::new();
    let mut merged: std::collections::HashMap<String, Vec<Option<String>>> =
        std::collections::HashMap::new();

    for entry in &base_entries {
        if !merged.contains_key(&entry.name) {
            order.push(entry.name.clone());
        }
        merged.entry(entry.name.clone()).or_default().push(entry.value.clone());
    }

    let mut removed: std::collections::HashSet<String> = std::collections::HashSet::new();
    let mut overridden: std::collections::HashSet<String> = std::collections::HashSet::new();

    for entry in &override_entries {
        if entry.value.as_deref() == Some(REMOVE) {
            removed.insert(entry.name.clone());
            merged.remove(&entry.name);
            continue;
        }
        let value = match entry.value.as_deref() {
            Some(MISSING) => None,
            other => other.map(|s| s.to_string()),
        };
        if !overridden.contains(&entry.name) {
            merged.insert(entry.name.clone(), Vec::new());
            overridden.insert(entry.name.clone());
        }
        if !order.contains(&entry.name) && !removed.contains(&entry.name) {
            order.push(entry.name.clone());
        }
        merged.get_mut(&entry.name).unwrap().push(value);
    }

    let mut flat = Vec::new();
    for name in order {
        if removed.contains(&name) {
            continue;
        }
        let Some(values) = merged.get(&name) else {
            continue;
        };
        for value in values {
            flat.push(name.clone());
            if let Some(value) = value {
                flat.push(value.clone());
            }
        }
    }
    flat
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn replaces_a_value() {
        assert_eq!(
            merge_cmdline_options(&v(&["--smp", "1"]), &v(&["--smp", "2"])),
            v(&["--smp", "2"])
        );
    }

    #[test]
    fn replaces_with_a_valueless_flag() {
        assert_eq!(
            merge_cmdline_options(&v(&["--smp", "1"]), &v(&["--smp"])),
            v(&["--smp"])
        );
    }

    #[test]
    fn missing_sentinel_unsets_the_value() {
        assert_eq!(
            merge_cmdline_options(&v(&["--smp", "1"]), &v(&["--smp", "__missing__"])),
            v(&["--smp"])
        );
    }

    #[test]
    fn remove_sentinel_deletes_the_flag() {
        assert_eq!(
            merge_cmdline_options(&v(&["--smp", "1"]), &v(&["--smp", "__remove__"])),
            Vec::<String>::new()
        );
    }

    #[test]
    fn equals_form_replaces_a_value() {
        assert_eq!(
            merge_cmdline_options(&v(&["--smp=1"]), &v(&["--smp=2"])),
            v(&["--smp", "2"])
        );
    }

    #[test]
    fn equals_form_remove_sentinel_deletes_the_flag() {
        assert_eq!(
            merge_cmdline_options(&v(&["--smp=1"]), &v(&["--smp=__remove__"])),
            Vec::<String>::new()
        );
    }

    #[test]
    fn unrelated_flags_keep_their_position() {
        assert_eq!(
            merge_cmdline_options(
                &v(&["--overprovisioned", "--smp=1", "--abort-on-ebadf"]),
                &v(&["--smp=2"])
            ),
            v(&["--overprovisioned", "--smp", "2", "--abort-on-ebadf"])
        );
    }

    #[test]
    fn new_repeated_flags_are_appended_in_order() {
        assert_eq!(
            merge_cmdline_options(
                &Vec::<String>::new(),
                &v(&[
                    "--experimental-features",
                    "raft",
                    "--experimental-features",
                    "broadcast-tables"
                ])
            ),
            v(&[
                "--experimental-features",
                "raft",
                "--experimental-features",
                "broadcast-tables"
            ])
        );
    }

    #[test]
    fn baseline_is_well_formed() {
        // every flag name starts with a dash and the list parses without panicking
        let parsed = parse(&BASELINE_CMDLINE.to_vec());
        assert!(!parsed.is_empty());
        assert!(parsed.iter().all(|e| e.name.starts_with('-')));
    }
}
