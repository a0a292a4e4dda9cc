// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 buildgraph contributors

//! Artifact rule matching
//!
//! Expands a rule's source glob under a root directory into
//! `(source file, relative destination)` pairs.

use glob::MatchOptions;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use crate::errors::{BuildgraphError, BuildgraphResult};
use crate::pipeline::{ArtifactRule, CopyLayout};

const GLOB_CHARS: &[char] = &['*', '?', '['];

/// A file selected by a rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    pub source: PathBuf,
    /// Path below the rule's destination
    pub relative: PathBuf,
}

fn is_glob(component: &str) -> bool {
    component.contains(GLOB_CHARS)
}

/// Leading components of a pattern that contain no glob characters.
///
/// For a fully literal pattern this is its parent.
fn literal_base(pattern: &str) -> PathBuf {
    let parts: Vec<&str> = pattern.split('/').collect();
    let literal = parts.iter().take_while(|p| !is_glob(p)).count();
    let take = if literal == parts.len() {
        literal.saturating_sub(1)
    } else {
        literal
    };
    parts[..take].iter().collect()
}

/// Reject destinations that climb out of the destination root
pub fn check_destination(rule: &ArtifactRule) -> BuildgraphResult<()> {
    if Path::new(&rule.destination)
        .components()
        .any(|c| c == Component::ParentDir)
    {
        return Err(BuildgraphError::InvalidArtifactRule {
            rule: rule.to_string(),
            reason: "destination may not contain '..'".into(),
        });
    }
    Ok(())
}

/// Files selected by `rule` under `root`, ordered by source path.
///
/// A literal source naming a directory selects the directory's files
/// relative to that directory. Glob matches keep their path relative to the
/// pattern's literal base, unless the rule flattens. Two sources landing on
/// the same destination are an error.
pub fn find_matches(root: &Path, rule: &ArtifactRule) -> BuildgraphResult<Vec<Match>> {
    let pattern = rule.source.trim().trim_end_matches('/');
    let base_dir = root.join(literal_base(pattern));

    let mut found: BTreeMap<PathBuf, PathBuf> = BTreeMap::new();

    if !is_glob(pattern) {
        let path = root.join(pattern);
        if path.is_dir() {
            for file in walk_files(&path)? {
                let relative = relative_to(&file, &path);
                found.insert(file, relative);
            }
        } else if path.is_file() {
            let relative = relative_to(&path, &base_dir);
            found.insert(path, relative);
        }
    } else {
        let full = if Path::new(pattern).is_absolute() {
            pattern.to_string()
        } else {
            format!(
                "{}/{}",
                glob::Pattern::escape(&root.to_string_lossy()),
                pattern
            )
        };
        let options = MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };

        for entry in glob::glob_with(&full, options)? {
            let path = entry.map_err(|e| BuildgraphError::Io {
                message: e.to_string(),
            })?;
            if path.is_dir() {
                for file in walk_files(&path)? {
                    let relative = relative_to(&file, &base_dir);
                    found.insert(file, relative);
                }
            } else if path.is_file() {
                let relative = relative_to(&path, &base_dir);
                found.insert(path, relative);
            }
        }
    }

    let mut claimed: BTreeMap<PathBuf, PathBuf> = BTreeMap::new();
    let mut matches = Vec::with_capacity(found.len());
    for (source, relative) in found {
        let relative = match rule.layout {
            CopyLayout::Preserve => relative,
            CopyLayout::Flatten => source
                .file_name()
                .map(PathBuf::from)
                .unwrap_or(relative),
        };
        if let Some(first) = claimed.insert(relative.clone(), source.clone()) {
            return Err(BuildgraphError::InvalidArtifactRule {
                rule: rule.to_string(),
                reason: format!(
                    "'{}' and '{}' both map to '{}'",
                    first.display(),
                    source.display(),
                    portable(&relative)
                ),
            });
        }
        matches.push(Match { source, relative });
    }

    Ok(matches)
}

fn relative_to(path: &Path, base: &Path) -> PathBuf {
    match path.strip_prefix(base) {
        Ok(rel) => rel.to_path_buf(),
        Err(_) => path.file_name().map(PathBuf::from).unwrap_or_default(),
    }
}

/// All regular files below `dir`, recursively
pub fn walk_files(dir: &Path) -> BuildgraphResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else if path.is_file() {
                files.push(path);
            }
        }
    }

    files.sort();
    Ok(files)
}

/// Relative path rendered with `/` separators, as stored in manifests
pub fn portable(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        for file in [
            "install/lib/libcarbon.so",
            "install/lib/libcarbon.a",
            "install/include/carbon.h",
            "build.log",
        ] {
            let path = dir.path().join(file);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, file).unwrap();
        }
        dir
    }

    fn relatives(root: &Path, rule: &str) -> Vec<String> {
        let rule: ArtifactRule = rule.parse().unwrap();
        find_matches(root, &rule)
            .unwrap()
            .iter()
            .map(|m| portable(&m.relative))
            .collect()
    }

    #[test]
    fn test_literal_base() {
        assert_eq!(literal_base("**/*"), PathBuf::new());
        assert_eq!(literal_base("install/lib/*.so"), PathBuf::from("install/lib"));
        assert_eq!(literal_base("install/lib/libcarbon.a"), PathBuf::from("install/lib"));
        assert_eq!(literal_base("install"), PathBuf::new());
    }

    #[test]
    fn test_directory_source_publishes_contents() {
        let dir = tree();
        assert_eq!(
            relatives(dir.path(), "install"),
            vec!["include/carbon.h", "lib/libcarbon.a", "lib/libcarbon.so"]
        );
    }

    #[test]
    fn test_recursive_glob_preserves_paths() {
        let dir = tree();
        let all = relatives(dir.path(), "**/*=>arm64");
        assert_eq!(all.len(), 4);
        assert!(all.contains(&"install/lib/libcarbon.so".to_string()));
        assert!(all.contains(&"build.log".to_string()));
    }

    #[test]
    fn test_flatten_and_extension_filter() {
        let dir = tree();
        assert_eq!(relatives(dir.path(), "**/*.so:lib"), vec!["libcarbon.so"]);
        assert_eq!(relatives(dir.path(), "install/lib/*.a"), vec!["libcarbon.a"]);
    }

    #[test]
    fn test_flatten_collision_is_rejected() {
        let dir = tree();
        for file in ["a/libfoo.so", "b/libfoo.so"] {
            let path = dir.path().join(file);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, file).unwrap();
        }

        let rule: ArtifactRule = "**/*.so:lib".parse().unwrap();
        match find_matches(dir.path(), &rule) {
            Err(BuildgraphError::InvalidArtifactRule { reason, .. }) => {
                assert!(reason.contains("libfoo.so"), "{}", reason);
            }
            other => panic!("Expected InvalidArtifactRule, got {:?}", other),
        }

        // preserved paths stay distinct
        let rule: ArtifactRule = "**/*.so=>lib".parse().unwrap();
        assert_eq!(find_matches(dir.path(), &rule).unwrap().len(), 3);
    }

    #[test]
    fn test_no_match_is_empty() {
        let dir = tree();
        assert!(relatives(dir.path(), "missing/*.dll").is_empty());
        assert!(relatives(dir.path(), "missing").is_empty());
    }

    #[test]
    fn test_destination_escape_rejected() {
        let rule = ArtifactRule::preserve("*.so", "../outside");
        assert!(check_destination(&rule).is_err());
        assert!(check_destination(&ArtifactRule::preserve("*.so", "vendor/x")).is_ok());
    }
}
