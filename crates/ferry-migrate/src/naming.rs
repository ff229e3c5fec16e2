//! Mapping of source projects and repositories to target paths.
//!
//! Everything here is pure: the same `(project, repo, prefix)` always maps to
//! the same [`TargetPath`]. Collisions are detected over a whole inventory by
//! [`NamespaceMapper::map_inventory`] and reported per unit.

use crate::types::{MigrationUnit, SourceProject, SourceRepo, TargetPath, UnitId};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;

/// Maximum length of a single path segment on the target.
pub const MAX_PATH_LEN: usize = 255;

/// Joins the prefix and the project name.
pub const PREFIX_SEPARATOR: char = '-';

/// Characters that are not allowed in a target path segment.
static DISALLOWED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^a-z0-9_.-]+").expect("Invalid regex"));

/// Runs of separator characters.
static SEPARATOR_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[-_.]{2,}").expect("Invalid regex"));

/// Shape of every sanitized segment.
pub static TARGET_SEGMENT_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([a-z0-9_.-]*[a-z0-9])?$").expect("Invalid regex"));

/// Suffixes the target refuses at the end of a path.
const RESERVED_SUFFIXES: [&str; 2] = [".git", ".atom"];

/// Naming errors. Always scoped to a single unit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NamingError {
    /// Nothing of the name survives sanitization.
    #[error("invalid name: '{0}' contains no characters allowed in a target path")]
    InvalidName(String),

    /// Another source maps to the same target.
    #[error("naming collision: '{target}' is also the target of {}", .others.join(", "))]
    Collision { target: String, others: Vec<String> },
}

fn is_separator(c: char) -> bool {
    matches!(c, '-' | '_' | '.')
}

/// Sanitize a name into a single target path segment.
pub fn sanitize(raw: &str) -> Result<String, NamingError> {
    let lowered = raw.trim().to_lowercase();
    let replaced = DISALLOWED.replace_all(&lowered, "-");
    let collapsed = SEPARATOR_RUN.replace_all(&replaced, |caps: &regex::Captures<'_>| {
        caps[0][..1].to_string()
    });

    let mut segment = collapsed.trim_start_matches(is_separator).to_string();
    segment.truncate(MAX_PATH_LEN);

    loop {
        let trimmed_len = segment.trim_end_matches(is_separator).len();
        segment.truncate(trimmed_len);
        match RESERVED_SUFFIXES.iter().find(|s| segment.ends_with(*s)) {
            Some(suffix) => segment.truncate(segment.len() - suffix.len()),
            None => break,
        }
    }

    if segment.is_empty() || !TARGET_SEGMENT_REGEX.is_match(&segment) {
        return Err(NamingError::InvalidName(raw.to_string()));
    }
    Ok(segment)
}

/// Splits a prefix like `"archive/bb-"` into parent groups and the leaf prefix.
fn split_prefix(prefix: &str) -> (Vec<&str>, &str) {
    match prefix.rfind('/') {
        Some(idx) => {
            let parents = prefix[..idx].split('/').filter(|s| !s.is_empty()).collect();
            (parents, &prefix[idx + 1..])
        }
        None => (Vec::new(), prefix),
    }
}

/// Map a source project name to a target namespace path.
pub fn map_namespace(prefix: &str, project_name: &str) -> Result<String, NamingError> {
    let (parents, leaf_prefix) = split_prefix(prefix);

    let leaf = if leaf_prefix.is_empty() {
        sanitize(project_name)?
    } else {
        sanitize(&format!("{leaf_prefix}{PREFIX_SEPARATOR}{project_name}"))?
    };

    let mut segments = parents
        .into_iter()
        .map(sanitize)
        .collect::<Result<Vec<_>, _>>()?;
    segments.push(leaf);
    Ok(segments.join("/"))
}

/// Map a `(project, repo)` pair to its target path.
pub fn map_target(prefix: &str, project_name: &str, repo_name: &str) -> Result<TargetPath, NamingError> {
    Ok(TargetPath::new(
        map_namespace(prefix, project_name)?,
        sanitize(repo_name)?,
    ))
}

/// A unit that could not be mapped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingFailure {
    pub id: UnitId,
    /// Source location, e.g. "Team A/svc-one".
    pub source: String,
    /// The mapped path, when mapping itself succeeded.
    pub target: Option<TargetPath>,
    pub error: NamingError,
}

/// Result of mapping a whole inventory.
#[derive(Debug, Clone, Default)]
pub struct MappingOutcome {
    /// Units ready for the existence check, in inventory order.
    pub units: Vec<MigrationUnit>,
    /// Units that failed mapping, in inventory order.
    pub failures: Vec<MappingFailure>,
}

impl MappingOutcome {
    /// Total number of units produced from the inventory.
    pub fn len(&self) -> usize {
        self.units.len() + self.failures.len()
    }

    /// Whether the inventory contained no repositories.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Maps source entities to target paths under a configured prefix.
#[derive(Debug, Clone, Default)]
pub struct NamespaceMapper {
    prefix: String,
}

impl NamespaceMapper {
    /// Create a mapper for the given prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// The configured prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Map one repository to a migration unit.
    pub fn map(&self, project: &SourceProject, repo: &SourceRepo) -> Result<MigrationUnit, NamingError> {
        let target = map_target(&self.prefix, &project.name, &repo.name)?;
        let (_, leaf_prefix) = split_prefix(&self.prefix);

        Ok(MigrationUnit {
            id: UnitId::new(&project.key, &repo.slug),
            project_name: project.name.clone(),
            repo: repo.clone(),
            target,
            namespace_title: format!("{leaf_prefix}{}", project.name),
        })
    }

    /// Map every repository of an inventory and detect collisions.
    ///
    /// Two distinct projects sharing a namespace, or two distinct repositories
    /// sharing a full path, fail every unit involved.
    pub fn map_inventory(&self, projects: &[SourceProject]) -> MappingOutcome {
        let mut mapped: Vec<Result<MigrationUnit, MappingFailure>> = Vec::new();

        for project in projects {
            for repo in &project.repos {
                mapped.push(self.map(project, repo).map_err(|error| MappingFailure {
                    id: UnitId::new(&project.key, &repo.slug),
                    source: format!("{}/{}", project.name, repo.name),
                    target: None,
                    error,
                }));
            }
        }

        // namespace -> distinct source projects (key, name)
        let mut namespace_owners: HashMap<&str, BTreeSet<(&str, &str)>> = HashMap::new();
        // full path -> units
        let mut path_owners: HashMap<String, Vec<usize>> = HashMap::new();

        for (idx, unit) in mapped.iter().enumerate() {
            if let Ok(unit) = unit {
                namespace_owners
                    .entry(unit.target.namespace.as_str())
                    .or_default()
                    .insert((unit.repo.project_key.as_str(), unit.project_name.as_str()));
                path_owners.entry(unit.target.full_path()).or_default().push(idx);
            }
        }

        let mut collisions: HashMap<usize, NamingError> = HashMap::new();

        for (idx, unit) in mapped.iter().enumerate() {
            let Ok(unit) = unit else { continue };

            let owners = &namespace_owners[unit.target.namespace.as_str()];
            if owners.len() > 1 {
                let others = owners
                    .iter()
                    .filter(|(key, _)| *key != unit.repo.project_key)
                    .map(|(_, name)| format!("project '{name}'"))
                    .collect();
                collisions.insert(
                    idx,
                    NamingError::Collision {
                        target: unit.target.namespace.clone(),
                        others,
                    },
                );
                continue;
            }

            let sharing = &path_owners[&unit.target.full_path()];
            if sharing.len() > 1 {
                let others = sharing
                    .iter()
                    .filter(|other| **other != idx)
                    .filter_map(|other| mapped[*other].as_ref().ok())
                    .map(|other| format!("'{}'", other.source_display()))
                    .collect();
                collisions.insert(
                    idx,
                    NamingError::Collision {
                        target: unit.target.full_path(),
                        others,
                    },
                );
            }
        }

        let mut outcome = MappingOutcome::default();
        for (idx, entry) in mapped.into_iter().enumerate() {
            match entry {
                Ok(unit) => match collisions.remove(&idx) {
                    Some(error) => outcome.failures.push(MappingFailure {
                        id: unit.id.clone(),
                        source: unit.source_display(),
                        target: Some(unit.target),
                        error,
                    }),
                    None => outcome.units.push(unit),
                },
                Err(failure) => outcome.failures.push(failure),
            }
        }

        if !outcome.failures.is_empty() {
            tracing::warn!(
                failed = outcome.failures.len(),
                mapped = outcome.units.len(),
                "Some repositories could not be mapped to a target path"
            );
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn project(key: &str, name: &str, repos: &[&str]) -> SourceProject {
        SourceProject {
            key: key.to_string(),
            name: name.to_string(),
            description: None,
            repos: repos
                .iter()
                .map(|r| SourceRepo {
                    slug: r.to_lowercase(),
                    name: r.to_string(),
                    project_key: key.to_string(),
                    description: None,
                    public: false,
                })
                .collect(),
        }
    }

    #[test]
    fn test_example_mapping() {
        let target = map_target("bb-", "Team A", "svc-one").unwrap();
        assert_eq!(target.full_path(), "bb-team-a/svc-one");
    }

    #[test]
    fn test_empty_prefix_maps_to_top_level() {
        let target = map_target("", "Team A", "svc-two").unwrap();
        assert_eq!(target.namespace, "team-a");
        assert_eq!(target.project, "svc-two");
    }

    #[test]
    fn test_prefix_with_parent_groups() {
        assert_eq!(
            map_namespace("Archive/Old Stuff/bb-", "Team A").unwrap(),
            "archive/old-stuff/bb-team-a"
        );
        assert_eq!(map_namespace("archive/", "Team A").unwrap(), "archive/team-a");
    }

    #[test]
    fn test_sanitize_rules() {
        assert_eq!(sanitize("My Repo!!").unwrap(), "my-repo");
        assert_eq!(sanitize("--lead.and.trail__").unwrap(), "lead.and.trail");
        assert_eq!(sanitize("a__b..c").unwrap(), "a_b.c");
        assert_eq!(sanitize("service.git").unwrap(), "service");
        assert_eq!(sanitize("feed.atom.git").unwrap(), "feed");
        assert_eq!(sanitize("Ünïcode Näme").unwrap(), "n-code-n-me");
    }

    #[test]
    fn test_sanitize_rejects_empty_result() {
        assert!(matches!(sanitize("日本語"), Err(NamingError::InvalidName(_))));
        assert!(matches!(sanitize("   "), Err(NamingError::InvalidName(_))));
        assert!(matches!(sanitize("-_."), Err(NamingError::InvalidName(_))));
        assert_eq!(sanitize(".git").unwrap(), "git");
    }

    #[test]
    fn test_sanitize_truncates() {
        let long = "a".repeat(300);
        assert_eq!(sanitize(&long).unwrap().len(), MAX_PATH_LEN);

        let boundary = format!("{}-tail", "b".repeat(MAX_PATH_LEN - 1));
        let out = sanitize(&boundary).unwrap();
        assert_eq!(out, "b".repeat(MAX_PATH_LEN - 1));
    }

    #[test]
    fn test_inventory_preserves_order() {
        let projects = vec![
            project("A", "Team A", &["svc-one", "svc-two"]),
            project("B", "Team B", &["api"]),
        ];
        let outcome = NamespaceMapper::new("bb-").map_inventory(&projects);

        let paths: Vec<String> = outcome.units.iter().map(|u| u.target.full_path()).collect();
        assert_eq!(
            paths,
            vec!["bb-team-a/svc-one", "bb-team-a/svc-two", "bb-team-b/api"]
        );
        assert!(outcome.failures.is_empty());
        assert_eq!(outcome.units[0].namespace_title, "bb-Team A");
    }

    #[test]
    fn test_repo_collision_fails_both_units() {
        let projects = vec![project("A", "Team A", &["My Repo", "my-repo", "other"])];
        let outcome = NamespaceMapper::default().map_inventory(&projects);

        assert_eq!(outcome.units.len(), 1);
        assert_eq!(outcome.units[0].repo.name, "other");
        assert_eq!(outcome.failures.len(), 2);
        for failure in &outcome.failures {
            assert!(matches!(failure.error, NamingError::Collision { .. }));
            assert!(failure.error.to_string().starts_with("naming collision"));
        }
    }

    #[test]
    fn test_namespace_collision_fails_both_projects() {
        let projects = vec![
            project("A", "Team A", &["one"]),
            project("A2", "team-a", &["two"]),
            project("C", "Team C", &["three"]),
        ];
        let outcome = NamespaceMapper::default().map_inventory(&projects);

        assert_eq!(outcome.units.len(), 1);
        assert_eq!(outcome.units[0].id, UnitId::new("C", "three"));
        assert_eq!(outcome.failures.len(), 2);
        assert!(outcome.failures[0].error.to_string().contains("project 'team-a'"));
    }

    #[test]
    fn test_invalid_name_is_reported_per_unit() {
        let projects = vec![project("A", "Team A", &["日本", "ok"])];
        let outcome = NamespaceMapper::default().map_inventory(&projects);

        assert_eq!(outcome.units.len(), 1);
        assert_eq!(outcome.failures.len(), 1);
        assert!(outcome.failures[0].target.is_none());
        assert_eq!(outcome.len(), 2);
    }

    proptest! {
        #[test]
        fn prop_mapping_is_deterministic(
            prefix in "[a-zA-Z/ _-]{0,12}",
            project in ".{0,40}",
            repo in ".{0,40}",
        ) {
            let first = map_target(&prefix, &project, &repo);
            let second = map_target(&prefix, &project, &repo);
            prop_assert_eq!(first, second);
        }

        #[test]
        fn prop_sanitized_segments_are_valid(raw in ".{0,300}") {
            if let Ok(segment) = sanitize(&raw) {
                prop_assert!(segment.len() <= MAX_PATH_LEN);
                prop_assert!(TARGET_SEGMENT_REGEX.is_match(&segment));
                prop_assert_eq!(sanitize(&segment).unwrap(), segment.clone());
            }
        }
    }
}
