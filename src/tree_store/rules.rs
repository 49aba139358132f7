//! `ExclusionRuleSet` — the local walker's project-dir exclusion predicate.
//!
//! A `globset` rule engine narrowed to plain accept/reject glob matching:
//! this crate has no per-location rule persistence or rule-priority
//! system, just a fixed set of patterns a root is walked with.

use std::path::Path;

use globset::{Glob, GlobSet, GlobSetBuilder};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuleError {
	#[error("invalid glob pattern {pattern:?}: {source}")]
	InvalidGlob {
		pattern: String,
		#[source]
		source: globset::Error,
	},
}

/// Default patterns excluded from every local walk — the usual
/// version-control and build-artifact directories.
pub const DEFAULT_EXCLUSIONS: &[&str] = &[
	"**/.git",
	"**/.git/**",
	"**/node_modules",
	"**/node_modules/**",
	"**/target",
	"**/target/**",
	"**/.sync-tmp",
	"**/.sync-tmp/**",
];

pub struct ExclusionRuleSet {
	set: GlobSet,
}

impl ExclusionRuleSet {
	pub fn new(patterns: &[&str]) -> Result<Self, RuleError> {
		let mut builder = GlobSetBuilder::new();
		for pattern in patterns {
			let glob = Glob::new(pattern).map_err(|source| RuleError::InvalidGlob {
				pattern: (*pattern).to_string(),
				source,
			})?;
			builder.add(glob);
		}
		let set = builder.build().map_err(|source| RuleError::InvalidGlob {
			pattern: "<build>".to_string(),
			source,
		})?;
		Ok(Self { set })
	}

	pub fn default_set() -> Self {
		Self::new(DEFAULT_EXCLUSIONS).expect("default exclusion patterns are valid globs")
	}

	/// True iff `path` should be skipped entirely (and, for directories, not
	/// descended into).
	pub fn is_excluded(&self, path: &Path) -> bool {
		self.set.is_match(path)
	}
}

impl Default for ExclusionRuleSet {
	fn default() -> Self {
		Self::default_set()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::path::PathBuf;

	#[test]
	fn excludes_git_directory() {
		let rules = ExclusionRuleSet::default_set();
		assert!(rules.is_excluded(&PathBuf::from("/repo/.git")));
		assert!(rules.is_excluded(&PathBuf::from("/repo/.git/HEAD")));
	}

	#[test]
	fn does_not_exclude_ordinary_paths() {
		let rules = ExclusionRuleSet::default_set();
		assert!(!rules.is_excluded(&PathBuf::from("/repo/src/main.rs")));
	}
}
