//! Caching Strategies
//!
//! A repository is initialized with one of four strategies, which decides
//! the subset of files pre-populated into the tiered store:
//!
//! - `eager`: every file whose size estimate is under the small-file limit
//! - `lazy`: a handful of conventionally important files (README, manifests)
//! - `predictive`: files matching a prioritized list of path patterns
//! - `adaptive`: starts as `predictive`, then follows repository-wide access
//!   counts during periodic optimization

use crate::error::{Error, Result};
use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

/// Caching strategy for a repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStrategy {
    Eager,
    #[default]
    Lazy,
    Predictive,
    Adaptive,
}

impl fmt::Display for CacheStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheStrategy::Eager => write!(f, "eager"),
            CacheStrategy::Lazy => write!(f, "lazy"),
            CacheStrategy::Predictive => write!(f, "predictive"),
            CacheStrategy::Adaptive => write!(f, "adaptive"),
        }
    }
}

impl FromStr for CacheStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "eager" => Ok(CacheStrategy::Eager),
            "lazy" => Ok(CacheStrategy::Lazy),
            "predictive" => Ok(CacheStrategy::Predictive),
            "adaptive" => Ok(CacheStrategy::Adaptive),
            other => Err(Error::Configuration(format!("unknown cache strategy: {}", other))),
        }
    }
}

/// A file known to exist in a repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoFile {
    pub path: String,
    /// Size reported by the source listing, if any
    pub size_estimate: Option<u64>,
}

impl RepoFile {
    pub fn new(path: impl Into<String>, size_estimate: Option<u64>) -> Self {
        Self {
            path: path.into(),
            size_estimate,
        }
    }
}

// =============================================================================
// Selection Limits
// =============================================================================

/// Limits and patterns used by the initial selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    /// Files strictly smaller than this are preloaded by `eager`
    pub eager_max_file_bytes: u64,
    /// Files preloaded by `lazy`
    pub lazy_max_files: usize,
    /// File names considered important, in priority order
    pub important_files: Vec<String>,
    /// Files preloaded by `predictive`
    pub predictive_max_files: usize,
    /// Path globs in priority order
    pub predictive_patterns: Vec<String>,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            eager_max_file_bytes: 100 * 1024,
            lazy_max_files: 5,
            important_files: [
                "README.md",
                "README",
                "README.rst",
                "Cargo.toml",
                "package.json",
                "pyproject.toml",
                "setup.py",
                "requirements.txt",
                "go.mod",
                "pom.xml",
                "build.gradle",
                "Makefile",
                "Dockerfile",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            predictive_max_files: 20,
            predictive_patterns: [
                "README*",
                "Cargo.toml",
                "package.json",
                "pyproject.toml",
                "go.mod",
                "**/main.*",
                "**/lib.*",
                "**/index.*",
                "**/mod.rs",
                "src/**/*.rs",
                "src/**/*.ts",
                "src/**/*.py",
                "src/**/*.go",
                "*.toml",
                "*.json",
                "*.yml",
                "*.yaml",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

/// Glob options used for every path pattern in the optimizer
pub const PATH_MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Compile patterns, skipping (and logging) invalid ones
pub fn compile_patterns(patterns: &[String]) -> Vec<Pattern> {
    patterns
        .iter()
        .filter_map(|p| match Pattern::new(p) {
            Ok(pattern) => Some(pattern),
            Err(e) => {
                warn!(pattern = %p, error = %e, "Ignoring invalid path pattern");
                None
            }
        })
        .collect()
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn depth(path: &str) -> usize {
    path.matches('/').count()
}

// =============================================================================
// Selection
// =============================================================================

impl CacheStrategy {
    /// Select the files to pre-populate on repository initialization
    pub fn initial_selection(&self, files: &[RepoFile], config: &StrategyConfig) -> Vec<String> {
        match self {
            CacheStrategy::Eager => {
                let mut selected: Vec<String> = files
                    .iter()
                    .filter(|f| matches!(f.size_estimate, Some(size) if size < config.eager_max_file_bytes))
                    .map(|f| f.path.clone())
                    .collect();
                selected.sort();
                selected
            }
            CacheStrategy::Lazy => {
                let mut ranked: Vec<(usize, usize, &str)> = files
                    .iter()
                    .filter_map(|f| {
                        let name = file_name(&f.path);
                        config
                            .important_files
                            .iter()
                            .position(|important| important.eq_ignore_ascii_case(name))
                            .map(|rank| (rank, depth(&f.path), f.path.as_str()))
                    })
                    .collect();
                ranked.sort();
                ranked
                    .into_iter()
                    .take(config.lazy_max_files)
                    .map(|(_, _, path)| path.to_string())
                    .collect()
            }
            CacheStrategy::Predictive | CacheStrategy::Adaptive => {
                let patterns = compile_patterns(&config.predictive_patterns);
                let mut ranked: Vec<(usize, &str)> = files
                    .iter()
                    .filter_map(|f| {
                        patterns
                            .iter()
                            .position(|p| p.matches_with(&f.path, PATH_MATCH_OPTIONS))
                            .map(|rank| (rank, f.path.as_str()))
                    })
                    .collect();
                ranked.sort();
                ranked
                    .into_iter()
                    .take(config.predictive_max_files)
                    .map(|(_, path)| path.to_string())
                    .collect()
            }
        }
    }
}

// =============================================================================
// Adaptive Re-evaluation
// =============================================================================

/// Average-access cut-offs for adaptive repositories
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveThresholds {
    /// Average access count above which the repository goes `eager`
    pub eager_above: f64,
    /// Average access count above which the repository goes `predictive`
    pub predictive_above: f64,
}

impl Default for AdaptiveThresholds {
    fn default() -> Self {
        Self {
            eager_above: 10.0,
            predictive_above: 5.0,
        }
    }
}

/// Pick the effective strategy from the average access count of a repository's files
pub fn select_adaptive(avg_access_count: f64, thresholds: &AdaptiveThresholds) -> CacheStrategy {
    if avg_access_count > thresholds.eager_above {
        CacheStrategy::Eager
    } else if avg_access_count > thresholds.predictive_above {
        CacheStrategy::Predictive
    } else {
        CacheStrategy::Lazy
    }
}
