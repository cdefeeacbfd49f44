//! Engine configuration
//!
//! All tunables are aggregated into one immutable [`Config`] established
//! before the pool starts; workers read it through their thread-local
//! context.

use core::fmt;
use std::str::FromStr;

/// Selects the in-counter / out-set implementation family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EdgeAlgorithm {
    /// Fetch-add in-counter word plus a Treiber-stack out-set.
    Simple,
    /// SNZI-backed in-counter; unary edges depart a leaf directly.
    Distributed,
    /// Randomised dynamic trees for both structures.
    Dyntree,
}

impl FromStr for EdgeAlgorithm {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, ConfigError> {
        match s {
            "simple" => Ok(EdgeAlgorithm::Simple),
            "distributed" => Ok(EdgeAlgorithm::Distributed),
            "dyntree" => Ok(EdgeAlgorithm::Dyntree),
            other => Err(ConfigError::UnknownAlgorithm(other.to_string())),
        }
    }
}

/// Immutable configuration bundle for one engine run.
#[derive(Clone, Debug)]
pub struct Config {
    /// Which edge-structure family backs join in-counters and out-sets.
    pub edge_algorithm: EdgeAlgorithm,
    /// Branching factor of the SNZI tree.
    pub snzi_branching_factor: usize,
    /// Number of levels of the SNZI tree (root included).
    pub snzi_levels: usize,
    /// Branching factor of the dynamic in-counter and out-set trees.
    pub dyntree_branching_factor: usize,
    /// How many items a cooperative block processes before yielding a
    /// split opportunity to thieves.
    pub communication_delay: usize,
    /// Number of worker threads, the launching thread included.
    pub nb_workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        let nb_workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            edge_algorithm: EdgeAlgorithm::Dyntree,
            snzi_branching_factor: 2,
            snzi_levels: 3,
            dyntree_branching_factor: 2,
            communication_delay: 100,
            nb_workers,
        }
    }
}

impl Config {
    /// Creates the default configuration with a chosen edge algorithm.
    pub fn with_algorithm(edge_algorithm: EdgeAlgorithm) -> Self {
        Self {
            edge_algorithm,
            ..Self::default()
        }
    }

    /// Checks that every tunable is in its legal range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nb_workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.communication_delay == 0 {
            return Err(ConfigError::ZeroDelay);
        }
        if self.snzi_branching_factor < 2 {
            return Err(ConfigError::BadBranching(self.snzi_branching_factor));
        }
        if self.snzi_levels < 1 {
            return Err(ConfigError::BadLevels(self.snzi_levels));
        }
        if self.dyntree_branching_factor < 2 {
            return Err(ConfigError::BadBranching(self.dyntree_branching_factor));
        }
        Ok(())
    }
}

/// Typed errors for configuration validation.
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// The pool needs at least one worker.
    ZeroWorkers,
    /// A zero communication delay would never make progress between splits.
    ZeroDelay,
    /// Tree branching factors must be at least two.
    BadBranching(usize),
    /// The SNZI tree needs at least one level.
    BadLevels(usize),
    /// The edge-algorithm name was not recognised.
    UnknownAlgorithm(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ZeroWorkers => write!(f, "worker count must be nonzero"),
            ConfigError::ZeroDelay => write!(f, "communication delay must be nonzero"),
            ConfigError::BadBranching(b) => {
                write!(f, "branching factor {} is below the minimum of 2", b)
            }
            ConfigError::BadLevels(l) => write!(f, "snzi level count {} is below 1", l),
            ConfigError::UnknownAlgorithm(s) => {
                write!(f, "unknown edge algorithm '{}'", s)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_degenerate_shapes() {
        let mut cfg = Config::default();
        cfg.snzi_branching_factor = 1;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.nb_workers = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::ZeroWorkers)));
    }

    #[test]
    fn parses_algorithm_names() {
        assert_eq!(
            "distributed".parse::<EdgeAlgorithm>().unwrap(),
            EdgeAlgorithm::Distributed
        );
        assert!("treiber".parse::<EdgeAlgorithm>().is_err());
    }
}
