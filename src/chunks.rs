//! Partitioning of work units between workers
//!
//! A worker is told which part of the work it owns with a "parts" string: `all` (or
//! `*`), `i/n` for the i-th of n contiguous partitions, or a comma separated list of
//! 1-based unit numbers. The mapping is a pure function of the string and the number
//! of units, so independent processes agree on it without talking to each other.

use crate::errors::{DatasetError, Result};
use std::ops::Range;
use std::str::FromStr;
use tracing::warn;

/// Parsed parts specification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parts {
    All,
    /// The `index`-th (1-based) of `count` partitions
    Fraction { index: usize, count: usize },
    /// Explicit 1-based unit numbers
    Explicit(Vec<usize>),
}

impl FromStr for Parts {
    type Err = DatasetError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = |reason: &str| DatasetError::InvalidParts {
            parts: s.to_string(),
            reason: reason.to_string(),
        };
        if s.is_empty() || s.eq_ignore_ascii_case("all") || s == "*" {
            return Ok(Self::All);
        }
        if let Some((i, n)) = s.split_once('/') {
            let index = i.trim().parse().map_err(|_| invalid("part number is not an integer"))?;
            let count = n.trim().parse().map_err(|_| invalid("part count is not an integer"))?;
            return Ok(Self::Fraction { index, count });
        }
        let units = s
            .split(',')
            .map(|p| p.trim().parse::<usize>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| invalid("must be 'all', 'i/n' or a comma separated list of unit numbers"))?;
        Ok(Self::Explicit(units))
    }
}

impl std::fmt::Display for Parts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Fraction { index, count } => write!(f, "{index}/{count}"),
            Self::Explicit(units) => {
                let units: Vec<String> = units.iter().map(usize::to_string).collect();
                write!(f, "{}", units.join(","))
            }
        }
    }
}

/// Contiguous range of units owned by partition `index` (1-based) of `count`
///
/// Partitions have `total / count` units each, the first `total % count` get one more.
pub fn partition_range(index: usize, count: usize, total: usize) -> Range<usize> {
    let base = total / count;
    let extra = total % count;
    let i = index - 1;
    let start = i * base + i.min(extra);
    let len = base + usize::from(i < extra);
    start..start + len
}

/// Decides whether a unit belongs to this worker
#[derive(Debug, Clone)]
pub struct PartitionFilter {
    total: usize,
    allowed: Option<Vec<bool>>,
}

impl PartitionFilter {
    pub fn new(parts: &Parts, total: usize) -> Result<Self> {
        let invalid = |reason: String| DatasetError::InvalidParts {
            parts: parts.to_string(),
            reason,
        };
        let allowed = match parts {
            Parts::All => None,
            Parts::Fraction { index, count } => {
                if *count == 0 {
                    return Err(invalid("part count must be positive".to_string()));
                }
                if *index == 0 || index > count {
                    return Err(invalid(format!("part number must be between 1 and {count}")));
                }
                if *count > total {
                    warn!("Number of parts {count} is larger than the number of units {total}, some parts will be empty");
                }
                let range = partition_range(*index, *count, total);
                Some((0..total).map(|u| range.contains(&u)).collect())
            }
            Parts::Explicit(units) => {
                let mut mask = vec![false; total];
                for &u in units {
                    if u == 0 || u > total {
                        return Err(invalid(format!("unit {u} is outside 1..={total}")));
                    }
                    mask[u - 1] = true;
                }
                Some(mask)
            }
        };
        Ok(Self { total, allowed })
    }

    /// Whether `unit` (0-based) belongs to this worker
    pub fn contains(&self, unit: usize) -> bool {
        if unit >= self.total {
            return false;
        }
        self.allowed.as_ref().map_or(true, |mask| mask[unit])
    }

    /// Owned units in increasing order
    pub fn owned(&self) -> Vec<usize> {
        (0..self.total).filter(|&u| self.contains(u)).collect()
    }

    pub fn total(&self) -> usize {
        self.total
    }
}
