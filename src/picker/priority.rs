//! Piece and file priorities

use serde::{Deserialize, Serialize};

/// Priority levels for piece selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PiecePriority {
    /// Never requested
    Skip = 0,
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
    /// VOD prebuffer and tail
    Highest = 4,
}

impl PiecePriority {
    pub fn is_wanted(self) -> bool {
        self != PiecePriority::Skip
    }
}

/// Availability across connected peers
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AvailabilitySummary {
    pub min: u32,
    pub max: u32,
    pub mean: f64,
    /// Complete copies in the swarm plus the fraction of the next one
    pub distributed_copies: f64,
}

impl AvailabilitySummary {
    pub fn from_counts(counts: &[u32]) -> Self {
        if counts.is_empty() {
            return Self::default();
        }
        let min = counts.iter().copied().min().unwrap_or(0);
        let max = counts.iter().copied().max().unwrap_or(0);
        let sum: u64 = counts.iter().map(|c| *c as u64).sum();
        let above_min = counts.iter().filter(|c| **c > min).count();
        Self {
            min,
            max,
            mean: sum as f64 / counts.len() as f64,
            distributed_copies: min as f64 + above_min as f64 / counts.len() as f64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering() {
        assert!(PiecePriority::Highest > PiecePriority::High);
        assert!(PiecePriority::Low > PiecePriority::Skip);
        assert!(!PiecePriority::Skip.is_wanted());
        assert_eq!(PiecePriority::default(), PiecePriority::Normal);
    }

    #[test]
    fn test_summary() {
        let s = AvailabilitySummary::from_counts(&[1, 2, 2, 1]);
        assert_eq!(s.min, 1);
        assert_eq!(s.max, 2);
        assert!((s.mean - 1.5).abs() < 1e-9);
        assert!((s.distributed_copies - 1.5).abs() < 1e-9);
        assert_eq!(AvailabilitySummary::from_counts(&[]).max, 0);
    }
}
