//! Core value types shared across crates

use std::fmt;

use serde::{Deserialize, Serialize};

/// Scheduling priority of a task. Higher variants are scheduled first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    VeryLow = 0,
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
    VeryHigh = 4,
}

impl Priority {
    /// Number of priority levels (one scheduler bucket each)
    pub const COUNT: usize = 5;

    /// All priorities, highest first
    pub const DESCENDING: [Priority; Self::COUNT] = [
        Priority::VeryHigh,
        Priority::High,
        Priority::Normal,
        Priority::Low,
        Priority::VeryLow,
    ];

    /// Index of the bucket holding tasks of this priority
    pub fn index(self) -> usize {
        self as usize
    }

    /// Parse a priority from its snake_case name
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "very_low" => Some(Self::VeryLow),
            "low" => Some(Self::Low),
            "normal" => Some(Self::Normal),
            "high" => Some(Self::High),
            "very_high" => Some(Self::VeryHigh),
            _ => None,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::VeryLow => "very_low",
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::VeryHigh => "very_high",
        };
        f.write_str(name)
    }
}

/// Scheduling class of a task.
///
/// Urgent tasks are placed in the top bucket regardless of their requested
/// priority and may run even when the concurrency cap is reached. The class
/// is meant for a small set of latency-critical interactive operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskClass {
    #[default]
    Normal,
    Urgent,
}

impl TaskClass {
    pub fn is_urgent(self) -> bool {
        matches!(self, Self::Urgent)
    }
}

/// Voxel spacing of an output, in nanometers per axis
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Spacing(pub [f64; 3]);

impl Default for Spacing {
    fn default() -> Self {
        Self([1.0, 1.0, 1.0])
    }
}

impl Spacing {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self([x, y, z])
    }
}

impl fmt::Display for Spacing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.0[0], self.0[1], self.0[2])
    }
}

/// Axis-aligned region `[x0, x1, y0, y1, z0, z1]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds(pub [f64; 6]);

impl Bounds {
    pub fn new(x0: f64, x1: f64, y0: f64, y1: f64, z0: f64, z1: f64) -> Self {
        Self([x0, x1, y0, y1, z0, z1])
    }

    /// Bounds are valid when every lower limit does not exceed its upper limit
    pub fn are_valid(&self) -> bool {
        (0..3).all(|axis| self.0[2 * axis] <= self.0[2 * axis + 1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::VeryLow < Priority::Low);
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::Normal < Priority::High);
        assert!(Priority::High < Priority::VeryHigh);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_priority_descending_covers_all_buckets() {
        let indices: Vec<usize> = Priority::DESCENDING.iter().map(|p| p.index()).collect();
        assert_eq!(indices, vec![4, 3, 2, 1, 0]);
    }

    #[test]
    fn test_priority_parse_display() {
        for priority in Priority::DESCENDING {
            assert_eq!(Priority::parse(&priority.to_string()), Some(priority));
        }
        assert!(Priority::parse("urgent").is_none());
    }

    #[test]
    fn test_bounds_validity() {
        assert!(Bounds::new(0.0, 10.0, 0.0, 10.0, 0.0, 10.0).are_valid());
        assert!(Bounds::new(5.0, 5.0, 0.0, 0.0, 2.0, 2.0).are_valid());
        assert!(!Bounds::new(0.0, 10.0, 4.0, 3.0, 0.0, 1.0).are_valid());
    }

    #[test]
    fn test_task_class() {
        assert!(TaskClass::Urgent.is_urgent());
        assert!(!TaskClass::default().is_urgent());
    }
}
