//! Warehouse partition identifiers
//!
//! A partition is `(year, month, day, hour, seq)`, stored on the filesystem at
//! `<target_root>/YYYY/MM/DD/HH/seq`. `seq` separates several loads that land
//! in the same hour.

use std::fmt;
use thiserror::Error;

use crate::catalog::ChunkLabel;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PartitionError {
    #[error("Path '{0}' does not end in YYYY/MM/DD/HH/seq")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Partition {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub seq: u32,
}

impl Partition {
    /// Build the partition for sequence `seq` under a chunk label
    pub fn for_label(label: &ChunkLabel, seq: u32) -> Self {
        Self {
            year: label.year as u16,
            month: label.month as u8,
            day: label.day as u8,
            hour: label.hour as u8,
            seq,
        }
    }

    /// Parse the trailing `YYYY/MM/DD/HH/seq` components of a full path
    pub fn from_path(path: &str) -> Result<Self, PartitionError> {
        let malformed = || PartitionError::Malformed(path.to_string());

        let parts: Vec<&str> = path.trim().trim_end_matches('/').rsplit('/').take(5).collect();
        // rsplit yields seq, hour, day, month, year
        let &[seq, hour, day, month, year] = parts.as_slice() else {
            return Err(malformed());
        };

        let fixed = |s: &str, width: usize| s.len() == width && s.bytes().all(|b| b.is_ascii_digit());
        let numeric = !seq.is_empty() && seq.bytes().all(|b| b.is_ascii_digit());
        if !(fixed(year, 4) && fixed(month, 2) && fixed(day, 2) && fixed(hour, 2) && numeric) {
            return Err(malformed());
        }

        Ok(Self {
            year: year.parse().map_err(|_| malformed())?,
            month: month.parse().map_err(|_| malformed())?,
            day: day.parse().map_err(|_| malformed())?,
            hour: hour.parse().map_err(|_| malformed())?,
            seq: seq.parse().map_err(|_| malformed())?,
        })
    }

    /// Parse the relative form `YYYY/MM/DD/HH/seq` exactly
    pub fn from_relative(spec: &str) -> Result<Self, PartitionError> {
        let spec = spec.trim().trim_matches('/');
        if spec.split('/').count() != 5 {
            return Err(PartitionError::Malformed(spec.to_string()));
        }
        Self::from_path(spec)
    }

    /// Relative path `YYYY/MM/DD/HH/seq`
    pub fn relative_path(&self) -> String {
        format!("{}/{}", self.parent_label(), self.seq)
    }

    /// Parent directory label `YYYY/MM/DD/HH`
    pub fn parent_label(&self) -> String {
        format!("{:04}/{:02}/{:02}/{:02}", self.year, self.month, self.day, self.hour)
    }

    /// Full filesystem location under `root`
    pub fn location(&self, root: &str) -> String {
        join_path(root, &self.relative_path())
    }

    /// Partition spec as printed by `show partitions`
    pub fn hive_spec(&self) -> String {
        format!(
            "year={:04}/month={:02}/day={:02}/hour={:02}/part={}",
            self.year, self.month, self.day, self.hour, self.seq
        )
    }

    /// Partition clause for `alter table ... partition (...)`
    pub fn hive_clause(&self) -> String {
        format!(
            "year='{:04}', month='{:02}', day='{:02}', hour='{:02}', part='{}'",
            self.year, self.month, self.day, self.hour, self.seq
        )
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.relative_path())
    }
}

/// Next unused sequence number given the existing child names of a parent
pub fn next_sequence<S: AsRef<str>>(children: &[S]) -> u32 {
    children
        .iter()
        .filter_map(|c| c.as_ref().trim().parse::<u32>().ok())
        .max()
        .map_or(0, |max| max + 1)
}

/// Join filesystem path components with exactly one `/` between them
pub fn join_path(base: &str, rest: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), rest.trim_start_matches('/'))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_from_path() {
        let p = Partition::from_path("/warehouse/clicks/2016/08/19/14/3").unwrap();
        assert_eq!(p, Partition { year: 2016, month: 8, day: 19, hour: 14, seq: 3 });
        assert_eq!(p.relative_path(), "2016/08/19/14/3");
    }

    #[test]
    fn test_from_path_rejects_malformed() {
        assert!(Partition::from_path("/warehouse/clicks/2016/08/19/14").is_err());
        assert!(Partition::from_path("/warehouse/2016/8/19/14/0").is_err());
        assert!(Partition::from_path("/warehouse/2016/08/19/14/x").is_err());
        assert!(Partition::from_path("").is_err());
    }

    #[test]
    fn test_from_relative_requires_five_components() {
        assert_eq!(
            Partition::from_relative("2016/08/01/00/0").unwrap().hive_spec(),
            "year=2016/month=08/day=01/hour=00/part=0"
        );
        assert!(Partition::from_relative("data/2016/08/01/00/0").is_err());
    }

    #[test]
    fn test_hive_renderings() {
        let p = Partition::from_relative("2016/08/19/14/1").unwrap();
        assert_eq!(p.hive_clause(), "year='2016', month='08', day='19', hour='14', part='1'");
        assert_eq!(p.parent_label(), "2016/08/19/14");
        assert_eq!(p.location("/warehouse/clicks/"), "/warehouse/clicks/2016/08/19/14/1");
    }

    #[test]
    fn test_next_sequence() {
        assert_eq!(next_sequence(&["0", "1", "2"]), 3);
        assert_eq!(next_sequence(&["2", "10", "9"]), 11);
        assert_eq!(next_sequence::<&str>(&[]), 0);
        assert_eq!(next_sequence(&["_SUCCESS"]), 0);
    }

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("/a/", "/b"), "/a/b");
        assert_eq!(join_path("/a", "b/c"), "/a/b/c");
    }
}
