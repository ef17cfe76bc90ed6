//! Ordering strategies for concurrent patches.

use serde::{Deserialize, Serialize};

use crate::patch::Patch;

/// How patches for one entity are ordered before application.
///
/// The watermark filter applies regardless of the strategy; the strategy only
/// decides the order among patches that survive it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Ascending change number. The only strategy with a total order.
    #[default]
    ChangeNumberBased,
    /// Ascending timestamp, ties broken by change number. Clock skew between
    /// writers can reorder mutations.
    TimestampBased,
    /// Arrival order.
    LastWriterWins,
}

impl ConflictStrategy {
    /// Sort `patches` in place. Sorting is stable, so patches that compare equal
    /// keep their generation order.
    pub fn order(&self, patches: &mut [Patch]) {
        match self {
            ConflictStrategy::ChangeNumberBased => {
                patches.sort_by_key(|p| p.change_number);
            }
            ConflictStrategy::TimestampBased => {
                patches.sort_by_key(|p| (p.timestamp, p.change_number));
            }
            ConflictStrategy::LastWriterWins => {}
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::ChangeNumberBased => "change_number_based",
            ConflictStrategy::TimestampBased => "timestamp_based",
            ConflictStrategy::LastWriterWins => "last_writer_wins",
        }
    }
}

impl std::fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ConflictStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "change_number_based" | "change_number" => Ok(ConflictStrategy::ChangeNumberBased),
            "timestamp_based" | "timestamp" => Ok(ConflictStrategy::TimestampBased),
            "last_writer_wins" | "lww" => Ok(ConflictStrategy::LastWriterWins),
            other => Err(format!("unknown conflict strategy '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered(cns: &[u64]) -> Vec<Patch> {
        cns.iter()
            .map(|cn| Patch::set(format!("f{}", cn), *cn).with_change_number(*cn))
            .collect()
    }

    fn cns(patches: &[Patch]) -> Vec<u64> {
        patches.iter().map(|p| p.change_number).collect()
    }

    #[test]
    fn test_change_number_ordering() {
        let mut patches = numbered(&[3, 1, 2]);
        ConflictStrategy::ChangeNumberBased.order(&mut patches);
        assert_eq!(cns(&patches), vec![1, 2, 3]);
    }

    #[test]
    fn test_timestamp_ordering_breaks_ties_by_change_number() {
        let mut patches = vec![
            Patch::set("a", 1).with_change_number(2).with_timestamp(100),
            Patch::set("b", 1).with_change_number(5).with_timestamp(50),
            Patch::set("c", 1).with_change_number(1).with_timestamp(100),
        ];
        ConflictStrategy::TimestampBased.order(&mut patches);
        assert_eq!(cns(&patches), vec![5, 1, 2]);
    }

    #[test]
    fn test_last_writer_wins_keeps_arrival_order() {
        let mut patches = numbered(&[3, 1, 2]);
        ConflictStrategy::LastWriterWins.order(&mut patches);
        assert_eq!(cns(&patches), vec![3, 1, 2]);
    }

    #[test]
    fn test_parse() {
        assert_eq!(
            "timestamp".parse::<ConflictStrategy>().unwrap(),
            ConflictStrategy::TimestampBased
        );
        assert_eq!(
            "last-writer-wins".parse::<ConflictStrategy>().unwrap(),
            ConflictStrategy::LastWriterWins
        );
        assert!("random".parse::<ConflictStrategy>().is_err());
    }
}
