//! Column family definitions for the consensus database
//!
//! Each logical store of in-flight consensus data lives in its own column
//! family so that it can be scanned and cleared independently.

/// Column family names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnFamily {
    /// Default column family for misc data
    Default,
    /// Proposals keyed by (height, round)
    Proposals,
    /// Prevotes keyed by (height, round, validator index)
    Prevotes,
    /// Precommits keyed by (height, round, validator index)
    Precommits,
    /// Singleton protocol state record
    Consensus,
}

impl ColumnFamily {
    /// Get the string name for this column family
    pub fn name(&self) -> &'static str {
        match self {
            ColumnFamily::Default => "default",
            ColumnFamily::Proposals => "proposals",
            ColumnFamily::Prevotes => "prevotes",
            ColumnFamily::Precommits => "precommits",
            ColumnFamily::Consensus => "consensus",
        }
    }

    /// Get all column families
    pub fn all() -> &'static [ColumnFamily] {
        &[
            ColumnFamily::Default,
            ColumnFamily::Proposals,
            ColumnFamily::Prevotes,
            ColumnFamily::Precommits,
            ColumnFamily::Consensus,
        ]
    }

    /// Column families holding in-flight round artifacts
    pub fn consensus() -> &'static [ColumnFamily] {
        &[
            ColumnFamily::Proposals,
            ColumnFamily::Prevotes,
            ColumnFamily::Precommits,
            ColumnFamily::Consensus,
        ]
    }

    /// Get column family from name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "default" => Some(ColumnFamily::Default),
            "proposals" => Some(ColumnFamily::Proposals),
            "prevotes" => Some(ColumnFamily::Prevotes),
            "precommits" => Some(ColumnFamily::Precommits),
            "consensus" => Some(ColumnFamily::Consensus),
            _ => None,
        }
    }
}

impl std::fmt::Display for ColumnFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_family_names() {
        assert_eq!(ColumnFamily::Default.name(), "default");
        assert_eq!(ColumnFamily::Proposals.name(), "proposals");
        assert_eq!(ColumnFamily::Prevotes.name(), "prevotes");
        assert_eq!(ColumnFamily::Precommits.name(), "precommits");
        assert_eq!(ColumnFamily::Consensus.name(), "consensus");
    }

    #[test]
    fn test_column_family_from_name() {
        for cf in ColumnFamily::all() {
            assert_eq!(ColumnFamily::from_name(cf.name()), Some(*cf));
        }
        assert_eq!(ColumnFamily::from_name("blocks"), None);
    }

    #[test]
    fn test_consensus_families_exclude_default() {
        assert_eq!(ColumnFamily::consensus().len(), 4);
        assert!(!ColumnFamily::consensus().contains(&ColumnFamily::Default));
    }
}
