//! SQL function kinds exposed by the extension.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The seven LLM functions. Order is fixed and used as an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionKind {
    Complete,
    Filter,
    Embedding,
    Reduce,
    Rerank,
    First,
    Last,
}

impl FunctionKind {
    pub const COUNT: usize = 7;

    pub const ALL: [FunctionKind; Self::COUNT] = [
        Self::Complete,
        Self::Filter,
        Self::Embedding,
        Self::Reduce,
        Self::Rerank,
        Self::First,
        Self::Last,
    ];

    /// SQL name, also the prefix of metrics keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "llm_complete",
            Self::Filter => "llm_filter",
            Self::Embedding => "llm_embedding",
            Self::Reduce => "llm_reduce",
            Self::Rerank => "llm_rerank",
            Self::First => "llm_first",
            Self::Last => "llm_last",
        }
    }

    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self, Self::Reduce | Self::Rerank | Self::First | Self::Last)
    }
}

impl fmt::Display for FunctionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_roundtrip() {
        for kind in FunctionKind::ALL {
            assert_eq!(FunctionKind::from_index(kind.index()), Some(kind));
        }
        assert_eq!(FunctionKind::from_index(FunctionKind::COUNT), None);
    }

    #[test]
    fn test_names() {
        assert_eq!(FunctionKind::Complete.to_string(), "llm_complete");
        assert_eq!(FunctionKind::Last.as_str(), "llm_last");
        assert!(FunctionKind::Rerank.is_aggregate());
        assert!(!FunctionKind::Embedding.is_aggregate());
    }
}
