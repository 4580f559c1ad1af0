//! Pipeline variants.
//!
//! Three parallel schema variants share one state-machine shape. The engine
//! (queue, embed worker, reconciler) is written once; records carry their
//! variant tag and variant-specific behavior hangs off a descriptor instead
//! of duplicated sweep logic.

use serde::{Deserialize, Serialize};

/// Which of the parallel pipeline schemas owns a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineKind {
    /// The original per-agent ingestion schema.
    Primary,
    /// Primary schema with hybrid (keyword + vector) retrieval tables.
    PrimaryHybrid,
    /// The compact shared-pool schema.
    Compact,
}

impl PipelineKind {
    /// Stable label used in logs and audit payloads.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::PrimaryHybrid => "primary_hybrid",
            Self::Compact => "compact",
        }
    }

    /// All variants, in dispatch order.
    pub fn all() -> [PipelineKind; 3] {
        [Self::Primary, Self::PrimaryHybrid, Self::Compact]
    }
}

impl std::fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_stable() {
        assert_eq!(PipelineKind::Primary.label(), "primary");
        assert_eq!(PipelineKind::PrimaryHybrid.to_string(), "primary_hybrid");
        assert_eq!(PipelineKind::all().len(), 3);
    }
}
