//! Operator-facing summaries of the store, shared by the CLI and HTTP surface.

use std::fmt::Write as _;
use std::path::PathBuf;

use serde::Serialize;

use crate::staging::Staging;
use crate::store::{FailedItem, RetryLimits, StateCounts, Store, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub counts: StateCounts,
    pub total: u64,
    pub complete: bool,
}

impl StatusReport {
    pub async fn gather(store: &Store, limits: RetryLimits) -> Result<Self, StoreError> {
        let counts = store.state_counts().await?;
        let complete = store.is_migration_complete(limits).await?;
        Ok(Self {
            total: counts.total(),
            counts,
            complete,
        })
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (state, count) in self.counts.iter() {
            let _ = writeln!(out, "{:<16}{count:>10}", state.as_str());
        }
        let _ = writeln!(out, "{:<16}{:>10}", "total", self.total);
        let _ = writeln!(
            out,
            "\nMigration {}",
            if self.complete { "complete" } else { "in progress" }
        );
        out
    }
}

/// A finalized item whose staging file is still on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeftoverArtifact {
    pub source_id: String,
    pub path: Option<PathBuf>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureReport {
    pub permanent_failures: Vec<FailedItem>,
    pub leftover_staging: Vec<LeftoverArtifact>,
}

impl FailureReport {
    pub async fn gather(
        store: &Store,
        staging: &Staging,
        limits: RetryLimits,
    ) -> Result<Self, StoreError> {
        let permanent_failures = store.permanent_failures(limits).await?;
        let leftover_staging = store
            .leftover_staging()
            .await?
            .into_iter()
            .map(|item| LeftoverArtifact {
                path: item
                    .content_ref
                    .as_deref()
                    .and_then(|content_ref| staging.path_of(content_ref).ok()),
                source_id: item.source_id,
                last_error: item.last_error,
            })
            .collect();

        Ok(Self {
            permanent_failures,
            leftover_staging,
        })
    }

    pub fn render(&self) -> String {
        let mut out = String::new();

        let _ = writeln!(
            out,
            "Permanently failed items: {}",
            self.permanent_failures.len()
        );
        for item in &self.permanent_failures {
            let _ = writeln!(
                out,
                "  {} [{}, {} attempts]: {}",
                item.source_id,
                item.state,
                item.attempt_count,
                item.last_error.as_deref().unwrap_or("-")
            );
        }

        let _ = writeln!(
            out,
            "\nLeftover staging artifacts: {}",
            self.leftover_staging.len()
        );
        for artifact in &self.leftover_staging {
            let path = artifact
                .path
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "-".to_string());
            let _ = writeln!(out, "  {} -> {path}", artifact.source_id);
        }
        out
    }
}
