//! # Repair Engine
//!
//! Automatic corrective actions for classified failures. Repairs are
//! idempotent: running one against already-repaired data reports
//! [`RepairOutcome::NothingToFix`].

use crate::classifier::extract_table;
use crate::state::ErrorKind;
use bridge_traits::backend::row_id;
use bridge_traits::BackendClient;
use core_cache::{EntityKind, LocalCache};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairOutcome {
    Repaired { detail: String },
    NothingToFix,
    NotRepairable,
    Failed(String),
}

impl RepairOutcome {
    /// Whether the failed operation is worth re-attempting.
    ///
    /// `NothingToFix` only counts for connection-type failures. A duplicate
    /// key error with no duplicates to remove has another cause.
    pub fn is_success(&self, kind: ErrorKind) -> bool {
        match self {
            RepairOutcome::Repaired { .. } => true,
            RepairOutcome::NothingToFix => {
                matches!(kind, ErrorKind::Connection | ErrorKind::Network)
            }
            RepairOutcome::NotRepairable | RepairOutcome::Failed(_) => false,
        }
    }
}

/// What the repair engine knows about the failure.
#[derive(Debug, Clone, Default)]
pub struct RepairContext {
    /// Table the failure concerns, when the caller knows it.
    pub table: Option<String>,
    pub message: String,
}

impl RepairContext {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            table: None,
            message: message.into(),
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }
}

pub struct RepairEngine {
    backend: Arc<dyn BackendClient>,
    cache: Arc<dyn LocalCache>,
    probe_timeout: Duration,
}

impl RepairEngine {
    pub fn new(
        backend: Arc<dyn BackendClient>,
        cache: Arc<dyn LocalCache>,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            cache,
            probe_timeout,
        }
    }

    #[instrument(skip(self, ctx), fields(table = ?ctx.table))]
    pub async fn repair(&self, kind: ErrorKind, ctx: &RepairContext) -> RepairOutcome {
        let outcome = match kind {
            ErrorKind::DuplicateKey => self.repair_duplicate_key(ctx).await,
            ErrorKind::Connection | ErrorKind::Network => self.revalidate_connection().await,
            ErrorKind::Authentication
            | ErrorKind::ConstraintViolation
            | ErrorKind::Timeout
            | ErrorKind::Unknown => RepairOutcome::NotRepairable,
        };

        debug!(kind = %kind, outcome = ?outcome, "Repair finished");
        outcome
    }

    async fn repair_duplicate_key(&self, ctx: &RepairContext) -> RepairOutcome {
        let settings = EntityKind::Settings.table_name();
        let table = ctx.table.clone().or_else(|| extract_table(&ctx.message));
        if table.as_deref() != Some(settings) {
            debug!(table = ?table, "Duplicate key outside settings is not repairable");
            return RepairOutcome::NotRepairable;
        }

        // Local copy first; it never needs the network.
        match self.cache.collapse_settings().await {
            Ok(removed) if removed > 0 => debug!(removed, "Collapsed local settings"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to collapse local settings"),
        }

        let rows = match self.backend.list_rows(settings).await {
            Ok(rows) => rows,
            Err(e) => return RepairOutcome::Failed(format!("listing settings: {e}")),
        };

        if rows.len() <= 1 {
            return RepairOutcome::NothingToFix;
        }

        let extra: Vec<String> = rows.iter().skip(1).filter_map(row_id).collect();
        if extra.is_empty() {
            return RepairOutcome::NothingToFix;
        }

        match self.backend.delete_rows(settings, &extra).await {
            Ok(removed) => {
                info!(removed, "Removed duplicate settings rows");
                RepairOutcome::Repaired {
                    detail: format!("removed {removed} duplicate settings rows"),
                }
            }
            Err(e) => RepairOutcome::Failed(format!("deleting duplicate settings: {e}")),
        }
    }

    async fn revalidate_connection(&self) -> RepairOutcome {
        match tokio::time::timeout(self.probe_timeout, self.backend.ping()).await {
            Ok(Ok(())) => RepairOutcome::Repaired {
                detail: "backend connection re-validated".to_string(),
            },
            Ok(Err(e)) => RepairOutcome::Failed(e.to_string()),
            Err(_) => RepairOutcome::Failed(format!(
                "backend ping timed out after {:?}",
                self.probe_timeout
            )),
        }
    }
}
