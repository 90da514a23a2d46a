//! Alias reconciliation.
//!
//! Aliases are moved by deleting and recreating them, never renamed in
//! place, so every plan runs its deletions before its creations. Individual
//! alias failures are collected into an [`AliasReport`] instead of aborting
//! the remaining work.

use std::collections::BTreeSet;
use std::fmt;

use lxbake_core::error::{BakeError, Result};

use crate::server::{AliasEntry, ImageServer};

/// Deletions and creations needed to reach a desired alias set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AliasPlan {
    pub to_delete: Vec<String>,
    pub to_add: Vec<String>,
}

impl AliasPlan {
    /// `to_delete = existing - desired`, `to_add = desired - existing`.
    pub fn diff(existing: &[String], desired: &[String]) -> Self {
        let existing: BTreeSet<&String> = existing.iter().collect();
        let desired: BTreeSet<&String> = desired.iter().collect();

        Self {
            to_delete: existing.difference(&desired).map(|s| s.to_string()).collect(),
            to_add: desired.difference(&existing).map(|s| s.to_string()).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.to_delete.is_empty() && self.to_add.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliasAction {
    Delete,
    Create,
}

impl fmt::Display for AliasAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Delete => write!(f, "remove"),
            Self::Create => write!(f, "create"),
        }
    }
}

/// One alias operation that did not go through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasFailure {
    pub name: String,
    pub action: AliasAction,
    pub error: String,
}

/// Outcome of applying an alias plan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AliasReport {
    pub deleted: Vec<String>,
    pub created: Vec<String>,
    pub failures: Vec<AliasFailure>,
}

impl AliasReport {
    /// True when every planned alias operation succeeded.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Human-readable list of failures, one per line.
    pub fn failure_summary(&self) -> String {
        self.failures
            .iter()
            .map(|f| format!("Failed to {} alias {}: {}", f.action, f.name, f.error))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Apply a plan: all deletions first, then all creations, best effort.
pub async fn apply_plan(server: &dyn ImageServer, plan: &AliasPlan, target: &str) -> AliasReport {
    let mut report = AliasReport::default();

    for name in &plan.to_delete {
        match server.delete_image_alias(name).await {
            Ok(()) => report.deleted.push(name.clone()),
            Err(e) => {
                tracing::warn!(alias = %name, error = %e, "Failed to remove alias");
                report.failures.push(AliasFailure {
                    name: name.clone(),
                    action: AliasAction::Delete,
                    error: e.to_string(),
                });
            }
        }
    }

    for name in &plan.to_add {
        match server.create_image_alias(name, target).await {
            Ok(()) => report.created.push(name.clone()),
            Err(e) => {
                tracing::warn!(alias = %name, target, error = %e, "Failed to create alias");
                report.failures.push(AliasFailure {
                    name: name.clone(),
                    action: AliasAction::Create,
                    error: e.to_string(),
                });
            }
        }
    }

    report
}

/// Move aliases from a previously known set to a desired set.
pub async fn reconcile(
    server: &dyn ImageServer,
    existing: &[String],
    desired: &[String],
    target: &str,
) -> AliasReport {
    let plan = AliasPlan::diff(existing, desired);
    tracing::info!(
        remove = plan.to_delete.len(),
        add = plan.to_add.len(),
        target,
        "Reconciling aliases"
    );
    apply_plan(server, &plan, target).await
}

/// Fail with `AliasConflict` if any desired alias already exists on the store.
///
/// All names are checked before anything is created.
pub async fn check_conflicts(server: &dyn ImageServer, desired: &[String]) -> Result<()> {
    for name in desired {
        if let Some(entry) = server.get_image_alias(name).await? {
            return Err(BakeError::AliasConflict {
                alias: entry.name,
                target: entry.target,
            });
        }
    }
    Ok(())
}

/// Bind every desired alias to `target`, replacing same-named aliases.
///
/// Store aliases whose names are in the desired set are deleted first,
/// then every desired alias is created.
pub async fn ensure_aliases(
    server: &dyn ImageServer,
    desired: &[String],
    target: &str,
) -> Result<AliasReport> {
    if desired.is_empty() {
        return Ok(AliasReport::default());
    }

    let mut names = desired.to_vec();
    names.sort();
    names.dedup();

    let all = server.list_image_aliases().await?;
    let plan = AliasPlan {
        to_delete: existing_aliases(&names, &all)
            .into_iter()
            .map(|entry| entry.name.clone())
            .collect(),
        to_add: names,
    };

    Ok(apply_plan(server, &plan, target).await)
}

/// Entries of `all` whose names appear in `sorted_names` (must be sorted).
pub fn existing_aliases<'a>(sorted_names: &[String], all: &'a [AliasEntry]) -> Vec<&'a AliasEntry> {
    all.iter()
        .filter(|entry| sorted_names.binary_search(&entry.name).is_ok())
        .collect()
}
