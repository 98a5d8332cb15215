//! # Collision Resolution
//!
//! A record can be reachable by two key forms: the triplet
//! (`institutionCode|collectionCode|catalogNumber`) and its occurrenceID. When
//! the evidence changes between runs the two forms can end up bound to
//! different identifiers. [`DeletionPolicy::keys_to_delete`] decides which
//! associations go; [`Remediation`] applies that decision to a store.

use crate::identity::{DeleteOutcome, IdentityError, IdentityStore};
use crate::keys::KeyForms;
use crate::model::{CompositeKey, Identifier};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Closed set of deletion policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeletionPolicy {
    /// Keep the smaller identifier
    #[serde(rename = "min")]
    Min,
    /// Keep the larger identifier
    #[serde(rename = "max")]
    Max,
    /// Keep the occurrenceID form
    #[serde(rename = "occurrenceID")]
    OccurrenceId,
    /// Keep the triplet form
    #[serde(rename = "triplet")]
    Triplet,
    /// Drop both forms so the next run mints afresh
    #[serde(rename = "both")]
    Both,
}

impl DeletionPolicy {
    pub const ALL: [DeletionPolicy; 5] = [
        DeletionPolicy::Min,
        DeletionPolicy::Max,
        DeletionPolicy::OccurrenceId,
        DeletionPolicy::Triplet,
        DeletionPolicy::Both,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeletionPolicy::Min => "min",
            DeletionPolicy::Max => "max",
            DeletionPolicy::OccurrenceId => "occurrenceID",
            DeletionPolicy::Triplet => "triplet",
            DeletionPolicy::Both => "both",
        }
    }

    /// Keys whose association should be removed.
    ///
    /// Returns an empty set unless both forms are associated. With
    /// `only_collisions` the policy acts only when the two identifiers differ;
    /// otherwise the form-based policies also drop the redundant form of an
    /// agreeing pair, while `min`/`max` have nothing to choose between.
    pub fn keys_to_delete(
        &self,
        state: &KeyFormState,
        only_collisions: bool,
    ) -> BTreeSet<CompositeKey> {
        let mut keys = BTreeSet::new();
        let (Some(triplet), Some(occurrence)) = (&state.triplet, &state.occurrence_id) else {
            return keys;
        };
        let collision = triplet.identifier != occurrence.identifier;
        if only_collisions && !collision {
            return keys;
        }

        match self {
            DeletionPolicy::Min if collision => {
                let drop = if triplet.identifier < occurrence.identifier {
                    occurrence
                } else {
                    triplet
                };
                keys.insert(drop.key.clone());
            }
            DeletionPolicy::Max if collision => {
                let drop = if triplet.identifier > occurrence.identifier {
                    occurrence
                } else {
                    triplet
                };
                keys.insert(drop.key.clone());
            }
            DeletionPolicy::Min | DeletionPolicy::Max => {}
            DeletionPolicy::OccurrenceId => {
                keys.insert(triplet.key.clone());
            }
            DeletionPolicy::Triplet => {
                keys.insert(occurrence.key.clone());
            }
            DeletionPolicy::Both => {
                keys.insert(triplet.key.clone());
                keys.insert(occurrence.key.clone());
            }
        }
        keys
    }
}

impl fmt::Display for DeletionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown deletion policy '{0}' (expected min, max, occurrenceID, triplet or both)")]
pub struct UnknownPolicy(pub String);

impl FromStr for DeletionPolicy {
    type Err = UnknownPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        DeletionPolicy::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownPolicy(s.to_string()))
    }
}

/// A key and the identifier it was bound to when read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Association {
    pub key: CompositeKey,
    pub identifier: Identifier,
}

/// Snapshot of the current associations of a record's two key forms.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyFormState {
    pub triplet: Option<Association>,
    pub occurrence_id: Option<Association>,
}

impl KeyFormState {
    /// Read both forms from the store.
    pub fn snapshot(store: &IdentityStore, forms: &KeyForms) -> Result<Self, IdentityError> {
        let read = |key: &Option<CompositeKey>| -> Result<Option<Association>, IdentityError> {
            match key {
                Some(key) => Ok(store.lookup(key)?.map(|identifier| Association {
                    key: key.clone(),
                    identifier,
                })),
                None => Ok(None),
            }
        };
        Ok(Self {
            triplet: read(&forms.triplet)?,
            occurrence_id: read(&forms.occurrence_id)?,
        })
    }

    /// Both forms associated, with different identifiers.
    pub fn is_collision(&self) -> bool {
        match (&self.triplet, &self.occurrence_id) {
            (Some(t), Some(o)) => t.identifier != o.identifier,
            _ => false,
        }
    }

    fn identifier_of(&self, key: &CompositeKey) -> Option<Identifier> {
        [&self.triplet, &self.occurrence_id]
            .into_iter()
            .flatten()
            .find(|a| &a.key == key)
            .map(|a| a.identifier)
    }
}

/// A pair that could not be remediated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemediationFailure {
    pub key: String,
    pub reason: String,
}

/// Outcome of a remediation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemediationReport {
    pub policy: Option<String>,
    pub dry_run: bool,
    /// Pairs looked at
    pub examined: usize,
    /// Pairs whose forms were bound to different identifiers
    pub collisions: usize,
    /// Keys selected by the policy
    pub selected: Vec<String>,
    /// Keys actually removed
    pub deleted: usize,
    /// Keys skipped because their association changed after the snapshot
    pub changed_skipped: usize,
    /// Identifiers left with no key in the reverse index after a delete
    pub retired: Vec<Identifier>,
    pub failures: Vec<RemediationFailure>,
}

/// Operator-triggered remediation over a list of key-form pairs.
pub struct Remediation<'a> {
    store: &'a IdentityStore,
    policy: DeletionPolicy,
    only_collisions: bool,
    dry_run: bool,
}

impl<'a> Remediation<'a> {
    pub fn new(store: &'a IdentityStore, policy: DeletionPolicy) -> Self {
        Self {
            store,
            policy,
            only_collisions: true,
            dry_run: false,
        }
    }

    pub fn only_collisions(mut self, only_collisions: bool) -> Self {
        self.only_collisions = only_collisions;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    #[instrument(skip(self, pairs), fields(policy = %self.policy, only_collisions = self.only_collisions, dry_run = self.dry_run))]
    pub fn run<'p, I>(&self, pairs: I) -> RemediationReport
    where
        I: IntoIterator<Item = &'p KeyForms>,
    {
        let mut report = RemediationReport {
            policy: Some(self.policy.to_string()),
            dry_run: self.dry_run,
            ..Default::default()
        };

        for forms in pairs {
            report.examined += 1;
            if let Err(err) = self.remediate_pair(forms, &mut report) {
                let key = forms
                    .triplet
                    .as_ref()
                    .or(forms.occurrence_id.as_ref())
                    .map(CompositeKey::to_string)
                    .unwrap_or_default();
                warn!(%key, error = %err, "remediation failed for pair");
                report.failures.push(RemediationFailure {
                    key,
                    reason: err.to_string(),
                });
            }
        }

        info!(
            examined = report.examined,
            collisions = report.collisions,
            deleted = report.deleted,
            changed_skipped = report.changed_skipped,
            retired = report.retired.len(),
            failures = report.failures.len(),
            "remediation finished"
        );
        report
    }

    fn remediate_pair(
        &self,
        forms: &KeyForms,
        report: &mut RemediationReport,
    ) -> Result<(), IdentityError> {
        let state = KeyFormState::snapshot(self.store, forms)?;
        if state.is_collision() {
            report.collisions += 1;
        }
        let keys = self.policy.keys_to_delete(&state, self.only_collisions);
        for key in keys {
            report.selected.push(key.to_string());
            if self.dry_run {
                continue;
            }
            let Some(expected) = state.identifier_of(&key) else {
                continue;
            };
            match self.store.delete_expected(&key, expected)? {
                DeleteOutcome::Deleted(id) => {
                    report.deleted += 1;
                    if self.store.reverse_lookup(&id)?.is_empty() {
                        debug!(%key, %id, "identifier retired");
                        report.retired.push(id);
                    }
                }
                DeleteOutcome::Absent | DeleteOutcome::Changed(_) => {
                    debug!(%key, "association changed since snapshot, skipped");
                    report.changed_skipped += 1;
                }
            }
        }
        Ok(())
    }
}
