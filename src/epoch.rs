//! Key-epoch state machine.
//!
//! The sealed signer re-keys itself in generations ("epochs"). The
//! coordinator tracks the current epoch plus, during a grace window, the
//! previous one, so enrollments sealed under the old key can lazily re-seal
//! on their next scheduled publish instead of all at once at rotation time.
//! Transitions are persisted by the schedule store; this module holds the
//! types and the pure transition logic.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Singleton record of the signer's key generations.
///
/// Public keys are lowercase hex, validated at the signer-client boundary
/// (65 bytes, uncompressed SEC1 prefix) and treated as opaque afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpochState {
    pub current_epoch: u64,
    pub current_public_key: String,
    #[serde(default)]
    pub previous_epoch: Option<u64>,
    #[serde(default)]
    pub previous_public_key: Option<String>,
    #[serde(default)]
    pub grace_period_ends_at: Option<u64>,
}

/// Append-only record of one epoch rotation. Never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationLogEntry {
    pub from_epoch: u64,
    pub to_epoch: u64,
    pub from_public_key: String,
    pub to_public_key: String,
    pub reason: String,
    pub created_at: u64,
}

/// Result of a deprecate-previous request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeprecateOutcome {
    /// Previous-epoch fields were cleared.
    Cleared,
    /// A previous epoch exists but its grace window has not ended.
    GraceActive,
    /// Nothing to do; no previous epoch is recorded.
    NoPrevious,
}

impl EpochState {
    pub fn new(epoch: u64, public_key: String) -> Self {
        Self {
            current_epoch: epoch,
            current_public_key: public_key,
            previous_epoch: None,
            previous_public_key: None,
            grace_period_ends_at: None,
        }
    }

    /// Whether enrollments sealed under the previous epoch are still honored.
    pub fn is_grace_active(&self, now: u64) -> bool {
        self.previous_epoch.is_some()
            && self.grace_period_ends_at.map(|t| now < t).unwrap_or(false)
    }

    /// Shift current to previous, install the new current key, and open a
    /// fresh grace window. Returns the rotated state together with the log
    /// entry describing the transition; the store commits both in one write.
    pub fn rotated(
        &self,
        to_epoch: u64,
        to_public_key: String,
        reason: String,
        now: u64,
        grace_period: Duration,
    ) -> (Self, RotationLogEntry) {
        let entry = RotationLogEntry {
            from_epoch: self.current_epoch,
            to_epoch,
            from_public_key: self.current_public_key.clone(),
            to_public_key: to_public_key.clone(),
            reason,
            created_at: now,
        };
        let next = Self {
            current_epoch: to_epoch,
            current_public_key: to_public_key,
            previous_epoch: Some(self.current_epoch),
            previous_public_key: Some(self.current_public_key.clone()),
            grace_period_ends_at: Some(now.saturating_add(grace_period.as_secs())),
        };
        (next, entry)
    }

    /// Clear previous-epoch fields once the grace window has passed (or was
    /// never set). Idempotent.
    pub fn deprecate_previous(&mut self, now: u64) -> DeprecateOutcome {
        if self.previous_epoch.is_none() {
            return DeprecateOutcome::NoPrevious;
        }
        if self.is_grace_active(now) {
            return DeprecateOutcome::GraceActive;
        }
        self.previous_epoch = None;
        self.previous_public_key = None;
        self.grace_period_ends_at = None;
        DeprecateOutcome::Cleared
    }
}
