//! Durable schedule store.
//!
//! One row per enrolled IPNS name, plus the epoch singleton and the
//! append-only rotation log, all held in a single JSON document that is
//! rewritten atomically (write to temp, rename over) after every mutation.
//! A mutation therefore either lands completely or leaves the previous
//! on-disk document intact.

use std::{
    collections::BTreeMap,
    fmt, fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::epoch::{DeprecateOutcome, EpochState, RotationLogEntry};
use crate::error::StoreError;

/// Hard cap on rows handed to the scheduler per tick. Rows beyond the cap
/// stay due and roll to the next tick.
pub const DUE_LIMIT: usize = 500;

/// Where stale rows are parked until an operator reactivates them.
const STALE_PARK_SECS: u64 = 365 * 24 * 60 * 60;

/// Stored error messages are clipped to this many characters.
const MAX_ERROR_LEN: usize = 500;

const MAX_NAME_LEN: usize = 255;

pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnrollmentStatus {
    Active,
    Retrying,
    Stale,
}

/// One `(owner, ipns_name)` pair under coordinator management.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Enrollment {
    pub id: u64,
    pub owner: String,
    pub ipns_name: String,
    /// Base64 sealed IPNS private key. Opaque: never decoded, never logged.
    pub sealed_key: String,
    /// Signer epoch under which `sealed_key` was sealed. Rewritten only
    /// together with `sealed_key`.
    pub key_epoch: u64,
    pub latest_cid: String,
    /// Decimal string holding a u64; stays a string across process
    /// boundaries to avoid precision loss.
    pub sequence_number: String,
    pub next_due_at: u64,
    #[serde(default)]
    pub last_published_at: Option<u64>,
    #[serde(default)]
    pub consecutive_failures: u32,
    pub status: EnrollmentStatus,
    #[serde(default)]
    pub last_error: Option<String>,
}

// Manual Debug: sealed key bytes stay out of logs and panic output.
impl fmt::Debug for Enrollment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Enrollment")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("ipns_name", &self.ipns_name)
            .field("sealed_key", &"<sealed>")
            .field("key_epoch", &self.key_epoch)
            .field("latest_cid", &self.latest_cid)
            .field("sequence_number", &self.sequence_number)
            .field("next_due_at", &self.next_due_at)
            .field("last_published_at", &self.last_published_at)
            .field("consecutive_failures", &self.consecutive_failures)
            .field("status", &self.status)
            .field("last_error", &self.last_error)
            .finish()
    }
}

/// Sealed-key replacement returned by the signer alongside a successful
/// signature. Applied atomically with the success record.
#[derive(Clone)]
pub struct KeyUpgrade {
    pub sealed_key: String,
    pub key_epoch: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCounts {
    pub pending: usize,
    pub retrying: usize,
    pub stale: usize,
}

/// Scheduling knobs the store applies on every mutation.
#[derive(Debug, Clone)]
pub struct StorePolicy {
    /// How far out a successful publish schedules the next one.
    pub publish_interval: Duration,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Consecutive-failure count at which a row turns stale.
    pub max_failures: u32,
    /// How long a deposed epoch keeps being offered to the signer.
    pub grace_period: Duration,
}

impl StorePolicy {
    /// `min(base × 2ⁿ, max)` with n = the row's failure count after the
    /// increment. Must remain fast for arbitrarily large counts.
    pub fn backoff_secs(&self, consecutive_failures: u32) -> u64 {
        let max = self.max_backoff.as_secs().max(1);
        let base = self.base_backoff.as_secs().min(max);
        let exp = consecutive_failures.min(63);
        base.saturating_mul(1u64 << exp).min(max)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreDoc {
    #[serde(default = "first_id")]
    next_id: u64,
    #[serde(default)]
    enrollments: BTreeMap<u64, Enrollment>,
    #[serde(default)]
    epoch: Option<EpochState>,
    #[serde(default)]
    rotation_log: Vec<RotationLogEntry>,
}

fn first_id() -> u64 {
    1
}

impl Default for StoreDoc {
    fn default() -> Self {
        Self {
            next_id: 1,
            enrollments: BTreeMap::new(),
            epoch: None,
            rotation_log: Vec::new(),
        }
    }
}

/// Shared handle used by the scheduler and the admin surface. The lock is
/// held per operation, never across signer or publisher awaits.
pub type SharedStore = Arc<Mutex<ScheduleStore>>;

pub struct ScheduleStore {
    path: PathBuf,
    policy: StorePolicy,
    doc: StoreDoc,
}

impl ScheduleStore {
    pub fn load_or_init(path: impl AsRef<Path>, policy: StorePolicy) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            let raw = fs::read_to_string(&path)
                .map_err(|e| StoreError::Io(format!("failed to read {}: {e}", path.display())))?;
            let doc: StoreDoc = serde_json::from_str(&raw)
                .map_err(|e| StoreError::Io(format!("failed to parse {}: {e}", path.display())))?;
            return Ok(Self { path, policy, doc });
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Io(format!("failed to create {}: {e}", parent.display()))
                })?;
            }
        }

        let store = Self {
            path,
            policy,
            doc: StoreDoc::default(),
        };
        store.save()?;
        Ok(store)
    }

    pub fn into_shared(self) -> SharedStore {
        Arc::new(Mutex::new(self))
    }

    pub fn policy(&self) -> &StorePolicy {
        &self.policy
    }

    fn save(&self) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(&self.doc)
            .map_err(|e| StoreError::Io(format!("failed to serialize state: {e}")))?;

        // Write to a temp file then rename so an interrupted write cannot
        // corrupt the live document.
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, json)
            .map_err(|e| StoreError::Io(format!("failed to write {}: {e}", tmp_path.display())))?;

        // On Unix, rename replaces the destination; on Windows it fails if
        // the destination exists, so remove then rename.
        if let Err(err) = fs::rename(&tmp_path, &self.path) {
            if cfg!(windows) {
                let _ = fs::remove_file(&self.path);
                fs::rename(&tmp_path, &self.path).map_err(|e| {
                    StoreError::Io(format!("failed to replace {}: {e}", self.path.display()))
                })?;
            } else {
                return Err(StoreError::Io(format!(
                    "failed to replace {}: {err}",
                    self.path.display()
                )));
            }
        }
        Ok(())
    }

    // ── Enrollment rows (C1) ─────────────────────────────────────────────

    /// Rows the scheduler should work on now: status active or retrying,
    /// due time reached, ordered by due time (then id, for determinism).
    pub fn due(&self, limit: usize) -> Vec<Enrollment> {
        let now = now_unix();
        let mut rows: Vec<&Enrollment> = self
            .doc
            .enrollments
            .values()
            .filter(|e| {
                matches!(
                    e.status,
                    EnrollmentStatus::Active | EnrollmentStatus::Retrying
                ) && e.next_due_at <= now
            })
            .collect();
        rows.sort_by_key(|e| (e.next_due_at, e.id));
        rows.into_iter()
            .take(limit.min(DUE_LIMIT))
            .cloned()
            .collect()
    }

    pub fn get(&self, owner: &str, ipns_name: &str) -> Option<&Enrollment> {
        self.doc
            .enrollments
            .values()
            .find(|e| e.owner == owner && e.ipns_name == ipns_name)
    }

    /// Register or refresh an enrollment (the C6 entrypoint). Always resets
    /// the row to a healthy schedule: active, zero failures, due one publish
    /// interval from now.
    pub fn upsert_enrollment(
        &mut self,
        owner: &str,
        ipns_name: &str,
        sealed_key: &str,
        key_epoch: u64,
        latest_cid: &str,
        sequence_number: &str,
    ) -> Result<u64, StoreError> {
        validate_name("ipns_name", ipns_name)?;
        validate_name("latest_cid", latest_cid)?;
        validate_sequence(sequence_number)?;
        if sealed_key.is_empty() {
            return Err(StoreError::InvalidField {
                field: "sealed_key",
                reason: "must not be empty".into(),
            });
        }

        // One owner per ipns name; the name is derived from the key pair and
        // cannot legitimately belong to two users.
        if self
            .doc
            .enrollments
            .values()
            .any(|e| e.ipns_name == ipns_name && e.owner != owner)
        {
            return Err(StoreError::Conflict {
                ipns_name: ipns_name.to_string(),
            });
        }

        let now = now_unix();
        let next_due_at = now.saturating_add(self.policy.publish_interval.as_secs());

        let id = match self
            .doc
            .enrollments
            .values_mut()
            .find(|e| e.owner == owner && e.ipns_name == ipns_name)
        {
            Some(row) => {
                row.sealed_key = sealed_key.to_string();
                row.key_epoch = key_epoch;
                row.latest_cid = latest_cid.to_string();
                row.sequence_number = sequence_number.to_string();
                row.status = EnrollmentStatus::Active;
                row.consecutive_failures = 0;
                row.last_error = None;
                row.next_due_at = next_due_at;
                row.id
            }
            None => {
                let id = self.doc.next_id;
                self.doc.next_id += 1;
                self.doc.enrollments.insert(
                    id,
                    Enrollment {
                        id,
                        owner: owner.to_string(),
                        ipns_name: ipns_name.to_string(),
                        sealed_key: sealed_key.to_string(),
                        key_epoch,
                        latest_cid: latest_cid.to_string(),
                        sequence_number: sequence_number.to_string(),
                        next_due_at,
                        last_published_at: None,
                        consecutive_failures: 0,
                        status: EnrollmentStatus::Active,
                        last_error: None,
                    },
                );
                id
            }
        };

        self.save()?;
        Ok(id)
    }

    /// Record a successful publish. If the signer re-sealed the key under a
    /// new epoch, both sealed fields are rewritten in the same write as the
    /// success record.
    pub fn record_success(
        &mut self,
        id: u64,
        new_sequence_number: Option<&str>,
        upgrade: Option<KeyUpgrade>,
    ) -> Result<(), StoreError> {
        let now = now_unix();
        let next_due_at = now.saturating_add(self.policy.publish_interval.as_secs());

        let row = self
            .doc
            .enrollments
            .get_mut(&id)
            .ok_or(StoreError::UnknownId(id))?;

        if let Some(seq) = new_sequence_number {
            row.sequence_number = seq.to_string();
        }
        if let Some(upgrade) = upgrade {
            row.sealed_key = upgrade.sealed_key;
            row.key_epoch = upgrade.key_epoch;
        }
        row.last_published_at = Some(now);
        row.consecutive_failures = 0;
        row.status = EnrollmentStatus::Active;
        row.last_error = None;
        row.next_due_at = next_due_at;

        self.save()
    }

    /// Record a failed attempt: bump the failure counter, store the clipped
    /// error, and either back the row off or park it as stale once the
    /// failure threshold is reached.
    pub fn record_failure(&mut self, id: u64, error: &str) -> Result<(), StoreError> {
        let now = now_unix();
        let max_failures = self.policy.max_failures;
        let row = self
            .doc
            .enrollments
            .get_mut(&id)
            .ok_or(StoreError::UnknownId(id))?;

        row.consecutive_failures = row.consecutive_failures.saturating_add(1);
        row.last_error = Some(truncate_error(error));

        if row.consecutive_failures >= max_failures {
            row.status = EnrollmentStatus::Stale;
            row.next_due_at = now.saturating_add(STALE_PARK_SECS);
        } else {
            row.status = EnrollmentStatus::Retrying;
            let backoff = self.policy.backoff_secs(row.consecutive_failures);
            row.next_due_at = now.saturating_add(backoff);
        }

        self.save()
    }

    /// Put every stale row back in rotation with an immediate due time.
    /// Returns how many rows were switched; calling it again right away
    /// returns 0.
    pub fn reactivate_stale(&mut self) -> Result<usize, StoreError> {
        let now = now_unix();
        let mut switched = 0usize;
        for row in self.doc.enrollments.values_mut() {
            if row.status == EnrollmentStatus::Stale {
                row.status = EnrollmentStatus::Active;
                row.consecutive_failures = 0;
                row.next_due_at = now;
                switched += 1;
            }
        }
        if switched > 0 {
            self.save()?;
        }
        Ok(switched)
    }

    pub fn remove_enrollment(&mut self, owner: &str, ipns_name: &str) -> Result<bool, StoreError> {
        let id = self.get(owner, ipns_name).map(|e| e.id);
        match id {
            Some(id) => {
                self.doc.enrollments.remove(&id);
                self.save()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Owner deletion cascade: drop every enrollment belonging to `owner`.
    pub fn remove_owner(&mut self, owner: &str) -> Result<usize, StoreError> {
        let before = self.doc.enrollments.len();
        self.doc.enrollments.retain(|_, e| e.owner != owner);
        let removed = before - self.doc.enrollments.len();
        if removed > 0 {
            self.save()?;
        }
        Ok(removed)
    }

    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for e in self.doc.enrollments.values() {
            match e.status {
                EnrollmentStatus::Active => counts.pending += 1,
                EnrollmentStatus::Retrying => counts.retrying += 1,
                EnrollmentStatus::Stale => counts.stale += 1,
            }
        }
        counts
    }

    /// Most recent successful publish across healthy rows.
    pub fn last_run_at(&self) -> Option<u64> {
        self.doc
            .enrollments
            .values()
            .filter(|e| e.status == EnrollmentStatus::Active)
            .filter_map(|e| e.last_published_at)
            .max()
    }

    // ── Epoch singleton (C2) ─────────────────────────────────────────────

    pub fn epoch_state(&self) -> Option<EpochState> {
        self.doc.epoch.clone()
    }

    pub fn initialize_epoch(&mut self, epoch: u64, public_key: String) -> Result<(), StoreError> {
        if let Some(existing) = &self.doc.epoch {
            return Err(StoreError::EpochAlreadyInitialized {
                current: existing.current_epoch,
            });
        }
        self.doc.epoch = Some(EpochState::new(epoch, public_key));
        self.save()
    }

    /// Rotate to a new signer epoch: the rotation-log append and the
    /// singleton rewrite land in the same document write.
    pub fn rotate_epoch(
        &mut self,
        to_epoch: u64,
        to_public_key: String,
        reason: String,
    ) -> Result<(), StoreError> {
        let current = self.doc.epoch.as_ref().ok_or(StoreError::EpochNotInitialized)?;
        let (next, entry) = current.rotated(
            to_epoch,
            to_public_key,
            reason,
            now_unix(),
            self.policy.grace_period,
        );
        self.doc.epoch = Some(next);
        self.doc.rotation_log.push(entry);
        self.save()
    }

    pub fn deprecate_previous_epoch(&mut self) -> Result<DeprecateOutcome, StoreError> {
        let Some(epoch) = self.doc.epoch.as_mut() else {
            return Ok(DeprecateOutcome::NoPrevious);
        };
        let outcome = epoch.deprecate_previous(now_unix());
        if outcome == DeprecateOutcome::Cleared {
            self.save()?;
        }
        Ok(outcome)
    }

    /// Rewrite every row as due immediately. Test-only time travel; the
    /// production schedule is only ever moved by the mutations above.
    #[cfg(test)]
    pub(crate) fn force_due_now(&mut self) {
        let now = now_unix();
        for row in self.doc.enrollments.values_mut() {
            row.next_due_at = now;
        }
    }

    /// Rotation log, most recent first.
    pub fn epoch_history(&self, limit: usize) -> Vec<RotationLogEntry> {
        self.doc
            .rotation_log
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }
}

fn validate_name(field: &'static str, value: &str) -> Result<(), StoreError> {
    if value.is_empty() {
        return Err(StoreError::InvalidField {
            field,
            reason: "must not be empty".into(),
        });
    }
    if !value.is_ascii() {
        return Err(StoreError::InvalidField {
            field,
            reason: "must be ASCII".into(),
        });
    }
    if value.len() > MAX_NAME_LEN {
        return Err(StoreError::InvalidField {
            field,
            reason: format!("must be at most {MAX_NAME_LEN} bytes, got {}", value.len()),
        });
    }
    Ok(())
}

fn validate_sequence(value: &str) -> Result<(), StoreError> {
    value
        .parse::<u64>()
        .map(|_| ())
        .map_err(|_| StoreError::InvalidField {
            field: "sequence_number",
            reason: format!("'{value}' is not a decimal u64"),
        })
}

// Char-boundary-safe clip; byte slicing can panic mid-codepoint.
fn truncate_error(msg: &str) -> String {
    msg.chars().take(MAX_ERROR_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_policy() -> StorePolicy {
        StorePolicy {
            publish_interval: Duration::from_secs(6 * 60 * 60),
            base_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(60 * 60),
            max_failures: 10,
            grace_period: Duration::from_secs(4 * 7 * 24 * 60 * 60),
        }
    }

    fn open(dir: &TempDir) -> ScheduleStore {
        ScheduleStore::load_or_init(dir.path().join("state.json"), test_policy()).unwrap()
    }

    fn enroll(store: &mut ScheduleStore, owner: &str, name: &str) -> u64 {
        store
            .upsert_enrollment(owner, name, "c2VhbGVk", 1, "bafyexample", "5")
            .unwrap()
    }

    #[test]
    fn backoff_law() {
        let policy = test_policy();
        assert_eq!(policy.backoff_secs(0), 30);
        assert_eq!(policy.backoff_secs(1), 60);
        assert_eq!(policy.backoff_secs(2), 120);
        assert_eq!(policy.backoff_secs(7), 3600, "clamped to max");
        assert_eq!(policy.backoff_secs(63), 3600);
        assert_eq!(policy.backoff_secs(u32::MAX), 3600);
    }

    #[test]
    fn upsert_creates_active_row_due_one_interval_out() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir);
        let now = now_unix();

        enroll(&mut store, "user-1", "k51example");
        let row = store.get("user-1", "k51example").unwrap();
        assert_eq!(row.status, EnrollmentStatus::Active);
        assert_eq!(row.consecutive_failures, 0);
        assert_eq!(row.sequence_number, "5");
        assert!(row.next_due_at >= now + 6 * 60 * 60 - 2);
        assert!(row.next_due_at <= now + 6 * 60 * 60 + 2);
    }

    #[test]
    fn upsert_twice_is_observationally_one_upsert() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir);

        let id1 = enroll(&mut store, "user-1", "k51example");
        let id2 = enroll(&mut store, "user-1", "k51example");
        assert_eq!(id1, id2, "refresh keeps the row id");

        let row = store.get("user-1", "k51example").unwrap().clone();
        assert_eq!(row.status, EnrollmentStatus::Active);
        assert_eq!(row.consecutive_failures, 0);
        assert!(row.last_error.is_none());
        assert_eq!(store.status_counts().pending, 1);
    }

    #[test]
    fn upsert_rejects_name_owned_by_someone_else() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir);

        enroll(&mut store, "user-1", "k51example");
        let err = store
            .upsert_enrollment("user-2", "k51example", "c2VhbGVk", 1, "bafy", "1")
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[test]
    fn upsert_guards_inputs() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir);

        let long = "a".repeat(256);
        assert!(matches!(
            store.upsert_enrollment("u", &long, "x", 1, "cid", "1"),
            Err(StoreError::InvalidField { field: "ipns_name", .. })
        ));
        assert!(matches!(
            store.upsert_enrollment("u", "name", "x", 1, "cid", "not-a-number"),
            Err(StoreError::InvalidField { field: "sequence_number", .. })
        ));
        assert!(matches!(
            store.upsert_enrollment("u", "nöm", "x", 1, "cid", "1"),
            Err(StoreError::InvalidField { field: "ipns_name", .. })
        ));
        assert!(matches!(
            store.upsert_enrollment("u", "name", "", 1, "cid", "1"),
            Err(StoreError::InvalidField { field: "sealed_key", .. })
        ));
    }

    #[test]
    fn record_failure_backs_off_then_parks_stale() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir);
        let id = enroll(&mut store, "user-1", "k51example");
        let now = now_unix();

        store.record_failure(id, "signer unreachable: connection refused").unwrap();
        let row = store.get("user-1", "k51example").unwrap().clone();
        assert_eq!(row.status, EnrollmentStatus::Retrying);
        assert_eq!(row.consecutive_failures, 1);
        assert!(row.next_due_at >= now + 60 - 2 && row.next_due_at <= now + 60 + 2);

        for _ in 0..9 {
            store.record_failure(id, "still down").unwrap();
        }
        let row = store.get("user-1", "k51example").unwrap().clone();
        assert_eq!(row.status, EnrollmentStatus::Stale);
        assert_eq!(row.consecutive_failures, 10);
        assert_eq!(row.last_error.as_deref(), Some("still down"));
        assert!(row.next_due_at >= now + STALE_PARK_SECS - 2);
    }

    #[test]
    fn stale_iff_failures_at_threshold() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir);
        let id = enroll(&mut store, "user-1", "k51example");

        for i in 1..=12u32 {
            store.record_failure(id, "boom").unwrap();
            let row = store.get("user-1", "k51example").unwrap();
            assert_eq!(
                row.status == EnrollmentStatus::Stale,
                row.consecutive_failures >= 10,
                "at failure {i}"
            );
        }
    }

    #[test]
    fn record_success_resets_row_and_applies_upgrade_atomically() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir);
        let id = enroll(&mut store, "user-1", "k51example");
        store.record_failure(id, "transient").unwrap();

        store
            .record_success(
                id,
                Some("6"),
                Some(KeyUpgrade {
                    sealed_key: "bmV3LXNlYWw=".into(),
                    key_epoch: 2,
                }),
            )
            .unwrap();

        let row = store.get("user-1", "k51example").unwrap().clone();
        assert_eq!(row.sequence_number, "6");
        assert_eq!(row.sealed_key, "bmV3LXNlYWw=");
        assert_eq!(row.key_epoch, 2);
        assert_eq!(row.status, EnrollmentStatus::Active);
        assert_eq!(row.consecutive_failures, 0);
        assert!(row.last_error.is_none());
        assert!(row.last_published_at.is_some());
    }

    #[test]
    fn last_error_is_clipped_to_500_chars() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir);
        let id = enroll(&mut store, "user-1", "k51example");

        let huge = "x".repeat(2_000);
        store.record_failure(id, &huge).unwrap();
        let row = store.get("user-1", "k51example").unwrap();
        assert_eq!(row.last_error.as_ref().unwrap().chars().count(), 500);
    }

    #[test]
    fn due_respects_order_and_cap() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir);

        for i in 0..505 {
            enroll(&mut store, "user-1", &format!("k51name{i:03}"));
        }
        // Fresh enrollments are scheduled 6h out, so nothing is due yet.
        assert!(store.due(DUE_LIMIT).is_empty());

        // Force everything due by rewriting due times directly.
        let now = now_unix();
        for (i, row) in store.doc.enrollments.values_mut().enumerate() {
            row.next_due_at = now.saturating_sub(1_000 - i as u64);
        }
        let due = store.due(DUE_LIMIT);
        assert_eq!(due.len(), 500, "501st rolls to the next tick");
        assert!(due.windows(2).all(|w| w[0].next_due_at <= w[1].next_due_at));

        // Stale rows are never handed out.
        let first_id = due[0].id;
        for _ in 0..10 {
            store.record_failure(first_id, "dead").unwrap();
        }
        assert!(store.due(DUE_LIMIT).iter().all(|e| e.id != first_id));
    }

    #[test]
    fn reactivate_stale_twice_second_is_zero() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir);
        let now = now_unix();

        for name in ["k51a", "k51b", "k51c"] {
            let id = enroll(&mut store, "user-1", name);
            for _ in 0..10 {
                store.record_failure(id, "down").unwrap();
            }
        }
        assert_eq!(store.status_counts().stale, 3);

        assert_eq!(store.reactivate_stale().unwrap(), 3);
        let counts = store.status_counts();
        assert_eq!(counts.pending, 3);
        assert_eq!(counts.stale, 0);
        for name in ["k51a", "k51b", "k51c"] {
            let row = store.get("user-1", name).unwrap();
            assert_eq!(row.consecutive_failures, 0);
            assert!(row.next_due_at <= now + 2, "immediately due");
        }

        assert_eq!(store.reactivate_stale().unwrap(), 0);
    }

    #[test]
    fn remove_owner_cascades() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir);
        enroll(&mut store, "user-1", "k51a");
        enroll(&mut store, "user-1", "k51b");
        enroll(&mut store, "user-2", "k51c");

        assert_eq!(store.remove_owner("user-1").unwrap(), 2);
        assert!(store.get("user-1", "k51a").is_none());
        assert!(store.get("user-2", "k51c").is_some());
        assert!(store.remove_enrollment("user-2", "k51c").unwrap());
        assert!(!store.remove_enrollment("user-2", "k51c").unwrap());
    }

    #[test]
    fn state_survives_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        {
            let mut store = ScheduleStore::load_or_init(&path, test_policy()).unwrap();
            let id = store
                .upsert_enrollment("user-1", "k51example", "c2VhbGVk", 1, "bafy", "5")
                .unwrap();
            store.record_failure(id, "transient").unwrap();
            store.initialize_epoch(1, hex::encode([4u8; 65])).unwrap();
        }
        let store = ScheduleStore::load_or_init(&path, test_policy()).unwrap();
        let row = store.get("user-1", "k51example").unwrap();
        assert_eq!(row.status, EnrollmentStatus::Retrying);
        assert_eq!(row.consecutive_failures, 1);
        assert_eq!(store.epoch_state().unwrap().current_epoch, 1);
    }

    #[test]
    fn epoch_initialize_rotate_history() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir);

        assert!(matches!(
            store.rotate_epoch(2, hex::encode([4u8; 65]), "too early".into()),
            Err(StoreError::EpochNotInitialized)
        ));

        store.initialize_epoch(1, hex::encode([4u8; 65])).unwrap();
        assert!(matches!(
            store.initialize_epoch(1, hex::encode([4u8; 65])),
            Err(StoreError::EpochAlreadyInitialized { current: 1 })
        ));

        store
            .rotate_epoch(2, hex::encode([5u8; 65]), "signer announced epoch 2".into())
            .unwrap();
        store
            .rotate_epoch(3, hex::encode([6u8; 65]), "signer announced epoch 3".into())
            .unwrap();

        let state = store.epoch_state().unwrap();
        assert_eq!(state.current_epoch, 3);
        assert_eq!(state.previous_epoch, Some(2));
        assert!(state.is_grace_active(now_unix()));

        let history = store.epoch_history(10);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].to_epoch, 3, "most recent first");
        assert_eq!(history[1].to_epoch, 2);
        assert_eq!(store.epoch_history(1).len(), 1);

        // Grace is active, so deprecation refuses.
        assert_eq!(
            store.deprecate_previous_epoch().unwrap(),
            DeprecateOutcome::GraceActive
        );
    }
}
