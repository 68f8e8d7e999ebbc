//! Batch scheduler.
//!
//! One run: select due enrollments, chunk them, have the sealed signer
//! re-sign each chunk, publish the signed records to delegated routing, and
//! write every per-entry outcome back to the store. Failures never escape a
//! run; they become `record_failure` rows and backoff.

use std::{collections::HashMap, time::Instant};

use eyre::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::PublishError;
use crate::metrics::{
    SCHEDULER_BATCH_DURATION_SECONDS, SCHEDULER_ENTRIES_PROCESSED_TOTAL, SCHEDULER_RUNS_TOTAL,
};
use crate::publisher::RecordPublisher;
use crate::signer::{RepublishEntry, RepublishResult, SignerApi};
use crate::store::{Enrollment, KeyUpgrade, SharedStore, DUE_LIMIT};

/// Per-run accounting. `succeeded + failed = processed`, always.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOutcome {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Best-effort mirror of a freshly published sequence number, consumed by
/// collaborator code that keeps its own folder table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceUpdate {
    pub owner: String,
    pub ipns_name: String,
    pub sequence_number: String,
}

pub type SequenceMirror = mpsc::UnboundedSender<SequenceUpdate>;

/// Reconcile the stored epoch singleton with what the signer reports.
///
/// First successful contact initialises the singleton; a later, higher epoch
/// from the signer triggers a rotation (grace window opens for the deposed
/// key). A key failing the format check propagates as an error and leaves
/// the epoch state untouched.
pub async fn sync_epoch<S: SignerApi + Sync>(store: &SharedStore, signer: &S) -> Result<()> {
    let health = signer.health().await?;
    if !health.healthy {
        tracing::warn!(epoch = health.epoch, "signer reports unhealthy; leaving epoch state as is");
        return Ok(());
    }

    let current = store.lock().await.epoch_state();
    match current {
        None => {
            let key = signer.public_key(health.epoch).await?;
            store
                .lock()
                .await
                .initialize_epoch(health.epoch, hex::encode(key))?;
            tracing::info!(epoch = health.epoch, "epoch state initialised from signer");
        }
        Some(state) if health.epoch > state.current_epoch => {
            let key = signer.public_key(health.epoch).await?;
            store.lock().await.rotate_epoch(
                health.epoch,
                hex::encode(key),
                format!("signer announced epoch {}", health.epoch),
            )?;
            tracing::info!(
                from = state.current_epoch,
                to = health.epoch,
                "rotated to new signer epoch"
            );
        }
        Some(state) if health.epoch < state.current_epoch => {
            tracing::warn!(
                stored = state.current_epoch,
                reported = health.epoch,
                "signer reports an older epoch than stored; ignoring"
            );
        }
        Some(_) => {}
    }
    Ok(())
}

/// Execute one scheduler run.
///
/// Per-entry and per-chunk errors are recorded in the store and counted in
/// the returned outcome; only a failure to read the due set aborts the run.
pub async fn run_once<S, P>(
    store: &SharedStore,
    signer: &S,
    publisher: &P,
    batch_size: usize,
    mirror: Option<&SequenceMirror>,
    cancel: &CancellationToken,
) -> Result<RunOutcome>
where
    S: SignerApi + Sync,
    P: RecordPublisher + Sync,
{
    let started = Instant::now();
    let due = store.lock().await.due(DUE_LIMIT);

    if due.is_empty() {
        metrics::counter!(SCHEDULER_RUNS_TOTAL, "result" => "empty").increment(1);
        tracing::debug!("no enrollments due");
        return Ok(RunOutcome::default());
    }

    let mut outcome = RunOutcome::default();
    let epoch = store.lock().await.epoch_state();

    let Some(epoch) = epoch else {
        // Cold start: nothing can be signed until the signer has been
        // reached once. Back everything off through the normal path.
        for entry in &due {
            fail_entry(store, entry, "signer not initialised", &mut outcome).await;
        }
        outcome.processed = due.len();
        finish_run(started, &outcome);
        return Ok(outcome);
    };

    for chunk in due.chunks(batch_size.max(1)) {
        if cancel.is_cancelled() {
            tracing::info!(
                remaining = outcome_remaining(&due, &outcome),
                "run cancelled between chunks; remaining entries stay due"
            );
            break;
        }

        let payload: Vec<RepublishEntry> = chunk
            .iter()
            .map(|e| RepublishEntry {
                encrypted_ipns_key: e.sealed_key.clone(),
                key_epoch: e.key_epoch,
                ipns_name: e.ipns_name.clone(),
                latest_cid: e.latest_cid.clone(),
                sequence_number: e.sequence_number.clone(),
                current_epoch: epoch.current_epoch,
                previous_epoch: epoch.previous_epoch,
            })
            .collect();

        let results = match signer.sign_batch(payload).await {
            Ok(results) => results,
            Err(err) => {
                // The whole chunk is lost; later chunks may still go
                // through (e.g. a mid-run signer restart).
                tracing::warn!(chunk_len = chunk.len(), error = %err, "sign batch failed");
                let msg = format!("signer unreachable: {err}");
                for entry in chunk {
                    fail_entry(store, entry, &msg, &mut outcome).await;
                }
                outcome.processed += chunk.len();
                continue;
            }
        };

        let by_name: HashMap<&str, &RepublishResult> = results
            .iter()
            .map(|r| (r.ipns_name.as_str(), r))
            .collect();

        for entry in chunk {
            outcome.processed += 1;
            match by_name.get(entry.ipns_name.as_str()) {
                None => {
                    fail_entry(store, entry, "no result from signer", &mut outcome).await;
                }
                Some(result) if !result.success => {
                    let msg = result.error.as_deref().unwrap_or("unknown signer error");
                    fail_entry(store, entry, msg, &mut outcome).await;
                }
                Some(result) => {
                    let Some(signed_record) = result.signed_record.as_deref() else {
                        fail_entry(
                            store,
                            entry,
                            "signer returned success without a signed record",
                            &mut outcome,
                        )
                        .await;
                        continue;
                    };
                    match publisher.publish(&entry.ipns_name, signed_record).await {
                        Ok(()) => {
                            succeed_entry(store, entry, result, mirror, &mut outcome).await;
                        }
                        Err(err) => {
                            // The signer already consumed a sequence number
                            // that will never land on the routing layer; the
                            // next attempt re-signs from the stored sequence.
                            let msg = publish_failure_message(&err);
                            fail_entry(store, entry, &msg, &mut outcome).await;
                        }
                    }
                }
            }
        }
    }

    finish_run(started, &outcome);
    Ok(outcome)
}

fn publish_failure_message(err: &PublishError) -> String {
    format!("publish failed after signing: {err}")
}

fn outcome_remaining(due: &[Enrollment], outcome: &RunOutcome) -> usize {
    due.len().saturating_sub(outcome.processed)
}

async fn succeed_entry(
    store: &SharedStore,
    entry: &Enrollment,
    result: &RepublishResult,
    mirror: Option<&SequenceMirror>,
    outcome: &mut RunOutcome,
) {
    let upgrade = match (
        result.upgraded_encrypted_key.clone(),
        result.upgraded_key_epoch,
    ) {
        (Some(sealed_key), Some(key_epoch)) => Some(KeyUpgrade {
            sealed_key,
            key_epoch,
        }),
        (None, None) => None,
        _ => {
            tracing::warn!(
                ipns_name = %entry.ipns_name,
                "signer returned a partial key upgrade; ignoring it"
            );
            None
        }
    };

    let new_seq = result.new_sequence_number.as_deref();
    if let Err(err) = store.lock().await.record_success(entry.id, new_seq, upgrade) {
        tracing::error!(id = entry.id, error = %err, "failed to record publish success");
        outcome.failed += 1;
        metrics::counter!(SCHEDULER_ENTRIES_PROCESSED_TOTAL, "result" => "failure").increment(1);
        return;
    }

    if let Some(mirror) = mirror {
        let update = SequenceUpdate {
            owner: entry.owner.clone(),
            ipns_name: entry.ipns_name.clone(),
            sequence_number: new_seq.unwrap_or(&entry.sequence_number).to_string(),
        };
        // Best-effort: a dropped receiver must not fail the entry.
        if let Err(err) = mirror.send(update) {
            tracing::warn!(ipns_name = %entry.ipns_name, error = %err, "sequence mirror send failed");
        }
    }

    tracing::debug!(ipns_name = %entry.ipns_name, "record republished");
    outcome.succeeded += 1;
    metrics::counter!(SCHEDULER_ENTRIES_PROCESSED_TOTAL, "result" => "success").increment(1);
}

async fn fail_entry(store: &SharedStore, entry: &Enrollment, msg: &str, outcome: &mut RunOutcome) {
    tracing::warn!(
        ipns_name = %entry.ipns_name,
        consecutive_failures = entry.consecutive_failures + 1,
        reason = msg,
        "republish failed; backing off"
    );
    if let Err(err) = store.lock().await.record_failure(entry.id, msg) {
        tracing::error!(id = entry.id, error = %err, "failed to record failure");
    }
    outcome.failed += 1;
    metrics::counter!(SCHEDULER_ENTRIES_PROCESSED_TOTAL, "result" => "failure").increment(1);
}

fn finish_run(started: Instant, outcome: &RunOutcome) {
    metrics::counter!(SCHEDULER_RUNS_TOTAL, "result" => "completed").increment(1);
    metrics::histogram!(SCHEDULER_BATCH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

    if outcome.processed > 0 && outcome.succeeded == 0 && outcome.failed == outcome.processed {
        tracing::warn!(
            processed = outcome.processed,
            "every entry in this run failed; signer or routing endpoint likely down"
        );
    } else {
        tracing::info!(
            processed = outcome.processed,
            succeeded = outcome.succeeded,
            failed = outcome.failed,
            "scheduler run complete"
        );
    }
}
