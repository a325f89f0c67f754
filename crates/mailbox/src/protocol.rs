//! Submission of transactions to a node cluster.

use std::time::Duration;

use courier_consensus::Cluster;
use tracing::error;

use crate::Error;
use crate::state_machine::{ApplyResult, ApplyStatus, MailboxStateMachine, Transaction};
use crate::types::{Key, ReadResults, WriteOp};

/// Submits an unguarded transaction and returns its committed reads.
///
/// # Errors
///
/// Returns [`Error::Consensus`] if the proposal fails; the transaction then
/// had no effect unless the failure is a timeout. Returns
/// [`Error::UnexpectedResult`] if the result does not match the request.
pub async fn submit<C>(
    cluster: &C,
    reads: Vec<Key>,
    writes: Vec<WriteOp>,
    timeout: Duration,
) -> Result<ReadResults, Error>
where
    C: Cluster<MailboxStateMachine>,
{
    let result = submit_guarded(cluster, Transaction::new(reads, writes), timeout).await?;

    match result.status {
        ApplyStatus::Applied => Ok(result.reads),
        ApplyStatus::Conflict { key } => {
            error!(cluster = %cluster.name(), %key, "unguarded transaction reported a conflict");
            Err(Error::UnexpectedResult(format!(
                "conflict on {key} without guards"
            )))
        }
    }
}

/// Submits a transaction and returns the full apply result, conflicts
/// included.
///
/// # Errors
///
/// Same as [`submit`], except that a failed guard is reported through
/// [`ApplyStatus::Conflict`] rather than an error.
pub async fn submit_guarded<C>(
    cluster: &C,
    transaction: Transaction,
    timeout: Duration,
) -> Result<ApplyResult, Error>
where
    C: Cluster<MailboxStateMachine>,
{
    let requested = transaction.reads.clone();

    let result = cluster
        .propose(transaction, timeout)
        .await
        .map_err(|e| Error::consensus(&e))?;

    validate_reads(&requested, &result.reads).inspect_err(|e| {
        error!(cluster = %cluster.name(), "rejecting committed result: {e}");
    })?;

    Ok(result)
}

fn validate_reads(requested: &[Key], reads: &ReadResults) -> Result<(), Error> {
    if reads.len() != requested.len() {
        return Err(Error::UnexpectedResult(format!(
            "expected {} read results, got {}",
            requested.len(),
            reads.len()
        )));
    }

    if let Some((position, (key, read))) = requested
        .iter()
        .zip(reads.iter())
        .enumerate()
        .find(|(_, (key, read))| **key != read.key)
    {
        return Err(Error::UnexpectedResult(format!(
            "read {position} returned {} instead of {key}",
            read.key
        )));
    }

    Ok(())
}
