//! Batch conflict resolution.
//!
//! The resolver is a pure fold over one batch of commit requests, in queue
//! order, against a snapshot of already-committed states. It classifies
//! each request as a fresh commit, an idempotent duplicate, or a rejection,
//! and accumulates the in-batch claims so that two requests contending for
//! the same state inside one batch are resolved deterministically: the
//! first by drain order wins.
//!
//! Nothing here touches storage. The caller supplies the conflict snapshot
//! and the committed-transaction set read inside the batch's store
//! transaction, and persists whatever comes back marked `Commit`.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::error::{NotaryError, StateConsumptionDetails, StateUsage};
use crate::types::{CommitRequest, StateRef, TxId};

/// The resolver's verdict on a single request.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Fresh claim: persist committed-state rows for every input and a
    /// committed-transaction marker, then report success.
    Commit,
    /// The transaction is already durably notarized (or was committed
    /// earlier in this batch). Report success; nothing new to persist.
    Duplicate,
    /// Report the contained failure to the caller.
    Reject(NotaryError),
}

impl Decision {
    pub fn is_success(&self) -> bool {
        matches!(self, Decision::Commit | Decision::Duplicate)
    }
}

/// Output of resolving one batch.
#[derive(Debug, Clone)]
pub struct ResolvedBatch {
    /// One decision per request, in the same order as the input batch.
    pub decisions: Vec<Decision>,
    /// Indices of requests whose decision is [`Decision::Commit`].
    pub to_persist: Vec<usize>,
}

impl ResolvedBatch {
    /// Distinct transaction ids with a successful decision, in sorted
    /// order. This is the set the batch signer covers.
    pub fn signable_tx_ids(&self, requests: &[CommitRequest]) -> Vec<TxId> {
        let mut ids: Vec<TxId> = requests
            .iter()
            .zip(&self.decisions)
            .filter(|(_, d)| d.is_success())
            .map(|(r, _)| r.tx_id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

/// Resolves one batch of requests against a conflict snapshot.
///
/// * `committed_states` — states already consumed according to the durable
///   store, as read inside the batch's transaction. Grown in place as the
///   fold claims further states for this batch.
/// * `committed_txs` — transaction ids already holding a durable
///   committed-transaction marker; consulted only for zero-input requests.
/// * `now` — the resolution instant for time-window validation.
///
/// The fold order is the queue drain order, which makes the outcome
/// deterministic: the first request to claim a state wins, and every later
/// claimant either matches the same transaction (idempotent success) or
/// loses with a conflict.
pub fn resolve_batch(
    requests: &[CommitRequest],
    mut committed_states: BTreeMap<StateRef, TxId>,
    committed_txs: &HashSet<TxId>,
    now: DateTime<Utc>,
) -> ResolvedBatch {
    let mut decisions: Vec<Decision> = Vec::with_capacity(requests.len());
    let mut to_persist: Vec<usize> = Vec::new();
    let mut decided: HashMap<TxId, Decision> = HashMap::new();

    for (index, request) in requests.iter().enumerate() {
        let decision = resolve_one(
            request,
            &mut committed_states,
            committed_txs,
            &decided,
            now,
        );

        if decision == Decision::Commit {
            to_persist.push(index);
        }
        // Every branch records its decision so a later request with the
        // same tx id gets the same answer.
        decided.insert(request.tx_id, decision.clone());
        decisions.push(decision);
    }

    ResolvedBatch {
        decisions,
        to_persist,
    }
}

fn resolve_one(
    request: &CommitRequest,
    committed_states: &mut BTreeMap<StateRef, TxId>,
    committed_txs: &HashSet<TxId>,
    decided: &HashMap<TxId, Decision>,
    now: DateTime<Utc>,
) -> Decision {
    let conflicts = find_request_conflicts(request, committed_states);

    if !conflicts.is_empty() {
        // The caller retrying a transaction that already committed is not
        // an error: every conflicting state must point back at this
        // transaction.
        if conflicts
            .values()
            .all(|details| details.consumed_by == request.tx_id)
        {
            return Decision::Duplicate;
        }
        // A reference-only transaction leaves no committed-state rows, so
        // a retry can surface here through reference conflicts alone.
        if request.inputs.is_empty() && committed_txs.contains(&request.tx_id) {
            return Decision::Duplicate;
        }
        return Decision::Reject(NotaryError::Conflict { conflicts });
    }

    // No conflicts. A committed reference-only transaction never appears
    // in the consumed-state map, so its retry lands here; it succeeds
    // without re-evaluating its time window.
    if request.inputs.is_empty() && committed_txs.contains(&request.tx_id) {
        return Decision::Duplicate;
    }

    // The same transaction submitted twice within one batch gets one
    // consistent answer. A successful earlier copy already carries the
    // persistence; the later copy is a duplicate of it.
    if let Some(previous) = decided.get(&request.tx_id) {
        return match previous {
            Decision::Reject(error) => Decision::Reject(error.clone()),
            Decision::Commit | Decision::Duplicate => Decision::Duplicate,
        };
    }

    if let Some(window) = request.time_window {
        if !window.contains(now) {
            return Decision::Reject(NotaryError::TimeWindowInvalid {
                time_window: window,
                checked_at: now,
            });
        }
    }

    // Claim the inputs so later requests in this batch see them as
    // consumed even though nothing has hit the store yet.
    for input in &request.inputs {
        committed_states.insert(*input, request.tx_id);
    }
    Decision::Commit
}

/// Intersects a request's inputs and references with the consumed-state
/// map, tagging each hit with how the requester was using the state.
fn find_request_conflicts(
    request: &CommitRequest,
    committed_states: &BTreeMap<StateRef, TxId>,
) -> BTreeMap<StateRef, StateConsumptionDetails> {
    let mut conflicts = BTreeMap::new();
    for (state_ref, usage) in request
        .inputs
        .iter()
        .map(|r| (r, StateUsage::Input))
        .chain(request.references.iter().map(|r| (r, StateUsage::Reference)))
    {
        if let Some(&consumed_by) = committed_states.get(state_ref) {
            conflicts.insert(
                *state_ref,
                StateConsumptionDetails { consumed_by, usage },
            );
        }
    }
    conflicts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Party, TimeWindow};
    use chrono::{Duration, TimeZone};

    fn tx(n: u8) -> TxId {
        TxId([n; 32])
    }

    fn state(n: u8, index: u32) -> StateRef {
        StateRef::new(tx(n), index)
    }

    fn request(tx_id: TxId, inputs: Vec<StateRef>, references: Vec<StateRef>) -> CommitRequest {
        CommitRequest {
            inputs,
            references,
            tx_id,
            caller: Party::new("party-a"),
            request_signature: vec![0xca, 0xfe],
            time_window: None,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn empty_committed() -> HashSet<TxId> {
        HashSet::new()
    }

    // Test: a request with no conflicts commits and claims its inputs
    #[test]
    fn test_fresh_request_commits() {
        let requests = vec![request(tx(1), vec![state(9, 0)], vec![])];

        let resolved = resolve_batch(&requests, BTreeMap::new(), &empty_committed(), now());

        assert_eq!(resolved.decisions, vec![Decision::Commit]);
        assert_eq!(resolved.to_persist, vec![0]);
    }

    // Test: the first claimant by drain order wins; the second loses with
    // a conflict naming the winner
    #[test]
    fn test_intra_batch_conflict_resolves_by_drain_order() {
        let contested = state(9, 0);
        let requests = vec![
            request(tx(1), vec![contested], vec![]),
            request(tx(2), vec![contested], vec![]),
        ];

        let resolved = resolve_batch(&requests, BTreeMap::new(), &empty_committed(), now());

        assert_eq!(resolved.decisions[0], Decision::Commit);
        match &resolved.decisions[1] {
            Decision::Reject(NotaryError::Conflict { conflicts }) => {
                assert_eq!(conflicts.len(), 1);
                let details = &conflicts[&contested];
                assert_eq!(details.consumed_by, tx(1));
                assert_eq!(details.usage, StateUsage::Input);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        assert_eq!(resolved.to_persist, vec![0]);
    }

    // Test: a conflict against the durable snapshot reports the original
    // consumer
    #[test]
    fn test_conflict_against_snapshot() {
        let taken = state(9, 0);
        let snapshot = BTreeMap::from([(taken, tx(1))]);
        let requests = vec![request(tx(2), vec![taken], vec![])];

        let resolved = resolve_batch(&requests, snapshot, &empty_committed(), now());

        match &resolved.decisions[0] {
            Decision::Reject(NotaryError::Conflict { conflicts }) => {
                assert_eq!(conflicts[&taken].consumed_by, tx(1));
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    // Test: retrying a committed transaction is a duplicate success, not
    // a conflict with itself
    #[test]
    fn test_idempotent_retry_is_duplicate() {
        let s = state(9, 0);
        let snapshot = BTreeMap::from([(s, tx(1))]);
        let requests = vec![request(tx(1), vec![s], vec![])];

        let resolved = resolve_batch(&requests, snapshot, &empty_committed(), now());

        assert_eq!(resolved.decisions, vec![Decision::Duplicate]);
        assert!(resolved.to_persist.is_empty());
    }

    // Test: retry only counts as idempotent when every conflicting state
    // points at the retrying transaction
    #[test]
    fn test_partial_self_conflict_still_rejects() {
        let mine = state(9, 0);
        let theirs = state(9, 1);
        let snapshot = BTreeMap::from([(mine, tx(1)), (theirs, tx(2))]);
        let requests = vec![request(tx(1), vec![mine, theirs], vec![])];

        let resolved = resolve_batch(&requests, snapshot, &empty_committed(), now());

        match &resolved.decisions[0] {
            Decision::Reject(NotaryError::Conflict { conflicts }) => {
                assert_eq!(conflicts.len(), 2);
                assert_eq!(conflicts[&theirs].consumed_by, tx(2));
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    // Test: reference states conflict too, tagged as references
    #[test]
    fn test_reference_conflict_tagged_as_reference() {
        let taken = state(9, 0);
        let snapshot = BTreeMap::from([(taken, tx(1))]);
        let requests = vec![request(tx(2), vec![state(8, 0)], vec![taken])];

        let resolved = resolve_batch(&requests, snapshot, &empty_committed(), now());

        match &resolved.decisions[0] {
            Decision::Reject(NotaryError::Conflict { conflicts }) => {
                assert_eq!(conflicts[&taken].usage, StateUsage::Reference);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    // Test: a committed zero-input transaction whose references now
    // conflict is still an idempotent success
    #[test]
    fn test_reference_only_retry_with_conflicting_reference() {
        let observed = state(9, 0);
        // Someone else consumed the observed state after our first commit.
        let snapshot = BTreeMap::from([(observed, tx(3))]);
        let committed = HashSet::from([tx(5)]);
        let requests = vec![request(tx(5), vec![], vec![observed])];

        let resolved = resolve_batch(&requests, snapshot, &committed, now());

        assert_eq!(resolved.decisions, vec![Decision::Duplicate]);
    }

    // Test: a committed zero-input transaction succeeds on resubmission
    // without re-evaluating its (now expired) time window
    #[test]
    fn test_reference_only_retry_skips_time_window() {
        let mut req = request(tx(5), vec![], vec![state(9, 0)]);
        req.time_window = Some(TimeWindow::until_only(now() - Duration::hours(1)));
        let committed = HashSet::from([tx(5)]);

        let resolved = resolve_batch(&[req], BTreeMap::new(), &committed, now());

        assert_eq!(resolved.decisions, vec![Decision::Duplicate]);
    }

    // Test: an elapsed time window rejects even with no conflicts
    #[test]
    fn test_expired_time_window_rejects() {
        let mut req = request(tx(1), vec![state(9, 0)], vec![]);
        let window = TimeWindow::until_only(now() - Duration::hours(1));
        req.time_window = Some(window);

        let resolved = resolve_batch(&[req], BTreeMap::new(), &empty_committed(), now());

        match &resolved.decisions[0] {
            Decision::Reject(NotaryError::TimeWindowInvalid {
                time_window,
                checked_at,
            }) => {
                assert_eq!(*time_window, window);
                assert_eq!(*checked_at, now());
            }
            other => panic!("expected time window rejection, got {other:?}"),
        }
        assert!(resolved.to_persist.is_empty());
    }

    // Test: a not-yet-valid window also rejects
    #[test]
    fn test_future_time_window_rejects() {
        let mut req = request(tx(1), vec![state(9, 0)], vec![]);
        req.time_window = Some(TimeWindow::from_only(now() + Duration::hours(1)));

        let resolved = resolve_batch(&[req], BTreeMap::new(), &empty_committed(), now());

        assert!(matches!(
            resolved.decisions[0],
            Decision::Reject(NotaryError::TimeWindowInvalid { .. })
        ));
    }

    // Test: a valid window commits
    #[test]
    fn test_valid_time_window_commits() {
        let mut req = request(tx(1), vec![state(9, 0)], vec![]);
        req.time_window = Some(TimeWindow::between(
            now() - Duration::minutes(5),
            now() + Duration::minutes(5),
        ));

        let resolved = resolve_batch(&[req], BTreeMap::new(), &empty_committed(), now());

        assert_eq!(resolved.decisions, vec![Decision::Commit]);
    }

    // Test: the same tx id twice in one batch gets one consistent answer
    // through the decision cache
    #[test]
    fn test_same_tx_in_batch_reuses_decision() {
        // Zero-input requests never enter the consumed-state map, so the
        // second copy can only be caught by the decision cache.
        let requests = vec![
            request(tx(1), vec![], vec![state(9, 0)]),
            request(tx(1), vec![], vec![state(9, 0)]),
        ];

        let resolved = resolve_batch(&requests, BTreeMap::new(), &empty_committed(), now());

        assert_eq!(resolved.decisions[0], Decision::Commit);
        // The second copy succeeds as a duplicate of the first; only the
        // first copy is persisted.
        assert_eq!(resolved.decisions[1], Decision::Duplicate);
        assert_eq!(resolved.to_persist, vec![0]);
    }

    // Test: rejections are cached as well, so a rejected transaction
    // resubmitted in the same batch is rejected identically
    #[test]
    fn test_rejection_reused_within_batch() {
        let expired = TimeWindow::until_only(now() - Duration::hours(1));
        let mut first = request(tx(1), vec![], vec![]);
        first.time_window = Some(expired);
        let mut second = request(tx(1), vec![], vec![]);
        // Different window on the resubmission; the cached decision wins.
        second.time_window = None;

        let resolved = resolve_batch(
            &[first, second],
            BTreeMap::new(),
            &empty_committed(),
            now(),
        );

        assert!(matches!(
            resolved.decisions[0],
            Decision::Reject(NotaryError::TimeWindowInvalid { .. })
        ));
        assert_eq!(resolved.decisions[1], resolved.decisions[0]);
    }

    // Test: a duplicate input within one request conflicts only across
    // requests, not with itself
    #[test]
    fn test_request_does_not_conflict_with_itself() {
        let s = state(9, 0);
        // Input also listed as a reference; claimed once, no self-conflict.
        let requests = vec![request(tx(1), vec![s], vec![s])];

        let resolved = resolve_batch(&requests, BTreeMap::new(), &empty_committed(), now());

        assert_eq!(resolved.decisions, vec![Decision::Commit]);
    }

    // Test: signable ids cover commits and duplicates, deduplicated
    #[test]
    fn test_signable_tx_ids() {
        let s1 = state(9, 0);
        let snapshot = BTreeMap::from([(s1, tx(1))]);
        let requests = vec![
            request(tx(1), vec![s1], vec![]),          // duplicate
            request(tx(2), vec![state(8, 0)], vec![]), // commit
            request(tx(3), vec![s1], vec![]),          // conflict
        ];

        let resolved = resolve_batch(&requests, snapshot, &empty_committed(), now());
        let signable = resolved.signable_tx_ids(&requests);

        assert_eq!(signable, vec![tx(1), tx(2)]);
    }

    // Test: scenario — batch of three where the third claims the first's
    // input; mirrors two conflicting requests arriving close together
    #[test]
    fn test_mixed_batch() {
        let s1 = state(9, 0);
        let s2 = state(9, 1);
        let requests = vec![
            request(tx(1), vec![s1], vec![]),
            request(tx(2), vec![s2], vec![]),
            request(tx(3), vec![s1], vec![]),
        ];

        let resolved = resolve_batch(&requests, BTreeMap::new(), &empty_committed(), now());

        assert_eq!(resolved.decisions[0], Decision::Commit);
        assert_eq!(resolved.decisions[1], Decision::Commit);
        match &resolved.decisions[2] {
            Decision::Reject(NotaryError::Conflict { conflicts }) => {
                assert_eq!(conflicts[&s1].consumed_by, tx(1));
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        assert_eq!(resolved.to_persist, vec![0, 1]);
    }
}
