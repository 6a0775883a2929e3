use std::sync::Arc;

use anyhow::Result;
use chrono::Duration;

use super::*;
use crate::fixtures::{self, FakeResources, FakeStoreClient};
use strata_core::crd::{StoreState, StrataClusterStatus};
use strata_core::labels::{ANNO_DEFER_DELETING, ANNO_NO_ACTIVE_STORE_SINCE, ANNO_SCALE_IN_TIME};
use strata_core::ErrorKind;

struct Harness {
    resources: Arc<FakeResources>,
    client: Arc<FakeStoreClient>,
    scaler: StoreScaler,
    cluster: StrataCluster,
}

/// A bootstrapped cluster with `existing` ready storage replicas, each with an Up store without
/// leaders. Store IDs are `ordinal + 1`.
fn harness(existing: i32, desired: i32, parallelism: i32) -> Harness {
    let resources = FakeResources::new();
    let client = FakeStoreClient::new();
    let mut cluster = fixtures::cluster("basic", 3, desired);
    cluster.spec.tikv = fixtures::group_spec(desired, parallelism);
    let mut status = StrataClusterStatus::default();
    status.tikv.bootstrapped = true;
    cluster.status = Some(status);

    fixtures::add_replicas(&resources, &cluster, MemberGroup::Storage, 0..existing, true);
    client.lock().stores = (0..existing)
        .map(|ord| fixtures::store(ord as u64 + 1, &format!("basic-tikv-{}", ord), StoreState::Up, 0))
        .collect();
    let scaler = StoreScaler::new(fixtures::deps(resources.clone(), client.clone(), true));
    Harness {
        resources,
        client,
        scaler,
        cluster,
    }
}

impl Harness {
    async fn pass(&self, old: &ReplicaSlots) -> (ReplicaSlots, SyncResult<()>) {
        let spec = &self.cluster.spec.tikv;
        let mut new = ReplicaSlots::new(spec.replicas, spec.delete_slots.iter().copied());
        let res = self.scaler.scale(&self.cluster, old, &mut new, fixtures::now()).await;
        (new, res)
    }
}

fn kind(res: &SyncResult<()>) -> Option<ErrorKind> {
    res.as_ref().err().map(|err| err.kind())
}

#[tokio::test]
async fn scale_in_blocked_when_quorum_would_be_lost() -> Result<()> {
    let h = harness(3, 2, 1);
    let old = ReplicaSlots::with_replicas(3);

    let (new, res) = h.pass(&old).await;

    assert_eq!(kind(&res), Some(ErrorKind::Precondition), "expected a precondition failure, got {:?}", res);
    assert_eq!(new, old, "replicas must not change while blocked, got {}", new);
    assert!(h.client.calls().is_empty(), "no lifecycle calls expected, got {:?}", h.client.calls());
    let events = h.resources.lock().events.clone();
    assert!(
        events.iter().any(|(typ, reason, _)| *typ == EventType::Warning && reason == "FailedScaleIn"),
        "expected a FailedScaleIn warning event, got {:?}",
        events
    );
    Ok(())
}

#[tokio::test]
async fn scale_in_batch_feeds_removed_up_stores_into_quorum_check() -> Result<()> {
    let h = harness(4, 2, 2);
    let old = ReplicaSlots::with_replicas(4);

    let (new, res) = h.pass(&old).await;

    // Ordinal 3 may go (4 Up > 3), after which ordinal 2 would leave only 3 Up stores.
    let err = match res {
        Err(err) => err,
        Ok(()) => anyhow::bail!("expected the batch to be incomplete"),
    };
    assert_eq!(err.kind(), ErrorKind::Requeue, "a progressing batch is a requeue, got {:?}", err);
    let kinds: Vec<_> = err.leaves().iter().map(|leaf| leaf.kind()).collect();
    assert!(kinds.contains(&ErrorKind::Precondition), "expected a precondition leaf, got {:?}", kinds);
    assert_eq!(h.client.calls(), vec!["remove_store:4".to_string()], "only store 4 may be removed");
    assert_eq!(new, old, "no ordinal finished, got {}", new);
    Ok(())
}

#[tokio::test]
async fn scale_in_parallel_removals_within_quorum() -> Result<()> {
    let h = harness(5, 3, 2);
    let old = ReplicaSlots::with_replicas(5);

    let (new, res) = h.pass(&old).await;

    assert_eq!(kind(&res), Some(ErrorKind::Requeue), "expected requeue, got {:?}", res);
    assert_eq!(h.client.calls(), vec!["remove_store:5".to_string(), "remove_store:4".to_string()]);
    assert_eq!(new, old, "replicas must stay at 5 until the stores are tombstones, got {}", new);
    Ok(())
}

#[tokio::test]
async fn scale_in_non_up_store_bypasses_quorum_check() -> Result<()> {
    let h = harness(3, 2, 1);
    h.client.set_store_state(3, StoreState::Down);
    let old = ReplicaSlots::with_replicas(3);

    let (_new, res) = h.pass(&old).await;

    assert_eq!(kind(&res), Some(ErrorKind::Requeue), "expected requeue, got {:?}", res);
    assert_eq!(h.client.calls(), vec!["remove_store:3".to_string()], "a down store may always be removed");
    Ok(())
}

#[tokio::test]
async fn scale_in_up_to_tombstone_over_two_passes() -> Result<()> {
    let h = harness(4, 3, 1);
    let old = ReplicaSlots::with_replicas(4);

    let (new, res) = h.pass(&old).await;
    assert_eq!(kind(&res), Some(ErrorKind::Requeue), "first pass must requeue, got {:?}", res);
    assert_eq!(new, old, "first pass must not change replicas, got {}", new);
    assert_eq!(h.client.calls(), vec!["remove_store:4".to_string()]);
    assert!(
        h.resources.pod_annotation("basic-tikv-3", ANNO_SCALE_IN_TIME).is_some(),
        "expected the scale-in start time to be stamped"
    );
    assert!(h.resources.deferred_claims().is_empty(), "no claim may be released before tombstone");

    h.client.set_store_state(4, StoreState::Tombstone);
    let (new, res) = h.pass(&old).await;
    assert!(res.is_ok(), "second pass must succeed, got {:?}", res);
    assert_eq!(new, ReplicaSlots::with_replicas(3), "expected replicas to drop to 3, got {}", new);
    assert!(
        h.resources.claim_annotation("tikv-basic-tikv-3", ANNO_DEFER_DELETING).is_some(),
        "expected the claim of ordinal 3 to be released"
    );

    // Converged: further passes are stable.
    let (again, res) = h.pass(&new).await;
    assert!(res.is_ok(), "converged pass must succeed, got {:?}", res);
    assert_eq!(again, new, "expected a stable result, got {}", again);
    Ok(())
}

#[tokio::test]
async fn scale_in_evicts_leaders_once_before_removal() -> Result<()> {
    let h = harness(4, 3, 1);
    h.client.lock().stores[3].leader_count = 10;
    let old = ReplicaSlots::with_replicas(4);

    let (_, res) = h.pass(&old).await;
    assert_eq!(kind(&res), Some(ErrorKind::Requeue), "expected requeue, got {:?}", res);
    let (_, res) = h.pass(&old).await;
    assert_eq!(kind(&res), Some(ErrorKind::Requeue), "expected requeue, got {:?}", res);
    assert_eq!(
        h.client.calls(),
        vec!["begin_leader_eviction:4".to_string()],
        "eviction must be requested exactly once and the store must not be removed yet"
    );

    // Once the eviction timeout has passed, the store is removed regardless of its leaders.
    let started = fixtures::now() - Duration::seconds(301);
    h.resources
        .patch_pod_meta("default", "basic-tikv-3", &MetaPatch::default().annotation(ANNO_SCALE_IN_TIME, started.to_rfc3339()))
        .await?;
    let (_, res) = h.pass(&old).await;
    assert_eq!(kind(&res), Some(ErrorKind::Requeue), "expected requeue, got {:?}", res);
    assert_eq!(h.client.calls().last().map(String::as_str), Some("remove_store:4"));

    // Tombstone clears the eviction scheduler.
    h.client.set_store_state(4, StoreState::Tombstone);
    let (_, res) = h.pass(&old).await;
    assert!(res.is_ok(), "expected success, got {:?}", res);
    assert_eq!(h.client.calls().last().map(String::as_str), Some("end_leader_eviction:4"));
    Ok(())
}

#[tokio::test]
async fn scale_in_never_ready_replica_waits_for_grace_period() -> Result<()> {
    let h = harness(3, 3, 1);
    // Ordinal 3 was created but never became ready nor registered a store.
    h.resources
        .add_pod(fixtures::pod("basic", MemberGroup::Storage, 3, false, fixtures::now() - Duration::seconds(60), None));
    h.resources.add_claim(fixtures::claim("tikv-basic-tikv-3"));
    let old = ReplicaSlots::with_replicas(4);

    let (new, res) = h.pass(&old).await;
    assert_eq!(kind(&res), Some(ErrorKind::Requeue), "expected requeue within the grace period, got {:?}", res);
    assert_eq!(new, old, "nothing may finish within the grace period, got {}", new);
    assert!(h.resources.deferred_claims().is_empty(), "no claim may be released within the grace period");

    h.resources
        .add_pod(fixtures::pod("basic", MemberGroup::Storage, 3, false, fixtures::now() - Duration::seconds(151), None));
    let (new, res) = h.pass(&old).await;
    assert!(res.is_ok(), "expected success after the grace period, got {:?}", res);
    assert_eq!(new, ReplicaSlots::with_replicas(3), "expected replicas to drop to 3, got {}", new);
    assert!(h.resources.deferred_claims().contains("tikv-basic-tikv-3"), "expected the claim to be released");
    assert!(h.client.calls().is_empty(), "the removal API must never be called, got {:?}", h.client.calls());
    Ok(())
}

#[tokio::test]
async fn scale_in_ready_replica_without_store() -> Result<()> {
    let h = harness(3, 3, 1);
    h.resources
        .add_pod(fixtures::pod("basic", MemberGroup::Storage, 3, true, fixtures::now() - Duration::hours(1), None));
    h.resources.add_claim(fixtures::claim("tikv-basic-tikv-3"));
    let old = ReplicaSlots::with_replicas(4);

    let (new, res) = h.pass(&old).await;
    assert_eq!(kind(&res), Some(ErrorKind::Fatal), "an unexplained missing store is an error, got {:?}", res);
    assert_eq!(new, old);
    assert!(h.resources.deferred_claims().is_empty(), "no claim may be released speculatively");

    // Recently without an active store: still an error.
    let since = fixtures::now() - Duration::seconds(30);
    h.resources
        .patch_pod_meta("default", "basic-tikv-3", &MetaPatch::default().annotation(ANNO_NO_ACTIVE_STORE_SINCE, since.to_rfc3339()))
        .await?;
    let (_, res) = h.pass(&old).await;
    assert_eq!(kind(&res), Some(ErrorKind::Fatal), "expected an error within the grace period, got {:?}", res);

    // Without an active store for longer than the grace period: abandoned.
    let since = fixtures::now() - Duration::seconds(151);
    h.resources
        .patch_pod_meta("default", "basic-tikv-3", &MetaPatch::default().annotation(ANNO_NO_ACTIVE_STORE_SINCE, since.to_rfc3339()))
        .await?;
    let (new, res) = h.pass(&old).await;
    assert!(res.is_ok(), "expected success, got {:?}", res);
    assert_eq!(new, ReplicaSlots::with_replicas(3));
    assert!(h.resources.deferred_claims().contains("tikv-basic-tikv-3"));
    Ok(())
}

#[tokio::test]
async fn scale_in_requires_synced_store_label() -> Result<()> {
    let h = harness(4, 3, 1);
    h.resources
        .add_pod(fixtures::pod("basic", MemberGroup::Storage, 3, true, fixtures::now() - Duration::hours(1), None));
    let old = ReplicaSlots::with_replicas(4);

    let (new, res) = h.pass(&old).await;

    assert_eq!(kind(&res), Some(ErrorKind::Fatal), "expected an error for the missing label, got {:?}", res);
    assert_eq!(new, old);
    assert!(h.client.calls().is_empty(), "nothing may be removed without the label, got {:?}", h.client.calls());
    Ok(())
}

#[tokio::test]
async fn scale_in_partial_progress_is_kept() -> Result<()> {
    let h = harness(5, 3, 2);
    h.client.set_store_state(5, StoreState::Tombstone);
    let old = ReplicaSlots::with_replicas(5);

    let (new, res) = h.pass(&old).await;

    // Ordinal 4 is done; ordinal 3 has only just been removed.
    assert_eq!(kind(&res), Some(ErrorKind::Requeue), "expected requeue, got {:?}", res);
    assert_eq!(new, ReplicaSlots::with_replicas(4), "expected exactly ordinal 4 to be removed, got {}", new);
    Ok(())
}

#[tokio::test]
async fn scale_in_coordinator_failure_keeps_old_slots() -> Result<()> {
    let h = harness(4, 3, 1);
    h.client.lock().fail_list = true;
    let old = ReplicaSlots::with_replicas(4);

    let (new, res) = h.pass(&old).await;

    assert_eq!(kind(&res), Some(ErrorKind::Fatal), "expected an error, got {:?}", res);
    assert_eq!(new, old);
    Ok(())
}

#[tokio::test]
async fn scale_out_storage_replicas() -> Result<()> {
    let h = harness(3, 5, 1);
    let old = ReplicaSlots::with_replicas(3);

    let (new, res) = h.pass(&old).await;

    assert!(res.is_ok(), "expected success, got {:?}", res);
    assert_eq!(new, ReplicaSlots::with_replicas(4), "parallelism 1 allows one new replica per pass, got {}", new);
    Ok(())
}

#[tokio::test]
async fn cancelled_scale_in_is_undone_before_a_new_one() -> Result<()> {
    let mut h = harness(4, 3, 1);
    h.client.lock().stores[3].leader_count = 10;
    let old = ReplicaSlots::with_replicas(4);

    let (_, res) = h.pass(&old).await;
    assert_eq!(kind(&res), Some(ErrorKind::Requeue), "expected requeue, got {:?}", res);
    let started = fixtures::now() - Duration::hours(1);
    h.resources
        .patch_pod_meta("default", "basic-tikv-3", &MetaPatch::default().annotation(ANNO_SCALE_IN_TIME, started.to_rfc3339()))
        .await?;

    // The scale in is abandoned.
    h.cluster.spec.tikv.replicas = 4;
    let (new, res) = h.pass(&old).await;
    assert!(res.is_ok(), "expected success, got {:?}", res);
    assert_eq!(new, old);
    assert!(
        h.resources.pod_annotation("basic-tikv-3", ANNO_SCALE_IN_TIME).is_none(),
        "expected the scale-in time to be cleared"
    );
    assert!(h.client.lock().schedulers.is_empty(), "expected the eviction to be ended");
    let events = h.resources.lock().events.clone();
    assert!(
        events.iter().any(|(typ, reason, _)| *typ == EventType::Normal && reason == "CancelledScaleIn"),
        "expected a CancelledScaleIn event, got {:?}",
        events
    );

    // A fresh scale in of the same ordinal evicts leaders again instead of removing the store.
    h.cluster.spec.tikv.replicas = 3;
    let (new, res) = h.pass(&old).await;
    assert_eq!(kind(&res), Some(ErrorKind::Requeue), "expected requeue, got {:?}", res);
    assert_eq!(new, old);
    assert_eq!(
        h.client.calls(),
        vec![
            "begin_leader_eviction:4".to_string(),
            "end_leader_eviction:4".to_string(),
            "begin_leader_eviction:4".to_string(),
        ],
        "the store must not be removed while it still holds leaders"
    );
    assert_eq!(
        h.resources.pod_annotation("basic-tikv-3", ANNO_SCALE_IN_TIME),
        Some(fixtures::now().to_rfc3339()),
        "expected a fresh scale-in time"
    );
    Ok(())
}

#[tokio::test]
async fn scale_out_leaves_replicas_without_scale_in_alone() -> Result<()> {
    let h = harness(3, 4, 1);
    let old = ReplicaSlots::with_replicas(3);

    let (new, res) = h.pass(&old).await;

    assert!(res.is_ok(), "expected success, got {:?}", res);
    assert_eq!(new, ReplicaSlots::with_replicas(4));
    assert!(h.client.calls().is_empty(), "no lifecycle calls expected, got {:?}", h.client.calls());
    assert!(h.resources.lock().events.is_empty(), "no events expected");
    Ok(())
}
