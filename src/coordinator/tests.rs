use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use super::*;
use crate::pipeline::{BuildRequest, DEFAULT_MAX_PREEMPT_ATTEMPTS, RunSettings};
use crate::services::ServiceSet;
use crate::test_utils::{FakeBuilder, FakeServices, VcsCall, fake_services, repo_key, wait_until};
use crate::types::{FailureKind, RunStatus};

const PATIENCE: Duration = Duration::from_secs(5);

fn coordinator(
    services: FakeServices,
    root: &TempDir,
    max_preempt_attempts: u32,
) -> Arc<Coordinator<FakeServices>> {
    let settings = RunSettings {
        work_root: root.path().join("runs"),
        max_preempt_attempts,
        ..RunSettings::default()
    };
    Arc::new(Coordinator::new(Arc::new(services), settings))
}

fn request(repo: &str) -> BuildRequest {
    let key = repo_key(repo);
    BuildRequest {
        clone_url: format!("https://github.com/{}.git", key),
        key,
    }
}

fn work_root_entries(root: &TempDir) -> usize {
    std::fs::read_dir(root.path().join("runs"))
        .map(|entries| entries.count())
        .unwrap_or(0)
}

/// Waits until `key` is registered to a handle other than `previous` that
/// has a cancellation request pending, and returns it.
async fn next_preempted_handle(
    registry: &RunRegistry,
    key: &RepoKey,
    previous: &Arc<ControlHandle>,
) -> Arc<ControlHandle> {
    tokio::time::timeout(PATIENCE, async {
        loop {
            if let Some(active) = registry.active(key).await {
                if !Arc::ptr_eq(&active, previous) && active.pending_cancels() > 0 {
                    return active;
                }
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("no new preempted handle appeared")
}

#[tokio::test]
async fn idle_key_runs_to_completion_and_is_released() {
    let root = TempDir::new().unwrap();
    let coord = coordinator(fake_services(Duration::ZERO), &root, DEFAULT_MAX_PREEMPT_ATTEMPTS);

    let outcome = coord.run(request("acme/site")).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Complete);
    assert!(coord.registry().is_empty().await);
    assert!(!outcome.workdir.unwrap().exists());

    let recorded = coord.services().sink.outcomes();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].key, repo_key("acme/site"));
    assert_eq!(recorded[0].status, RunStatus::Complete);
    assert!(recorded[0].log.contains("continuing: pushing"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn second_event_mid_build_supersedes_first() {
    let root = TempDir::new().unwrap();
    let coord = coordinator(
        fake_services(Duration::from_millis(150)),
        &root,
        DEFAULT_MAX_PREEMPT_ATTEMPTS,
    );
    let services = Arc::clone(coord.services());

    let first = coord.submit(request("acme/site"));
    assert!(wait_until(PATIENCE, || services.builder.started() == 1).await);
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = coord.submit(request("acme/site"));

    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();

    assert_eq!(first.status, RunStatus::Stopped);
    assert!(first.log.contains("stopping: committing"));
    assert_eq!(second.status, RunStatus::Complete);
    assert_ne!(first.run_id, second.run_id);
    assert_eq!(services.builder.max_active(), 1);
    assert_eq!(services.vcs.pushes().len(), 1);
    assert!(coord.registry().is_empty().await);

    // The superseded run's directory was gone before the new run fetched
    match services.vcs.fetches().as_slice() {
        [_, VcsCall::Fetch { siblings, .. }] => assert!(siblings.is_empty(), "{:?}", siblings),
        other => panic!("expected two fetches, got {:?}", other),
    }
    assert_eq!(work_root_entries(&root), 0);

    let statuses: Vec<_> = services.sink.outcomes().iter().map(|o| o.status).collect();
    assert!(statuses.contains(&RunStatus::Stopped));
    assert!(statuses.contains(&RunStatus::Complete));
}

#[tokio::test]
async fn unknown_repository_fails_and_releases_immediately() {
    let root = TempDir::new().unwrap();
    let coord = coordinator(fake_services(Duration::ZERO), &root, DEFAULT_MAX_PREEMPT_ATTEMPTS);

    let outcome = coord.run(request("acme/unknown")).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Failed(FailureKind::RepoNotFound));
    assert!(coord.registry().is_empty().await);
    assert_eq!(work_root_entries(&root), 0);
    assert_eq!(
        coord.services().sink.outcomes()[0].status.to_string(),
        "failed:repo-not-found"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn self_completed_run_yields_fresh_handle_and_drains_request() {
    let root = TempDir::new().unwrap();
    let coord = coordinator(fake_services(Duration::ZERO), &root, DEFAULT_MAX_PREEMPT_ATTEMPTS);
    let key = repo_key("acme/site");

    // Stand in for a run that finishes just as the preemptor arrives
    let (running, is_new) = coord.registry().acquire(&key).await;
    assert!(is_new);

    let preemptor = {
        let coord = Arc::clone(&coord);
        let key = key.clone();
        tokio::spawn(async move { coord.obtain_slot(&key).await })
    };
    assert!(wait_until(PATIENCE, || running.pending_cancels() == 1).await);

    assert!(coord.registry().release(&key, &running).await);
    running.acknowledge(Acknowledgement::SelfCompleted);

    let slot = preemptor.await.unwrap().unwrap();
    assert_ne!(slot.id(), running.id());
    assert_eq!(running.pending_cancels(), 0, "stale request must be drained");
    let active = coord.registry().active(&key).await.unwrap();
    assert!(Arc::ptr_eq(&active, &slot));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn preemptors_sharing_a_stopped_run_each_get_their_own_slot() {
    let root = TempDir::new().unwrap();
    let coord = coordinator(fake_services(Duration::ZERO), &root, DEFAULT_MAX_PREEMPT_ATTEMPTS);
    let key = repo_key("acme/site");
    let (stopped, _) = coord.registry().acquire(&key).await;

    let preemptors: Vec<_> = (0..2)
        .map(|_| {
            let coord = Arc::clone(&coord);
            let key = key.clone();
            tokio::spawn(async move { coord.obtain_slot(&key).await })
        })
        .collect();
    assert!(wait_until(PATIENCE, || stopped.pending_cancels() == 2).await);
    stopped.acknowledge(Acknowledgement::Stopped);

    // The winner's slot is preempted by the loser; play its run stopping
    let winner = next_preempted_handle(coord.registry(), &key, &stopped).await;
    winner.acknowledge(Acknowledgement::Stopped);

    let mut ids = Vec::new();
    for preemptor in preemptors {
        let slot = tokio::time::timeout(PATIENCE, preemptor)
            .await
            .expect("preemptor should resolve")
            .unwrap()
            .unwrap();
        ids.push(slot.id());
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 2);
    assert!(!ids.contains(&stopped.id()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn losing_every_round_hits_preemption_limit() {
    let root = TempDir::new().unwrap();
    let coord = coordinator(fake_services(Duration::ZERO), &root, 1);
    let key = repo_key("acme/site");
    let (running, _) = coord.registry().acquire(&key).await;

    let preemptor = {
        let coord = Arc::clone(&coord);
        let key = key.clone();
        tokio::spawn(async move { coord.obtain_slot(&key).await })
    };
    assert!(wait_until(PATIENCE, || running.pending_cancels() == 1).await);

    // Another request supersedes the run before this preemptor can
    let competitor = coord.registry().replace(&key, &running).await.unwrap();
    running.acknowledge(Acknowledgement::Stopped);

    match preemptor.await.unwrap() {
        Err(CoordinatorError::PreemptionLimit { key: k, attempts }) => {
            assert_eq!(k, key);
            assert_eq!(attempts, 1);
        }
        other => panic!("expected preemption limit, got {:?}", other.map(|h| h.id())),
    }
    let active = coord.registry().active(&key).await.unwrap();
    assert!(Arc::ptr_eq(&active, &competitor));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_never_overlap() {
    let root = TempDir::new().unwrap();
    let coord = coordinator(
        fake_services(Duration::from_millis(30)),
        &root,
        DEFAULT_MAX_PREEMPT_ATTEMPTS,
    );

    let runs: Vec<_> = (0..5).map(|_| coord.submit(request("acme/site"))).collect();

    let mut statuses = Vec::new();
    for run in runs {
        let outcome = tokio::time::timeout(PATIENCE, run)
            .await
            .expect("run should finish")
            .unwrap()
            .unwrap();
        statuses.push(outcome.status);
    }

    let services = coord.services();
    assert!(services.builder.max_active() <= 1);
    assert!(statuses.contains(&RunStatus::Complete));
    assert!(statuses.iter().all(|s| s.is_complete() || s.is_stopped()));
    assert!(coord.registry().is_empty().await);
    assert_eq!(work_root_entries(&root), 0);
}

#[tokio::test]
async fn keys_run_independently() {
    let root = TempDir::new().unwrap();
    let coord = coordinator(
        fake_services(Duration::from_millis(20)),
        &root,
        DEFAULT_MAX_PREEMPT_ATTEMPTS,
    );

    let a = coord.submit(request("acme/site"));
    let b = coord.submit(request("acme/acme.github.io"));

    assert_eq!(a.await.unwrap().unwrap().status, RunStatus::Complete);
    assert_eq!(b.await.unwrap().unwrap().status, RunStatus::Complete);
    assert_eq!(coord.services().vcs.pushes().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn panicking_runner_releases_key_and_wakes_preemptors() {
    let root = TempDir::new().unwrap();
    let services = ServiceSet {
        builder: FakeBuilder::panicking(Duration::from_millis(100)),
        ..fake_services(Duration::ZERO)
    };
    let coord = coordinator(services, &root, DEFAULT_MAX_PREEMPT_ATTEMPTS);
    let key = repo_key("acme/site");

    let run = coord.submit(request("acme/site"));
    let handle = tokio::time::timeout(PATIENCE, async {
        loop {
            if let Some(active) = coord.registry().active(&key).await {
                return active;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("run never registered");

    // A preemptor blocked on the acknowledgement must be released
    let waiter = {
        let handle = Arc::clone(&handle);
        tokio::spawn(async move { handle.wait_ack().await })
    };

    let result = run.await.unwrap();
    assert!(
        matches!(result, Err(CoordinatorError::RunnerPanicked { ref key }) if key == &repo_key("acme/site")),
        "{:?}",
        result
    );
    let ack = tokio::time::timeout(PATIENCE, waiter).await.unwrap().unwrap();
    assert_eq!(ack, Acknowledgement::SelfCompleted);
    assert!(coord.registry().is_empty().await);
    assert_eq!(work_root_entries(&root), 0);

    let recorded = coord.services().sink.outcomes();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].status, RunStatus::Failed(FailureKind::Panicked));
    assert!(recorded[0].log.contains("finished: failed:panicked"));

    // The key is usable again
    let (_, is_new) = coord.registry().acquire(&key).await;
    assert!(is_new);
}

#[tokio::test]
async fn leftovers_from_an_earlier_process_are_cleared_before_running() {
    let root = TempDir::new().unwrap();
    let coord = coordinator(fake_services(Duration::ZERO), &root, DEFAULT_MAX_PREEMPT_ATTEMPTS);
    // Run ids restart at 1, so the first run would reuse this name
    let leftover = root.path().join("runs").join("acme-site-1");
    std::fs::create_dir_all(leftover.join("public")).unwrap();

    let removed = coord.cleanup_stale_workdirs().unwrap();
    let outcome = coord.run(request("acme/site")).await.unwrap();

    assert_eq!(removed, vec![leftover.clone()]);
    assert_eq!(outcome.status, RunStatus::Complete, "{}", outcome.log);
    assert_eq!(outcome.workdir, Some(leftover));
    assert_eq!(work_root_entries(&root), 0);
}

#[tokio::test]
async fn superseded_outcome_is_recorded_with_its_start_time() {
    let root = TempDir::new().unwrap();
    let coord = coordinator(fake_services(Duration::ZERO), &root, DEFAULT_MAX_PREEMPT_ATTEMPTS);

    let first = coord.run(request("acme/site")).await.unwrap();
    let second = coord.run(request("acme/site")).await.unwrap();

    let recorded = coord.services().sink.outcomes();
    assert_eq!(recorded.len(), 2);
    assert_eq!(recorded[0].started_at, first.started_at);
    assert_eq!(recorded[1].started_at, second.started_at);
    assert!(first.started_at <= second.started_at);
}
