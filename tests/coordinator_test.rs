mod common;

use common::{FakeRm, RecordingStore};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use xacoord::resource::{
    ResourceDescriptor, ResourceRegistry, Vote, XaErrorKind, XaFlags, XaResource,
};
use xacoord::transaction::{
    Outcome, Repository, TransactionManager, TransactionServices, TransactionStatus, Xid,
    XidFactory,
};
use xacoord::txlog::{TransactionLog, TransactionStore};
use xacoord::{Coordinator, CoordinatorConfig};

fn config(dir: &Path, name: &str, node_id: u32) -> CoordinatorConfig {
    CoordinatorConfig {
        node_id,
        recovery_base_delay: Duration::from_millis(1),
        ..CoordinatorConfig::with_log_path(dir.join(name))
    }
}

fn registry_of(resources: &[&Arc<FakeRm>]) -> Arc<ResourceRegistry> {
    let registry = Arc::new(ResourceRegistry::new());
    for rm in resources {
        let rm: Arc<dyn XaResource> = Arc::<FakeRm>::clone(*rm);
        registry.register_native(rm);
    }
    registry
}

fn enlist(tm: &TransactionManager, rm: &Arc<FakeRm>) {
    let key = rm.resource_key();
    let rm: Arc<dyn XaResource> = Arc::<FakeRm>::clone(rm);
    tm.enlist_resource(rm, ResourceDescriptor::native(key)).unwrap();
}

#[test]
fn test_two_phase_commit_of_two_branches() {
    let dir = tempdir().unwrap();
    let (a, b) = (FakeRm::new("rm-a"), FakeRm::new("rm-b"));
    let coordinator =
        Coordinator::open(config(dir.path(), "a.log", 1), registry_of(&[&a, &b])).unwrap();
    let tm = coordinator.manager();

    tm.begin().unwrap();
    enlist(tm, &a);
    enlist(tm, &b);
    let txn = tm.current().unwrap();
    assert_eq!(txn.branch_count(), 2);

    let completion = tm.commit().unwrap();
    assert_eq!(completion.outcome, Outcome::Committed);
    assert_eq!(txn.status(), TransactionStatus::Committed);
    assert_eq!((a.committed(), b.committed()), (1, 1));
    assert_eq!((a.in_doubt(), b.in_doubt()), (0, 0));
    assert!(coordinator.log().is_empty());
    assert!(coordinator.repository().is_empty());
    assert_eq!(tm.status(), TransactionStatus::NoTransaction);
}

#[test]
fn test_failed_prepare_rolls_back_every_branch() {
    let dir = tempdir().unwrap();
    let (a, b) = (FakeRm::new("rm-a"), FakeRm::new("rm-b"));
    b.state.lock().prepare_error = Some(XaErrorKind::RollbackRequired);
    let coordinator =
        Coordinator::open(config(dir.path(), "a.log", 1), registry_of(&[&a, &b])).unwrap();
    let tm = coordinator.manager();

    tm.begin().unwrap();
    enlist(tm, &a);
    enlist(tm, &b);
    let txn = tm.current().unwrap();

    let completion = tm.commit().unwrap();
    assert_eq!(completion.outcome, Outcome::RolledBack);
    assert!(completion.cause.is_some());
    assert_eq!(txn.status(), TransactionStatus::RolledBack);
    assert_eq!((a.rolled_back(), b.rolled_back()), (1, 1));
    assert_eq!((a.committed(), b.committed()), (0, 0));
    assert!(coordinator.log().is_empty());
}

#[test]
fn test_one_phase_heuristic_rollback_is_reported() {
    let dir = tempdir().unwrap();
    let log = TransactionLog::open(dir.path().join("c.log"), false).unwrap();
    let store = RecordingStore::new(log);
    let rm = FakeRm::new("rm");
    rm.state.lock().commit_error = Some(XaErrorKind::HeuristicRollback);
    let services = TransactionServices::new(
        store.clone(),
        registry_of(&[&rm]),
        Arc::new(XidFactory::new(1)),
    );
    let tm = TransactionManager::new(
        services,
        Arc::new(Repository::new()),
        Duration::from_secs(60),
    );

    tm.begin().unwrap();
    enlist(&tm, &rm);
    let txn = tm.current().unwrap();

    let completion = tm.commit().unwrap();
    assert_eq!(completion.outcome, Outcome::HeuristicRollback);
    assert_eq!(txn.status(), TransactionStatus::RolledBack);
    assert_eq!(rm.state.lock().forgotten.len(), 1);

    let updates = store.branch_updates.lock();
    let last = updates.last().unwrap();
    assert!(last.rolledback);
    assert!(last.heuristic);
    assert!(!last.committed);
    drop(updates);
    assert!(store.log.is_empty());
}

#[test]
fn test_read_only_branches_commit_without_second_phase() {
    let dir = tempdir().unwrap();
    let (a, b) = (FakeRm::new("rm-a"), FakeRm::new("rm-b"));
    a.state.lock().read_only = true;
    b.state.lock().read_only = true;
    let coordinator =
        Coordinator::open(config(dir.path(), "a.log", 1), registry_of(&[&a, &b])).unwrap();
    let tm = coordinator.manager();

    tm.begin().unwrap();
    enlist(tm, &a);
    enlist(tm, &b);
    assert_eq!(tm.commit().unwrap().outcome, Outcome::Committed);
    assert_eq!((a.committed(), b.committed()), (0, 0));
    assert!(coordinator.log().is_empty());
}

#[test]
fn test_recovery_commits_prepared_transaction_after_crash() {
    let dir = tempdir().unwrap();
    let (a, b) = (FakeRm::new("rm-a"), FakeRm::new("rm-b"));
    a.state.lock().panic_on_commit = true;

    let gid = {
        let coordinator =
            Coordinator::open(config(dir.path(), "a.log", 1), registry_of(&[&a, &b])).unwrap();
        let tm = coordinator.manager();
        let gid = tm.begin().unwrap();
        enlist(tm, &a);
        enlist(tm, &b);
        let crashed = panic::catch_unwind(AssertUnwindSafe(|| tm.commit()));
        assert!(crashed.is_err());
        assert_eq!(
            coordinator.log().get(&gid).unwrap().status,
            TransactionStatus::Prepared
        );
        gid
    };
    assert_eq!((a.in_doubt(), b.in_doubt()), (1, 1));
    a.state.lock().panic_on_commit = false;

    let coordinator =
        Coordinator::open(config(dir.path(), "a.log", 1), registry_of(&[&a, &b])).unwrap();
    assert_eq!(coordinator.repository().in_error_count(), 1);
    assert!(coordinator.manager().lookup(&gid).is_some());

    let stats = coordinator.recovery().run_at(u64::MAX);
    assert_eq!(stats.examined, 1);
    assert_eq!(stats.committed, 1);
    assert_eq!((a.committed(), b.committed()), (1, 1));
    assert_eq!((a.in_doubt(), b.in_doubt()), (0, 0));
    assert!(coordinator.log().is_empty());
    assert!(coordinator.repository().is_empty());
}

#[test]
fn test_unreachable_branch_is_finished_by_recovery() {
    let dir = tempdir().unwrap();
    let (a, b) = (FakeRm::new("rm-a"), FakeRm::new("rm-b"));
    b.state.lock().commit_error = Some(XaErrorKind::Unavailable);
    let coordinator =
        Coordinator::open(config(dir.path(), "a.log", 1), registry_of(&[&a, &b])).unwrap();
    let tm = coordinator.manager();

    let gid = tm.begin().unwrap();
    enlist(tm, &a);
    enlist(tm, &b);
    assert_eq!(tm.commit().unwrap().outcome, Outcome::CompletionRequired);
    assert_eq!(coordinator.repository().in_error_count(), 1);
    assert_eq!(coordinator.log().len(), 1);
    assert_eq!(a.committed(), 1);

    // Still down: the attempt is counted and the transaction stays in error.
    let stats = coordinator.recovery().run_at(u64::MAX);
    assert_eq!(stats.unresolved, 1);
    assert_eq!(coordinator.manager().lookup(&gid).unwrap().recovered_times(), 1);

    b.state.lock().commit_error = None;
    let stats = coordinator.recovery().run_at(u64::MAX);
    assert_eq!(stats.committed, 1);
    assert_eq!((a.committed(), b.committed()), (1, 1));
    assert!(coordinator.log().is_empty());
    assert_eq!(coordinator.repository().in_error_count(), 0);
}

#[test]
fn test_transaction_spans_two_coordinators() {
    let dir = tempdir().unwrap();
    let (rm_a, rm_b) = (FakeRm::new("rm-a"), FakeRm::new("rm-b"));
    let node_b =
        Coordinator::open(config(dir.path(), "b.log", 2), registry_of(&[&rm_b])).unwrap();
    let registry_a = registry_of(&[&rm_a]);
    let endpoint: Arc<dyn XaResource> = Arc::new(node_b.endpoint("node-b"));
    registry_a.register_remote("node-b", Arc::clone(&endpoint));
    let node_a = Coordinator::open(config(dir.path(), "a.log", 1), registry_a).unwrap();

    let tm = node_a.manager();
    let gid = tm.begin().unwrap();
    enlist(tm, &rm_a);
    tm.enlist_resource(endpoint, ResourceDescriptor::remote("node-b"))
        .unwrap();

    // Work done on node b joins the imported transaction.
    let imported = node_b.manager().lookup(&gid).unwrap();
    assert!(!imported.is_coordinator());
    assert_eq!(imported.propagated_by().as_deref(), Some("node-1"));
    let rm: Arc<dyn XaResource> = rm_b.clone();
    imported
        .enlist_resource(rm, ResourceDescriptor::native("rm-b"))
        .unwrap();

    assert_eq!(tm.commit().unwrap().outcome, Outcome::Committed);
    assert_eq!((rm_a.committed(), rm_b.committed()), (1, 1));
    assert!(node_b.manager().lookup(&gid).is_none());
    assert!(node_a.log().is_empty());
    assert!(node_b.log().is_empty());
}

#[test]
fn test_timed_out_transaction_is_rolled_back() {
    let dir = tempdir().unwrap();
    let rm = FakeRm::new("rm");
    let coordinator =
        Coordinator::open(config(dir.path(), "a.log", 1), registry_of(&[&rm])).unwrap();
    let tm = coordinator.manager();

    tm.set_transaction_timeout(Duration::from_millis(1));
    let gid = tm.begin().unwrap();
    enlist(tm, &rm);
    tm.suspend().unwrap();
    std::thread::sleep(Duration::from_millis(5));

    assert_eq!(tm.timeout_scan(), 1);
    assert_eq!(rm.rolled_back(), 1);
    assert!(tm.lookup(&gid).is_none());
    assert!(tm.resume(gid).is_err());
    assert!(coordinator.log().is_empty());
}

#[test]
fn test_orphan_branches_are_rolled_back() {
    let dir = tempdir().unwrap();
    let rm = FakeRm::new("rm");
    let ours = XidFactory::new(1);
    let theirs = XidFactory::new(9);
    let orphan = ours.create_branch_id(ours.create_global_id(), 1);
    let foreign = theirs.create_branch_id(theirs.create_global_id(), 1);
    {
        let mut state = rm.state.lock();
        state.prepared.insert(orphan);
        state.prepared.insert(foreign);
    }

    let coordinator =
        Coordinator::open(config(dir.path(), "a.log", 1), registry_of(&[&rm])).unwrap();
    let stats = coordinator.recover_now();
    assert_eq!(stats.orphans_rolled_back, 1);
    assert_eq!(rm.state.lock().rolled_back, vec![orphan]);
    assert!(rm.state.lock().prepared.contains(&foreign));
}

#[test]
fn test_rollback_only_commit_rolls_back() {
    let dir = tempdir().unwrap();
    let rm = FakeRm::new("rm");
    let coordinator =
        Coordinator::open(config(dir.path(), "a.log", 1), registry_of(&[&rm])).unwrap();
    let tm = coordinator.manager();

    tm.begin().unwrap();
    enlist(tm, &rm);
    tm.set_rollback_only().unwrap();
    assert_eq!(tm.status(), TransactionStatus::MarkedRollback);

    let completion = tm.commit().unwrap();
    assert_eq!(completion.outcome, Outcome::HeuristicRollback);
    assert_eq!(rm.rolled_back(), 1);
    assert_eq!(rm.committed(), 0);
}

#[test]
fn test_restarted_participant_commits_local_branches() {
    let dir = tempdir().unwrap();
    let rm = FakeRm::new("rm-b");
    let peer = XidFactory::new(1);
    let xid = peer.create_branch_id(peer.create_global_id(), 1);

    {
        let node_b =
            Coordinator::open(config(dir.path(), "b.log", 2), registry_of(&[&rm])).unwrap();
        let endpoint = node_b.endpoint("node-b");
        endpoint.start(&xid, XaFlags::NO_FLAGS).unwrap();
        let local: Arc<dyn XaResource> = rm.clone();
        node_b
            .manager()
            .lookup(&xid.global_id())
            .unwrap()
            .enlist_resource(local, ResourceDescriptor::native("rm-b"))
            .unwrap();
        endpoint.end(&xid, XaFlags::SUCCESS).unwrap();
        assert_eq!(endpoint.prepare(&xid).unwrap(), Vote::Ok);
    }
    assert_eq!(rm.in_doubt(), 1);

    let node_b = Coordinator::open(config(dir.path(), "b.log", 2), registry_of(&[&rm])).unwrap();
    let endpoint = node_b.endpoint("node-b");
    assert_eq!(
        endpoint.recover(XaFlags::START_RSCAN).unwrap(),
        vec![Xid::for_transaction(xid.global_id())]
    );

    endpoint.commit(&xid, false).unwrap();
    assert_eq!(rm.committed(), 1);
    assert_eq!(rm.in_doubt(), 0);
    assert!(node_b.manager().lookup(&xid.global_id()).is_none());
    assert_eq!(node_b.repository().in_error_count(), 0);
    assert!(node_b.log().is_empty());
}

#[test]
fn test_timeout_scan_leaves_recovered_transactions_to_recovery() {
    let dir = tempdir().unwrap();
    let rm = FakeRm::new("rm");
    let short = || CoordinatorConfig {
        default_timeout: Duration::from_millis(1),
        ..config(dir.path(), "a.log", 1)
    };

    let gid = {
        let coordinator = Coordinator::open(short(), registry_of(&[&rm])).unwrap();
        let tm = coordinator.manager();
        let gid = tm.begin().unwrap();
        enlist(tm, &rm);
        tm.suspend().unwrap();
        gid
    };

    let coordinator = Coordinator::open(short(), registry_of(&[&rm])).unwrap();
    assert_eq!(coordinator.repository().in_error_count(), 1);
    std::thread::sleep(Duration::from_millis(5));

    assert_eq!(coordinator.manager().timeout_scan(), 0);
    assert_eq!(rm.rolled_back(), 0);
    assert!(coordinator.manager().lookup(&gid).is_some());
    assert_eq!(coordinator.log().len(), 1);

    let stats = coordinator.recovery().run_at(u64::MAX);
    assert_eq!(stats.rolled_back, 1);
    assert_eq!(rm.rolled_back(), 1);
    assert!(coordinator.log().is_empty());
    assert!(coordinator.repository().is_empty());
}
