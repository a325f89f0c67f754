//! Transaction manager behaviour: bodies, coordination, casting, guards and
//! the cluster registry.

mod common;

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use bytes::Bytes;
use courier_consensus::Cluster;
use courier_mailbox::{
    BodyError, ClusterRegistry, Error, Key, Mailbox, MailboxConfig, ManagerStats, NodeId,
    ReplicatedMailbox, TransactionBody, TransactionManager, TransactionScope, UserId,
    cluster_name, mailbox_key,
};
use tokio::runtime::Handle;

fn body<T>(
    f: impl FnOnce(&mut dyn TransactionScope) -> Result<T, BodyError> + Send + 'static,
) -> TransactionBody<T> {
    Box::new(f)
}

async fn read(manager: &common::Manager, node: &NodeId, key: &Key) -> Option<Bytes> {
    let committed = manager
        .run_transaction(node, |scope| {
            scope.record_read(key.clone());
            Ok(())
        })
        .await
        .unwrap();

    committed.reads.value(key).cloned()
}

#[tokio::test]
async fn test_run_transaction_commits_writes() {
    let manager = common::manager(common::consensus());
    let node = NodeId::from("n1");
    let key = Key::from("k");

    let committed = manager
        .run_transaction(&node, |scope| {
            scope.record_read(Key::from("k"));
            scope.set(Key::from("k"), Bytes::from_static(b"v1"));
            Ok(42)
        })
        .await
        .unwrap();

    assert_eq!(committed.value, 42);
    // Reads observe the state before the transaction's own writes.
    assert_eq!(committed.reads.value(&key), None);
    assert_eq!(read(&manager, &node, &key).await, Some(Bytes::from_static(b"v1")));
}

#[tokio::test]
async fn test_failed_body_submits_nothing() {
    let (_, store) = common::mailbox();
    let manager = store.manager();
    let (node, user) = (NodeId::from("n1"), UserId::from("u"));

    store.put(&node, &user, Bytes::from_static(b"m")).await.unwrap();
    let before = manager.stats();

    let result = manager
        .run_transaction(&node, |scope| -> Result<(), BodyError> {
            scope.delete(mailbox_key(&user));
            Err(BodyError::aborted("changed my mind"))
        })
        .await;

    assert_matches!(result, Err(Error::Body(BodyError::Aborted(_))));
    assert!(result.unwrap_err().is_retryable());
    assert_eq!(store.count(&node, &user).await.unwrap(), 1);
    assert_eq!(manager.stats().aborted, before.aborted + 1);
}

#[tokio::test]
async fn test_panicking_body_leaves_state_unchanged() {
    let (_, store) = common::mailbox();
    let manager = store.manager();
    let (node, user) = (NodeId::from("n1"), UserId::from("u"));

    store.put(&node, &user, Bytes::from_static(b"m")).await.unwrap();

    let result = manager
        .run_transaction(&node, |scope| -> Result<(), BodyError> {
            scope.set(mailbox_key(&user), Bytes::from_static(b"garbage"));
            panic!("body exploded");
        })
        .await;

    assert_matches!(
        result,
        Err(Error::Body(BodyError::Panicked(message))) if message == "body exploded"
    );
    assert_eq!(store.count(&node, &user).await.unwrap(), 1);
}

#[tokio::test]
async fn test_coordinated_bodies_commit_once() {
    let manager = common::manager(common::consensus());
    let node = NodeId::from("n1");

    let bodies: Vec<TransactionBody<usize>> = vec![
        body(|scope| {
            scope.record_read(Key::from("a"));
            scope.set(Key::from("a"), Bytes::from_static(b"1"));
            Ok(scope.reads().len())
        }),
        body(|scope| {
            // Sees the read recorded by the first body.
            scope.record_read(Key::from("b"));
            scope.set(Key::from("b"), Bytes::from_static(b"2"));
            scope.set(Key::from("a"), Bytes::from_static(b"3"));
            Ok(scope.reads().len())
        }),
    ];

    let committed = manager.coordinate_transaction(&node, bodies).await.unwrap();

    assert_eq!(committed.value, vec![1, 2]);
    assert_eq!(committed.reads.len(), 2);
    assert_eq!(read(&manager, &node, &Key::from("a")).await, Some(Bytes::from_static(b"3")));
    assert_eq!(read(&manager, &node, &Key::from("b")).await, Some(Bytes::from_static(b"2")));
    assert_eq!(manager.stats().committed, 3);
}

#[tokio::test]
async fn test_coordinated_failure_aborts_everything() {
    let manager = common::manager(common::consensus());
    let node = NodeId::from("n1");

    let bodies: Vec<TransactionBody<()>> = vec![
        body(|scope| {
            scope.set(Key::from("a"), Bytes::from_static(b"1"));
            Ok(())
        }),
        body(|_| Err(BodyError::aborted("first"))),
        body(|_| panic!("second")),
        body(|scope| {
            scope.set(Key::from("b"), Bytes::from_static(b"1"));
            Ok(())
        }),
    ];

    let result = manager.coordinate_transaction(&node, bodies).await;

    assert_matches!(result, Err(Error::Bodies(errors)) if errors == vec![
        BodyError::aborted("first"),
        BodyError::Panicked("second".to_string()),
    ]);
    assert_eq!(read(&manager, &node, &Key::from("a")).await, None);
    assert_eq!(read(&manager, &node, &Key::from("b")).await, None);
}

#[tokio::test]
async fn test_cast_transaction_applies_in_background() {
    let manager = common::manager(common::consensus());
    let node = NodeId::from("n1");

    manager.cast_transaction(node.clone(), |scope| {
        scope.set(Key::from("cast"), Bytes::from_static(b"done"));
        Ok(())
    });

    common::eventually(|| {
        let manager = manager.clone();
        let node = node.clone();
        async move { read(&manager, &node, &Key::from("cast")).await.is_some() }
    })
    .await;
}

#[tokio::test]
async fn test_cast_transaction_failure_is_counted() {
    let manager = common::manager(common::consensus());

    manager.cast_transaction(NodeId::from("n1"), |_| -> Result<(), BodyError> {
        Err(BodyError::aborted("nope"))
    });

    common::eventually(|| {
        let manager = manager.clone();
        async move { manager.stats().aborted == 1 }
    })
    .await;
}

#[tokio::test]
async fn test_stale_guard_conflicts() {
    let manager = common::manager(common::consensus());
    let node = NodeId::from("n1");
    let key = Key::from("k");

    manager
        .run_transaction(&node, |scope| {
            scope.set(key.clone(), Bytes::from_static(b"1"));
            Ok(())
        })
        .await
        .unwrap();

    let result = manager
        .run_transaction(&node, |scope| {
            scope.expect_version(key.clone(), None);
            scope.set(key.clone(), Bytes::from_static(b"2"));
            Ok(())
        })
        .await;

    assert_matches!(result, Err(Error::Conflict { attempts: 1 }));
    assert_eq!(read(&manager, &node, &key).await, Some(Bytes::from_static(b"1")));
    assert_eq!(manager.stats().conflicts, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_read_modify_write_retries_after_interference() {
    let manager = common::manager(common::consensus());
    let node = NodeId::from("n1");
    let key = Key::from("counter");
    let handle = Handle::current();
    let mut calls = 0;

    let total = manager
        .read_modify_write(&node, vec![key.clone()], |snapshot, scope| {
            calls += 1;
            let current = snapshot.value(&key).map_or(0, |v| v[0]);

            if calls == 1 {
                // Another writer commits between the read and the guarded write.
                let other = manager.clone();
                tokio::task::block_in_place(|| {
                    handle.block_on(other.run_transaction(&node, |scope| {
                        scope.set(key.clone(), Bytes::from_static(&[10]));
                        Ok(())
                    }))
                })
                .map_err(|e| BodyError::aborted(e.to_string()))?;
            }

            scope.set(key.clone(), Bytes::from(vec![current + 1]));
            Ok(current + 1)
        })
        .await
        .unwrap();

    assert_eq!(calls, 2);
    assert_eq!(total, 11);
    assert_eq!(read(&manager, &node, &key).await, Some(Bytes::from_static(&[11])));
    assert_eq!(manager.stats().conflicts, 1);
}

#[tokio::test]
async fn test_read_modify_write_gives_up() {
    let consensus = common::consensus();
    let manager =
        TransactionManager::new(consensus, MailboxConfig::default().with_max_conflict_retries(2))
            .unwrap();
    let node = NodeId::from("n1");
    let key = Key::from("k");

    let mut attempts = 0;
    let result = manager
        .read_modify_write(&node, vec![key.clone()], |_, scope| {
            attempts += 1;
            // Guard on a version the key can never have.
            scope.expect_version(key.clone(), Some(u64::MAX));
            scope.set(key.clone(), Bytes::new());
            Ok(())
        })
        .await;

    assert_matches!(result, Err(Error::Conflict { attempts: 3 }));
    assert_eq!(attempts, 3);
    assert_eq!(read(&manager, &node, &key).await, None);
}

#[tokio::test]
async fn test_stats_track_outcomes() {
    let (consensus, store) = common::mailbox();
    let (node, user) = (NodeId::from("n1"), UserId::from("u"));

    store.put(&node, &user, Bytes::from_static(b"m")).await.unwrap();
    store.consume(&node, &user).await.unwrap();
    assert_matches!(store.consume(&node, &user).await, Err(Error::Empty));

    consensus.set_available(false);
    store
        .count(&NodeId::from("n2"), &user)
        .await
        .unwrap_err();

    assert_eq!(
        store.manager().stats(),
        ManagerStats {
            started: 4,
            committed: 3,
            aborted: 0,
            failed: 1,
            conflicts: 0,
        }
    );
}

#[tokio::test]
async fn test_registry_creates_one_cluster_per_node() {
    let consensus = common::consensus();
    let registry = Arc::new(ClusterRegistry::new(consensus.clone(), "mailbox"));
    let node = NodeId::from("n1");

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let node = node.clone();
            tokio::spawn(async move { registry.get_or_create(&node).await })
        })
        .collect();

    for result in futures::future::join_all(handles).await {
        let cluster = result.unwrap().unwrap();
        assert_eq!(cluster.name(), &cluster_name("mailbox", &node).unwrap());
    }

    assert_eq!(consensus.cluster_count(), 1);
    assert_eq!(registry.len(), 1);
    assert!(registry.contains(&node));
    assert_eq!(registry.node_ids(), vec![node]);
}

#[tokio::test]
async fn test_registry_does_not_cache_failures() {
    let consensus = common::consensus();
    let registry = ClusterRegistry::new(consensus.clone(), "mailbox");
    let node = NodeId::from("n1");

    consensus.set_available(false);
    assert_matches!(registry.get_or_create(&node).await, Err(Error::Cluster { .. }));
    assert!(!registry.contains(&node));
    assert!(registry.is_empty());

    consensus.set_available(true);
    registry.get_or_create(&node).await.unwrap();
    assert!(registry.contains(&node));
}

#[tokio::test]
async fn test_shared_registry_and_shutdown() {
    let consensus = common::consensus();
    let registry = Arc::new(ClusterRegistry::new(consensus.clone(), "mailbox"));
    let first = ReplicatedMailbox::new(
        TransactionManager::with_registry(Arc::clone(&registry), MailboxConfig::default())
            .unwrap(),
    );
    let second = ReplicatedMailbox::new(
        TransactionManager::with_registry(Arc::clone(&registry), MailboxConfig::default())
            .unwrap(),
    );
    let (node, user) = (NodeId::from("n1"), UserId::from("u"));

    first.put(&node, &user, Bytes::from_static(b"m1")).await.unwrap();
    first.put(&node, &user, Bytes::from_static(b"m2")).await.unwrap();
    assert_eq!(second.consume(&node, &user).await.unwrap().payload, "m1");
    assert_eq!(consensus.cluster_count(), 1);

    let survivor = first.clone();
    first.manager().shutdown();
    assert!(survivor.manager().is_shut_down());
    assert_matches!(
        survivor.put(&node, &user, Bytes::from_static(b"late")).await,
        Err(Error::Shutdown)
    );

    // The other manager still reaches the same cluster and its messages.
    assert!(registry.contains(&node));
    assert!(!second.manager().is_shut_down());
    assert_eq!(second.count(&node, &user).await.unwrap(), 1);
    assert_eq!(second.consume(&node, &user).await.unwrap().payload, "m2");
    second.put(&node, &user, Bytes::from_static(b"m3")).await.unwrap();
    assert_eq!(second.count(&node, &user).await.unwrap(), 1);
    assert_eq!(consensus.cluster_count(), 1);
}

#[tokio::test]
async fn test_shut_down_manager_rejects_every_entry_point() {
    let manager = common::manager(common::consensus());
    let node = NodeId::from("n1");
    manager.shutdown();

    assert_matches!(
        manager.run_transaction(&node, |_| Ok(())).await,
        Err(Error::Shutdown)
    );
    assert_matches!(
        manager.coordinate_transaction::<()>(&node, Vec::new()).await,
        Err(Error::Shutdown)
    );
    assert_matches!(
        manager.read_modify_write(&node, Vec::new(), |_, _| Ok(())).await,
        Err(Error::Shutdown)
    );
    assert_eq!(manager.stats(), ManagerStats::default());
    assert!(manager.registry().is_empty());
}

#[test]
fn test_with_registry_validates_config() {
    let registry = Arc::new(ClusterRegistry::new(common::consensus(), "mailbox"));

    let zero_timeout = TransactionManager::with_registry(
        Arc::clone(&registry),
        MailboxConfig::default().with_propose_timeout(Duration::ZERO),
    );
    assert_matches!(zero_timeout, Err(Error::InvalidConfig(_)));

    let other_prefix = TransactionManager::with_registry(
        Arc::clone(&registry),
        MailboxConfig::default().with_cluster_prefix("inbox"),
    );
    assert_matches!(other_prefix, Err(Error::InvalidConfig(_)));
}

#[test]
fn test_invalid_config_rejected() {
    let result = TransactionManager::new(
        common::consensus(),
        MailboxConfig::default().with_cluster_prefix("bad prefix"),
    );
    assert_matches!(result, Err(Error::InvalidConfig(_)));
}
