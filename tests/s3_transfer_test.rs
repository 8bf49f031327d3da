//! End-to-end S3 transfers through the queue, the orchestrator and the uploader

mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use common::{catalog, dataset, eventually, metadata, start, submit, terminal, PID};
use openem_ingestor::config::S3TransferConfig;
use openem_ingestor::protocol::s3::{compose_checksum, object_name, sha256, to_base64, S3Uploader};
use openem_ingestor::testing::{
    static_token, BrokerCall, MockBroker, MockCatalog, MockObjectStore, Notification, PutBehavior,
    RecordingNotifier, StaticRefresher,
};
use openem_ingestor::{Orchestrator, Status, TaskQueue, TransferMethod, TransferObjects};
use tokio::sync::Semaphore;

const MIB: usize = 1024 * 1024;

struct Rig {
    queue: Arc<TaskQueue>,
    notifier: Arc<RecordingNotifier>,
    catalog: Arc<MockCatalog>,
    broker: Arc<MockBroker>,
    store: Arc<MockObjectStore>,
}

impl Rig {
    fn new(broker: MockBroker, store: MockObjectStore, chunk_size_mb: u64) -> Self {
        let mut config = S3TransferConfig::new("https://broker.test");
        config.chunk_size_mb = chunk_size_mb;
        config.max_retries = 10;
        config.initial_backoff_ms = 1;
        config.max_backoff_ms = 1;

        let notifier = Arc::new(RecordingNotifier::default());
        let catalog = catalog();
        let broker = Arc::new(broker);
        let store = Arc::new(store);
        let uploader = S3Uploader::new(broker.clone(), store.clone(), config)
            .with_pool(Arc::new(Semaphore::new(8)));
        let orchestrator = Orchestrator::new(catalog.clone(), notifier.clone())
            .with_s3(uploader, Arc::new(StaticRefresher));

        Self {
            queue: start(orchestrator, notifier.clone()),
            notifier,
            catalog,
            broker,
            store,
        }
    }

    async fn submit(&self, folder: &Path, with_metadata: bool) -> uuid::Uuid {
        let objects = TransferObjects {
            scicat_token: "scicat-token".into(),
            metadata: (!with_metadata).then(metadata),
            broker_token: Some(static_token("broker-access")),
            ..Default::default()
        };
        submit(&self.queue, folder, TransferMethod::S3, objects).await
    }

    fn presigned_parts(&self, object: &str) -> Vec<u64> {
        self.broker
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                BrokerCall::PresignedUrls { object: o, parts } if o == object => Some(parts),
                _ => None,
            })
            .collect()
    }
}

fn part_url(object: &str, part: u32) -> String {
    format!("https://store.test/{}?part={}", object, part)
}

#[tokio::test]
async fn test_single_small_file() {
    let dir = dataset(&[("a.bin", 1024)], true);
    let rig = Rig::new(MockBroker::default(), MockObjectStore::default(), 5);

    let id = rig.submit(dir.path(), true).await;
    assert_eq!(terminal(&rig.notifier, id).await, Notification::Completed(id));

    assert_eq!(rig.catalog.datasets().len(), 1);
    let object = object_name(PID, "a.bin");
    assert_eq!(rig.presigned_parts(&object), vec![1]);

    let body = std::fs::read(dir.path().join("a.bin")).unwrap();
    let url = format!("https://store.test/{}", object);
    let puts: Vec<_> = rig.store.puts().into_iter().filter(|p| p.url == url).collect();
    assert_eq!(puts.len(), 1);
    assert_eq!(puts[0].len, 1024);
    assert_eq!(puts[0].checksum, to_base64(&sha256(&body)));

    // Single PUTs are never completed or aborted
    assert!(rig.broker.completes().is_empty());
    assert!(rig.broker.aborts().is_empty());

    let finalized = rig.broker.finalized();
    assert_eq!(finalized.len(), 1);
    assert_eq!(finalized[0].dataset_pid, PID);
    assert_eq!(finalized[0].owner_group, "p1234");
    assert_eq!(rig.catalog.files_ready(), vec![PID.to_string()]);

    let snapshot = rig.queue.get(id).unwrap();
    assert_eq!(snapshot.details.status, Status::Finished);
    assert_eq!(snapshot.dataset_id, PID);
    assert_eq!(snapshot.percent(), 100);
}

#[tokio::test]
async fn test_two_part_multipart_upload() {
    let dir = dataset(&[("big.bin", 7 * MIB)], false);
    let rig = Rig::new(MockBroker::default(), MockObjectStore::default(), 5);

    let id = rig.submit(dir.path(), false).await;
    assert_eq!(terminal(&rig.notifier, id).await, Notification::Completed(id));

    let object = object_name(PID, "big.bin");
    assert_eq!(rig.presigned_parts(&object), vec![2]);

    let body = std::fs::read(dir.path().join("big.bin")).unwrap();
    let (first, second) = body.split_at(5 * MIB);
    let (h1, h2) = (sha256(first), sha256(second));

    let completes = rig.broker.completes();
    assert_eq!(completes.len(), 1);
    let BrokerCall::Complete {
        object: completed,
        upload_id,
        parts,
        checksum,
    } = &completes[0]
    else {
        panic!("unexpected call {:?}", completes[0]);
    };
    assert_eq!(completed, &object);
    assert_eq!(upload_id, "U");
    assert_eq!(parts.len(), 2);
    assert_eq!(parts[0].part_number, 1);
    assert_eq!(parts[0].etag, MockObjectStore::etag_for(first));
    assert_eq!(parts[0].checksum_sha256, to_base64(&h1));
    assert_eq!(parts[1].part_number, 2);
    assert_eq!(parts[1].etag, MockObjectStore::etag_for(second));
    assert_eq!(parts[1].checksum_sha256, to_base64(&h2));
    assert_eq!(checksum, &compose_checksum([&h1, &h2]));

    assert!(rig.broker.aborts().is_empty());
    assert_eq!(rig.store.attempts(&part_url(&object, 1)), 1);
    assert_eq!(rig.store.attempts(&part_url(&object, 2)), 1);
}

#[tokio::test]
async fn test_file_of_exactly_one_chunk_is_one_part_multipart() {
    let dir = dataset(&[("edge.bin", MIB)], false);
    let rig = Rig::new(MockBroker::default(), MockObjectStore::default(), 1);

    let id = rig.submit(dir.path(), false).await;
    assert_eq!(terminal(&rig.notifier, id).await, Notification::Completed(id));

    let object = object_name(PID, "edge.bin");
    assert_eq!(rig.presigned_parts(&object), vec![1]);

    let body = std::fs::read(dir.path().join("edge.bin")).unwrap();
    let digest = sha256(&body);
    match &rig.broker.completes()[..] {
        [BrokerCall::Complete {
            parts, checksum, ..
        }] => {
            assert_eq!(parts.len(), 1);
            assert_eq!(checksum, &compose_checksum([&digest]));
        }
        other => panic!("expected one complete call, got {:?}", other),
    }
}

#[tokio::test]
async fn test_cancel_during_multipart_aborts_once() {
    let dir = dataset(&[("big.bin", 7 * MIB)], false);
    let object = object_name(PID, "big.bin");
    let store = MockObjectStore::default().with(&part_url(&object, 2), PutBehavior::Hang);
    let rig = Rig::new(MockBroker::default(), store, 5);

    let id = rig.submit(dir.path(), false).await;
    let first_part = part_url(&object, 1);
    eventually("first part uploaded", || {
        rig.store.puts().iter().any(|p| p.url == first_part)
    })
    .await;

    rig.queue.cancel(id).unwrap();
    assert_eq!(terminal(&rig.notifier, id).await, Notification::Canceled(id));

    eventually("multipart abort", || !rig.broker.aborts().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(rig.broker.aborts(), vec!["U".to_string()]);
    assert!(rig.broker.completes().is_empty());
    assert!(rig.broker.finalized().is_empty());
    assert!(rig.catalog.files_ready().is_empty());

    // Cancelling again changes nothing
    rig.queue.cancel(id).unwrap();
    assert_eq!(rig.notifier.terminal(id).len(), 1);
    assert_eq!(rig.queue.get(id).unwrap().details.status, Status::Cancelled);
}

#[tokio::test]
async fn test_failing_part_is_retried_then_aborted() {
    let dir = dataset(&[("big.bin", 7 * MIB)], false);
    let object = object_name(PID, "big.bin");
    let store = MockObjectStore::default().with(&part_url(&object, 2), PutBehavior::Fail(500));
    let rig = Rig::new(MockBroker::default(), store, 5);

    let id = rig.submit(dir.path(), false).await;
    match terminal(&rig.notifier, id).await {
        Notification::Failed(failed, message) => {
            assert_eq!(failed, id);
            assert!(message.contains("500"), "{}", message);
        }
        other => panic!("expected a failure, got {:?}", other),
    }

    assert_eq!(rig.store.attempts(&part_url(&object, 2)), 11);
    assert_eq!(rig.broker.aborts(), vec!["U".to_string()]);
    assert!(rig.broker.completes().is_empty());

    let details = rig.queue.get(id).unwrap().details;
    assert_eq!(details.status, Status::Failed);
    assert!(details.message.contains("500"));
}

#[tokio::test]
async fn test_rejected_complete_is_an_integrity_failure() {
    let dir = dataset(&[("edge.bin", MIB)], false);
    let rig = Rig::new(MockBroker::default().failing_complete(400), MockObjectStore::default(), 1);

    let id = rig.submit(dir.path(), false).await;
    match terminal(&rig.notifier, id).await {
        Notification::Failed(_, message) => assert!(message.contains("was rejected"), "{}", message),
        other => panic!("expected a failure, got {:?}", other),
    }
    // Not retried, then aborted
    assert_eq!(rig.broker.completes().len(), 1);
    assert_eq!(rig.broker.aborts().len(), 1);
}

#[tokio::test]
async fn test_failed_abort_keeps_the_cause() {
    let dir = dataset(&[("big.bin", 7 * MIB)], false);
    let object = object_name(PID, "big.bin");
    let store = MockObjectStore::default().with(&part_url(&object, 1), PutBehavior::NoEtag);
    let rig = Rig::new(MockBroker::default().failing_abort(502), store, 5);

    let id = rig.submit(dir.path(), false).await;
    match terminal(&rig.notifier, id).await {
        Notification::Failed(_, message) => {
            assert!(message.contains("ETag"), "{}", message);
        }
        other => panic!("expected a failure, got {:?}", other),
    }
    assert_eq!(rig.broker.aborts().len(), 1);
}

#[tokio::test]
async fn test_empty_dataset_makes_no_broker_calls() {
    let dir = tempfile::tempdir().unwrap();
    let rig = Rig::new(MockBroker::default(), MockObjectStore::default(), 5);

    let id = rig.submit(dir.path(), false).await;
    assert_eq!(terminal(&rig.notifier, id).await, Notification::Completed(id));

    assert!(rig.broker.calls().is_empty());
    assert_eq!(rig.catalog.datasets().len(), 1);
    let snapshot = rig.queue.get(id).unwrap();
    assert_eq!(snapshot.details.bytes_total, 0);
    assert_eq!(snapshot.percent(), 100);
}

#[tokio::test]
async fn test_progress_is_monotonic_and_bounded() {
    let dir = dataset(&[("a.bin", 3 * MIB), ("b.bin", 2 * MIB), ("c.bin", 10)], false);
    let rig = Rig::new(MockBroker::default(), MockObjectStore::default(), 1);

    let id = rig.submit(dir.path(), false).await;
    assert_eq!(terminal(&rig.notifier, id).await, Notification::Completed(id));

    let percents = common::progress_of(&rig.notifier, id);
    assert!(!percents.is_empty());
    assert!(percents.windows(2).all(|w| w[0] < w[1]), "{:?}", percents);
    assert!(percents.iter().all(|p| *p <= 100));

    let details = rig.queue.get(id).unwrap().details;
    assert_eq!(details.bytes_transferred, details.bytes_total);
    assert_eq!(details.files_transferred, 3);
}
