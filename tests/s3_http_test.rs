//! S3 uploads through the HTTP broker and object-store clients against a local server

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path as UrlPath, State};
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{post, put};
use axum::{Json, Router};
use openem_ingestor::config::S3TransferConfig;
use openem_ingestor::core::{RetryPolicy, TransferProgress};
use openem_ingestor::protocol::s3::{
    compose_checksum, object_name, sha256, to_base64, BrokerClient, HttpObjectStore, S3Uploader,
    CHECKSUM_HEADER,
};
use openem_ingestor::task::ArchivalJobInfo;
use openem_ingestor::{FileEntry, LoggingNotifier, TransferMethod, TransferObjects, TransferTask};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

const PID: &str = "20.500.11935/wire";
const MIB: usize = 1024 * 1024;
const TOKEN: &str = "broker-access";

/// One request seen by the local server
#[derive(Debug, Clone)]
struct Seen {
    /// Broker RPC name, or `PUT <path>?<query>` for object-store uploads
    target: String,
    authorization: Option<String>,
    checksum: Option<String>,
    body: Value,
    len: usize,
}

/// Broker under `/broker/<rpc>`, object store under `/store/<object>?part=<n>`
#[derive(Clone)]
struct LocalS3 {
    base: String,
    complete_status: StatusCode,
    seen: Arc<Mutex<Vec<Seen>>>,
}

impl LocalS3 {
    async fn start(complete_status: StatusCode) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Self {
            base: format!("http://{}", addr),
            complete_status,
            seen: Arc::new(Mutex::new(Vec::new())),
        };
        let app = Router::new()
            .route("/broker/:rpc", post(broker_rpc))
            .route("/store/*object", put(store_put))
            .with_state(server.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        server
    }

    fn seen(&self, target: &str) -> Vec<Seen> {
        self.seen
            .lock()
            .iter()
            .filter(|s| s.target == target)
            .cloned()
            .collect()
    }

    fn puts(&self) -> Vec<Seen> {
        self.seen
            .lock()
            .iter()
            .filter(|s| s.target.starts_with("PUT "))
            .cloned()
            .collect()
    }

    fn uploader(&self, chunk_size_mb: u64) -> S3Uploader {
        let mut config = S3TransferConfig::new(format!("{}/broker", self.base));
        config.chunk_size_mb = chunk_size_mb;
        config.max_retries = 10;
        config.initial_backoff_ms = 1;
        config.max_backoff_ms = 1;

        let broker = BrokerClient::new(
            config.endpoint.clone(),
            Duration::from_secs(10),
            RetryPolicy::immediate(10),
        )
        .unwrap();
        let store = HttpObjectStore::shared(Duration::from_secs(10)).unwrap();
        S3Uploader::new(Arc::new(broker), Arc::new(store), config)
            .with_pool(Arc::new(Semaphore::new(4)))
    }
}

async fn broker_rpc(
    State(server): State<LocalS3>,
    UrlPath(rpc): UrlPath<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    server.seen.lock().push(Seen {
        target: rpc.clone(),
        authorization: header_value(&headers, header::AUTHORIZATION.as_str()),
        checksum: None,
        body: body.clone(),
        len: 0,
    });

    match rpc.as_str() {
        "presignedUrls" => {
            let object = body["object_name"].as_str().unwrap_or_default();
            let parts = body["parts"].as_u64().unwrap_or(1);
            let urls: Vec<String> = (1..=parts)
                .map(|n| format!("{}/store/{}?part={}", server.base, object, n))
                .collect();
            if parts > 1 || object.ends_with("big.bin") {
                Json(json!({ "uploadID": "U", "urls": urls })).into_response()
            } else {
                Json(json!({ "urls": urls })).into_response()
            }
        }
        "completeUpload" => (server.complete_status, "completion refused").into_response(),
        _ => StatusCode::OK.into_response(),
    }
}

async fn store_put(
    State(server): State<LocalS3>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let part = uri
        .query()
        .and_then(|q| q.strip_prefix("part="))
        .unwrap_or("0")
        .to_string();
    server.seen.lock().push(Seen {
        target: format!("PUT {}", uri),
        authorization: header_value(&headers, header::AUTHORIZATION.as_str()),
        checksum: header_value(&headers, CHECKSUM_HEADER),
        body: Value::Null,
        len: body.len(),
    });
    (StatusCode::OK, [(header::ETAG, format!("\"etag-{}\"", part))]).into_response()
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn write_file(dir: &Path, name: &str, len: usize) -> Vec<u8> {
    let body: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    std::fs::write(dir.join(name), &body).unwrap();
    body
}

async fn upload(
    uploader: &S3Uploader,
    dir: &Path,
    files: Vec<FileEntry>,
) -> openem_ingestor::Result<()> {
    let task = Arc::new(TransferTask::new(
        uuid::Uuid::new_v4(),
        dir.to_path_buf(),
        files.clone(),
        TransferMethod::S3,
        TransferObjects::default(),
        CancellationToken::new(),
    ));
    let progress = Arc::new(TransferProgress::new(task, Arc::new(LoggingNotifier)));
    uploader
        .upload_dataset(PID, dir, &files, TOKEN, progress, &CancellationToken::new())
        .await
}

#[tokio::test]
async fn test_http_clients_follow_the_broker_protocol() {
    let server = LocalS3::start(StatusCode::OK).await;
    let dir = tempfile::tempdir().unwrap();
    let small = write_file(dir.path(), "small.bin", 1000);
    let big = write_file(dir.path(), "big.bin", MIB + MIB / 2);
    let files = vec![
        FileEntry::new("big.bin", big.len() as u64),
        FileEntry::new("small.bin", small.len() as u64),
    ];

    let uploader = server.uploader(1);
    upload(&uploader, dir.path(), files).await.unwrap();
    uploader
        .finalize_dataset(
            TOKEN,
            PID,
            &ArchivalJobInfo {
                owner_user: "alice".into(),
                owner_group: "p1234".into(),
                contact_email: "alice@example.org".into(),
                auto_archive: true,
            },
        )
        .await
        .unwrap();

    // Every broker RPC carries the task's broker token
    let broker_calls: Vec<Seen> = server
        .seen
        .lock()
        .iter()
        .filter(|s| !s.target.starts_with("PUT "))
        .cloned()
        .collect();
    assert_eq!(broker_calls.len(), 4);
    for call in &broker_calls {
        assert_eq!(call.authorization.as_deref(), Some("Bearer broker-access"), "{:?}", call);
    }

    let big_object = object_name(PID, "big.bin");
    let small_object = object_name(PID, "small.bin");
    let mut requested: Vec<Value> = server
        .seen("presignedUrls")
        .into_iter()
        .map(|s| s.body)
        .collect();
    requested.sort_by_key(|b| b["parts"].as_u64());
    assert_eq!(
        requested,
        vec![
            json!({ "object_name": small_object, "parts": 1 }),
            json!({ "object_name": big_object, "parts": 2 }),
        ]
    );

    // PUTs carry the body checksum and never the broker token
    let (first, second) = big.split_at(MIB);
    let mut puts = server.puts();
    puts.sort_by(|a, b| a.target.cmp(&b.target));
    assert_eq!(puts.len(), 3);
    let expected = [
        (format!("PUT /store/{}?part=1", big_object), to_base64(&sha256(first)), first.len()),
        (format!("PUT /store/{}?part=2", big_object), to_base64(&sha256(second)), second.len()),
        (format!("PUT /store/{}?part=1", small_object), to_base64(&sha256(&small)), small.len()),
    ];
    for (put, (target, checksum, len)) in puts.iter().zip(expected.iter()) {
        assert_eq!(&put.target, target);
        assert_eq!(put.checksum.as_ref(), Some(checksum));
        assert_eq!(put.len, *len);
        assert!(put.authorization.is_none());
    }

    // ETags arrive quoted and are reported bare
    let completes = server.seen("completeUpload");
    assert_eq!(completes.len(), 1);
    assert_eq!(
        completes[0].body,
        json!({
            "object_name": big_object,
            "uploadID": "U",
            "parts": [
                { "ETag": "etag-1", "PartNumber": 1, "ChecksumSHA256": to_base64(&sha256(first)) },
                { "ETag": "etag-2", "PartNumber": 2, "ChecksumSHA256": to_base64(&sha256(second)) },
            ],
            "checksumSHA256": compose_checksum([&sha256(first), &sha256(second)]),
        })
    );
    assert!(server.seen("abortMultipartUpload").is_empty());

    let finalized = server.seen("finalizeDatasetUpload");
    assert_eq!(finalized.len(), 1);
    assert_eq!(
        finalized[0].body,
        json!({
            "datasetPID": PID,
            "ownerUser": "alice",
            "ownerGroup": "p1234",
            "contactEmail": "alice@example.org",
            "createArchivingJob": true,
        })
    );
}

#[tokio::test]
async fn test_failing_completion_is_bounded_by_max_retries() {
    let server = LocalS3::start(StatusCode::INTERNAL_SERVER_ERROR).await;
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "big.bin", MIB);

    let uploader = server.uploader(1);
    let err = upload(&uploader, dir.path(), vec![FileEntry::new("big.bin", MIB as u64)])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("500"), "{}", err);

    // One initial attempt plus ten retries, then a single abort
    assert_eq!(server.seen("completeUpload").len(), 11);
    let aborts = server.seen("abortMultipartUpload");
    assert_eq!(aborts.len(), 1);
    assert_eq!(
        aborts[0].body,
        json!({ "object_name": object_name(PID, "big.bin"), "uploadID": "U" })
    );
}

#[tokio::test]
async fn test_rejected_completion_is_not_retried() {
    let server = LocalS3::start(StatusCode::BAD_REQUEST).await;
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "big.bin", MIB);

    let uploader = server.uploader(1);
    let err = upload(&uploader, dir.path(), vec![FileEntry::new("big.bin", MIB as u64)])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("rejected"), "{}", err);

    assert_eq!(server.seen("completeUpload").len(), 1);
    assert_eq!(server.seen("abortMultipartUpload").len(), 1);
}
