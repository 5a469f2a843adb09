//! End-to-end runs of the orchestrator against a mocked provider and a real
//! on-disk artifact store.

use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use genmedia_core::fetcher::no_redirect_client;
use genmedia_core::lock::LockStoreError;
use genmedia_core::{
    AcquireOutcome, DedupLock, FileLockStore, FsArtifactStore, GeminiProvider, GenerationPipeline,
    ImageResizer, JobSubmitter, LockPolicy, LockStore, MemoryLockStore, Orchestrator, Poller,
    ResultFetcher, SourceLoader, TransformPipeline,
};
use genmedia_types::{ErrorKind, GenerationRequest, mime, shape};
use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const MP4: &[u8] = b"\x00\x00\x00\x18ftypmp42\x00\x00\x00\x00mp42isom-video-bytes";
const JPEG_SOURCE: &[u8] = b"\xff\xd8\xff\xe0\x00\x10JFIF\x00source";

/// Counts every call that reaches the lock store.
#[derive(Default)]
struct CountingLockStore {
    inner: MemoryLockStore,
    calls: AtomicUsize,
}

impl CountingLockStore {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LockStore for CountingLockStore {
    async fn set_if_absent(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, LockStoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.set_if_absent(key, token, ttl).await
    }

    async fn delete_if_matches(&self, key: &str, token: &str) -> Result<bool, LockStoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.delete_if_matches(key, token).await
    }

    async fn delete(&self, key: &str) -> Result<(), LockStoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.delete(key).await
    }
}

struct Harness {
    media: TempDir,
    store: TempDir,
    locks: Arc<CountingLockStore>,
    orchestrator: Orchestrator,
}

fn sources(media_root: &std::path::Path) -> SourceLoader {
    SourceLoader::new(media_root, reqwest::Client::new(), Duration::from_secs(5))
}

fn harness(server: &MockServer) -> Harness {
    let media = TempDir::new().unwrap();
    let store = TempDir::new().unwrap();
    std::fs::write(media.path().join("a.jpg"), JPEG_SOURCE).unwrap();

    let http = no_redirect_client().unwrap();
    let provider = Arc::new(GeminiProvider::new(
        http.clone(),
        server.uri(),
        "test-key",
        "veo-test",
        "image-test",
        Duration::from_secs(5),
    ));
    let fetcher = ResultFetcher::new(http, &server.uri(), Some("test-key".into()));
    let pipeline = GenerationPipeline::new(
        JobSubmitter::new(provider.clone(), sources(media.path())),
        Poller::new(provider, fetcher),
        Duration::from_millis(20),
        Duration::from_secs(10),
        Duration::from_secs(30),
    );

    let locks = Arc::new(CountingLockStore::default());
    let orchestrator = Orchestrator::new(
        Arc::new(FsArtifactStore::new(store.path())),
        DedupLock::new(locks.clone(), Duration::from_millis(10)),
    )
    .with_generation(Arc::new(pipeline))
    .with_transform(Arc::new(TransformPipeline::new(
        sources(media.path()),
        Arc::new(ImageResizer::new()),
        Duration::from_secs(30),
    )));

    Harness {
        media,
        store,
        locks,
        orchestrator,
    }
}

async fn mount_video_job(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/models/veo-test:predictLongRunning"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"name": "operations/op1"})))
        .expect(1)
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/operations/op1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"name": "operations/op1"})))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/operations/op1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "operations/op1",
            "done": true,
            "response": {"generateVideoResponse": {"generatedSamples": [
                {"video": {"uri": format!("{}/files/v:download", server.uri())}}
            ]}}
        })))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/files/v:download"))
        .respond_with(ResponseTemplate::new(302).insert_header("location", "/blob/v.mp4"))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/blob/v.mp4"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(MP4))
        .mount(server)
        .await;
}

fn summer_video() -> GenerationRequest {
    GenerationRequest::video("a.jpg", "make it summer")
        .with_shape(shape::ASPECT_RATIO, "16:9")
        .authorized(true)
}

#[tokio::test]
async fn video_is_generated_once_then_served_from_cache() {
    let server = MockServer::start().await;
    mount_video_job(&server).await;
    let h = harness(&server);
    let cancel = CancellationToken::new();

    let first = h.orchestrator.handle(&summer_video(), &cancel).await.unwrap();
    assert!(!first.cached);
    assert_eq!(first.artifact.mime_type, mime::VIDEO_MP4);
    assert_eq!(first.artifact.bytes.as_ref(), MP4);
    let stored = h.store.path().join(format!("{}.mp4", first.key));
    assert_eq!(std::fs::read(&stored).unwrap(), MP4);

    let provider_requests = server.received_requests().await.unwrap().len();
    let lock_calls = h.locks.calls();
    assert!(provider_requests >= 5, "submit, two polls, two download hops");
    assert!(lock_calls >= 2, "acquire and release");

    let second = h.orchestrator.handle(&summer_video(), &cancel).await.unwrap();
    assert!(second.cached);
    assert_eq!(second.key, first.key);
    assert_eq!(second.artifact.bytes, first.artifact.bytes);
    assert_eq!(server.received_requests().await.unwrap().len(), provider_requests);
    assert_eq!(h.locks.calls(), lock_calls);
}

#[tokio::test]
async fn resize_variants_are_keyed_by_shape() {
    let server = MockServer::start().await;
    let h = harness(&server);
    let cancel = CancellationToken::new();

    let png = {
        let img = image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
            64,
            32,
            image::Rgb([0, 120, 200]),
        ));
        let mut out = Vec::new();
        img.write_to(&mut Cursor::new(&mut out), image::ImageFormat::Png)
            .unwrap();
        out
    };
    std::fs::write(h.media.path().join("b.png"), &png).unwrap();

    let small = GenerationRequest::resize("b.png")
        .with_shape(shape::WIDTH, 32)
        .authorized(true);
    let smaller = GenerationRequest::resize("b.png")
        .with_shape(shape::WIDTH, 16)
        .authorized(true);

    let a = h.orchestrator.handle(&small, &cancel).await.unwrap();
    let b = h.orchestrator.handle(&smaller, &cancel).await.unwrap();
    assert_ne!(a.key, b.key);
    assert!(!a.cached && !b.cached);
    assert_eq!(a.artifact.mime_type, mime::IMAGE_PNG);

    let again = h.orchestrator.handle(&small, &cancel).await.unwrap();
    assert!(again.cached);
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn unauthorized_request_touches_nothing() {
    let server = MockServer::start().await;
    let h = harness(&server);

    let err = h
        .orchestrator
        .handle(&summer_video().authorized(false), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(server.received_requests().await.unwrap().is_empty());
    assert_eq!(h.locks.calls(), 0);
}

#[tokio::test]
async fn fail_closed_refuses_while_another_process_holds_the_lock() {
    let media = TempDir::new().unwrap();
    let store = TempDir::new().unwrap();
    let png = {
        let img = image::DynamicImage::ImageRgb8(image::RgbImage::new(8, 8));
        let mut out = Vec::new();
        img.write_to(&mut Cursor::new(&mut out), image::ImageFormat::Png)
            .unwrap();
        out
    };
    std::fs::write(media.path().join("c.png"), &png).unwrap();

    let lock_dir = store.path().join(".locks");
    let request = GenerationRequest::resize("c.png")
        .with_shape(shape::HEIGHT, 4)
        .authorized(true);

    // A second process sharing the lock directory holds the key.
    let other = DedupLock::new(
        Arc::new(FileLockStore::new(&lock_dir)),
        Duration::from_millis(5),
    );
    let key = genmedia_core::key::derive(&request);
    let held = match other
        .acquire(&key, 0, Duration::from_secs(60), &CancellationToken::new())
        .await
    {
        AcquireOutcome::Acquired(lease) => lease,
        other => panic!("expected to acquire, got {other:?}"),
    };

    let orchestrator = Orchestrator::new(
        Arc::new(FsArtifactStore::new(store.path())),
        DedupLock::new(Arc::new(FileLockStore::new(&lock_dir)), Duration::from_millis(5)),
    )
    .with_lock_policy(LockPolicy::FailClosed, 1)
    .with_transform(Arc::new(TransformPipeline::new(
        sources(media.path()),
        Arc::new(ImageResizer::new()),
        Duration::from_secs(30),
    )));

    let err = orchestrator
        .handle(&request, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LockUnavailable);

    assert!(other.release(held).await);
    let delivered = orchestrator
        .handle(&request, &CancellationToken::new())
        .await
        .unwrap();
    assert!(!delivered.cached);
}
