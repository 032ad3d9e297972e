//! End-to-end engine scenarios against a local mock server.
//!
//! Each test owns a temp download root and a history file inside it. The
//! engine closes its history store on shutdown, so assertions reopen the file.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use mediafetch_core::{
    DomainKey, DownloadEngine, DownloadStats, EngineConfig, EngineError, FileLockRegistry,
    HistoryError, HistoryRepository, HistoryStore, MediaItem, MediaKind, ProgressObserver,
    RetryPolicy,
};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use url::Url;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, Request, Respond, ResponseTemplate};

mod support;
use support::socket_guard::{loopback_available, socket_skip_return, start_mock_server_or_skip};

macro_rules! require_mock_server {
    () => {
        match start_mock_server_or_skip().await {
            Some(server) => server,
            None => return socket_skip_return(),
        }
    };
}

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn test_config(root: &Path) -> EngineConfig {
    EngineConfig {
        download_root: root.to_path_buf(),
        download_delay_s: 0.0,
        required_free_space_gb: 0,
        rate_limit_per_s: 1_000,
        ..EngineConfig::default()
    }
}

fn history_path(root: &Path) -> PathBuf {
    root.join("history.sqlite")
}

async fn open_history(root: &Path) -> Result<HistoryStore, HistoryError> {
    HistoryStore::open_without_preallocation(&history_path(root)).await
}

async fn start_engine(
    config: EngineConfig,
    stats: &Arc<DownloadStats>,
) -> Result<DownloadEngine, Box<dyn std::error::Error>> {
    let history = open_history(&config.download_root).await?;
    let engine = DownloadEngine::builder(config)
        .history(Arc::new(history))
        .observer(Arc::clone(stats) as Arc<dyn ProgressObserver>)
        .retry_policy(RetryPolicy::immediate(10))
        .build()
        .await?;
    Ok(engine)
}

fn item(server_uri: &str, url_path: &str, folder: &Path) -> MediaItem {
    let url = Url::parse(&format!("{server_uri}{url_path}")).unwrap();
    MediaItem::new(url, folder).unwrap()
}

fn body(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add((i % 251) as u8)).collect()
}

async fn run_to_completion(engine: DownloadEngine, items: Vec<MediaItem>) -> TestResult {
    for item in items {
        engine.submit(item).await?;
    }
    tokio::time::timeout(Duration::from_secs(20), engine.wait_all()).await??;
    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_fresh_download_writes_file_and_completes_history() -> TestResult {
    let mock_server = require_mock_server!();
    let payload = body(4_096, 7);
    Mock::given(method("GET"))
        .and(path("/f/pic.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(payload.clone()))
        .expect(1)
        .mount(&mock_server)
        .await;

    let dir = TempDir::new()?;
    let folder = dir.path().join("album");
    let stats = Arc::new(DownloadStats::new());
    let engine = start_engine(test_config(dir.path()), &stats).await?;
    let pic = item(&mock_server.uri(), "/f/pic.jpg", &folder).with_expected_datetime(1_600_000_000);
    let domain = pic.domain().clone();

    run_to_completion(engine, vec![pic]).await?;

    let written = std::fs::read(folder.join("pic.jpg"))?;
    assert_eq!(written, payload);
    assert!(!folder.join("pic.jpg.part").exists());
    let modified = std::fs::metadata(folder.join("pic.jpg"))?.modified()?;
    assert_eq!(
        modified.duration_since(std::time::UNIX_EPOCH)?.as_secs(),
        1_600_000_000
    );
    assert_eq!(stats.completed(), 1);
    assert_eq!(stats.bytes(), 4_096);

    let history = open_history(dir.path()).await?;
    let record = history
        .get_record(&domain, "/f/pic.jpg", "pic.jpg")
        .await?
        .ok_or("missing history row")?;
    assert!(record.is_completed());
    assert_eq!(record.download_filename.as_deref(), Some("pic.jpg"));
    history.close().await;
    Ok(())
}

#[tokio::test]
async fn test_partial_file_resumes_from_offset() -> TestResult {
    let mock_server = require_mock_server!();
    let full = body(40_000, 3);
    Mock::given(method("GET"))
        .and(path("/f/clip.mp4"))
        .and(header("range", "bytes=0-0"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("Content-Range", "bytes 0-0/40000")
                .set_body_bytes(full[..1].to_vec()),
        )
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/f/clip.mp4"))
        .and(header("range", "bytes=12345-"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("Content-Range", "bytes 12345-39999/40000")
                .set_body_bytes(full[12_345..].to_vec()),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let dir = TempDir::new()?;
    let folder = dir.path().join("album");
    std::fs::create_dir_all(&folder)?;
    std::fs::write(folder.join("clip.mp4.part"), &full[..12_345])?;

    let clip = item(&mock_server.uri(), "/f/clip.mp4", &folder);
    let seed = open_history(dir.path()).await?;
    seed.insert_incomplete(clip.domain(), &clip).await?;
    seed.close().await;

    let stats = Arc::new(DownloadStats::new());
    let engine = start_engine(test_config(dir.path()), &stats).await?;
    run_to_completion(engine, vec![clip]).await?;

    let written = std::fs::read(folder.join("clip.mp4"))?;
    assert_eq!(written.len(), 40_000);
    assert_eq!(written, full);
    assert!(!folder.join("clip.mp4.part").exists());
    assert_eq!(stats.completed(), 1);
    assert_eq!(stats.bytes(), 27_655);
    Ok(())
}

#[tokio::test]
async fn test_same_name_from_two_urls_gets_collision_suffix() -> TestResult {
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .and(path("/a/pic.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body(100, 1)))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/b/pic.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body(200, 2)))
        .mount(&mock_server)
        .await;

    let dir = TempDir::new()?;
    let folder = dir.path().join("album");
    let stats = Arc::new(DownloadStats::new());
    let engine = start_engine(test_config(dir.path()), &stats).await?;
    let first = item(&mock_server.uri(), "/a/pic.jpg", &folder);
    let second = item(&mock_server.uri(), "/b/pic.jpg", &folder);
    let domain = first.domain().clone();

    run_to_completion(engine, vec![first, second]).await?;

    let plain = std::fs::metadata(folder.join("pic.jpg"))?.len();
    let suffixed = std::fs::metadata(folder.join("pic (1).jpg"))?.len();
    let sizes: BTreeSet<u64> = [plain, suffixed].into_iter().collect();
    assert_eq!(sizes, BTreeSet::from([100, 200]));
    assert_eq!(stats.completed(), 2);

    let history = open_history(dir.path()).await?;
    let a = history.get_record(&domain, "/a/pic.jpg", "pic.jpg").await?.ok_or("row a")?;
    let b = history.get_record(&domain, "/b/pic.jpg", "pic.jpg").await?.ok_or("row b")?;
    assert_ne!(a.download_filename, b.download_filename);
    assert!(a.is_completed() && b.is_completed());
    history.close().await;
    Ok(())
}

struct RateLimitedThenOk {
    hits: Arc<AtomicUsize>,
    limited: usize,
    payload: Vec<u8>,
}

impl Respond for RateLimitedThenOk {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        if self.hits.fetch_add(1, Ordering::SeqCst) < self.limited {
            ResponseTemplate::new(429)
        } else {
            ResponseTemplate::new(200).set_body_bytes(self.payload.clone())
        }
    }
}

#[tokio::test]
async fn test_rate_limited_responses_are_retried_until_success() -> TestResult {
    let mock_server = require_mock_server!();
    let hits = Arc::new(AtomicUsize::new(0));
    Mock::given(method("GET"))
        .and(path("/f/busy.png"))
        .respond_with(RateLimitedThenOk {
            hits: Arc::clone(&hits),
            limited: 3,
            payload: body(512, 9),
        })
        .mount(&mock_server)
        .await;

    let dir = TempDir::new()?;
    let folder = dir.path().join("album");
    let stats = Arc::new(DownloadStats::new());
    let engine = start_engine(test_config(dir.path()), &stats).await?;
    engine.submit(item(&mock_server.uri(), "/f/busy.png", &folder)).await?;
    tokio::time::timeout(Duration::from_secs(20), engine.wait_all()).await??;

    assert_eq!(engine.attempts("/f/busy.png"), 4);
    assert_eq!(hits.load(Ordering::SeqCst), 4);
    assert_eq!(stats.retried(), 3);
    assert_eq!(stats.completed(), 1);
    engine.shutdown().await;

    assert_eq!(std::fs::metadata(folder.join("busy.png"))?.len(), 512);
    Ok(())
}

#[tokio::test]
async fn test_not_found_fails_once_and_is_logged() -> TestResult {
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .and(path("/f/gone.jpg"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&mock_server)
        .await;

    let dir = TempDir::new()?;
    let folder = dir.path().join("album");
    let stats = Arc::new(DownloadStats::new());
    let engine = start_engine(test_config(dir.path()), &stats).await?;
    let gone = item(&mock_server.uri(), "/f/gone.jpg", &folder);
    let domain = gone.domain().clone();
    engine.submit(gone).await?;
    tokio::time::timeout(Duration::from_secs(20), engine.wait_all()).await??;

    assert_eq!(engine.attempts("/f/gone.jpg"), 1);
    assert_eq!(stats.failed(), 1);
    assert_eq!(stats.retried(), 0);
    engine.shutdown().await;

    assert!(!folder.join("gone.jpg").exists());
    assert!(!folder.join("gone.jpg.part").exists());

    let log = std::fs::read_to_string(dir.path().join("download_errors.csv"))?;
    let lines: Vec<&str> = log.lines().collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0], "url,referer,message");
    assert!(lines[1].contains("/f/gone.jpg"));
    assert!(lines[1].contains("404"));

    let history = open_history(dir.path()).await?;
    let record = history
        .get_record(&domain, "/f/gone.jpg", "gone.jpg")
        .await?
        .ok_or("missing history row")?;
    assert!(!record.is_completed());
    let failed = history.get_failed_items().await?;
    assert_eq!(failed.len(), 1);
    history.close().await;
    Ok(())
}

/// Serves the headers and the first `sent` bytes of a larger body, then stalls.
async fn spawn_stalling_server(sent: usize, declared: usize) -> std::io::Result<String> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let address = listener.local_addr()?;
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut request = [0_u8; 4096];
                let _ = socket.read(&mut request).await;
                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: {declared}\r\n\r\n"
                );
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(&vec![0x5a; sent]).await;
                let _ = socket.flush().await;
                tokio::time::sleep(Duration::from_secs(60)).await;
            });
        }
    });
    Ok(format!("http://{address}"))
}

#[tokio::test]
async fn test_cancellation_keeps_partial_and_releases_lock() -> TestResult {
    if !loopback_available() {
        return socket_skip_return();
    }
    let uri = spawn_stalling_server(1_000, 100_000).await?;

    let dir = TempDir::new()?;
    let folder = dir.path().join("album");
    let stats = Arc::new(DownloadStats::new());
    let locks = FileLockRegistry::new();
    let history = open_history(dir.path()).await?;
    let engine = DownloadEngine::builder(test_config(dir.path()))
        .history(Arc::new(history))
        .observer(Arc::clone(&stats) as Arc<dyn ProgressObserver>)
        .retry_policy(RetryPolicy::immediate(10))
        .file_locks(locks.clone())
        .build()
        .await?;

    let slow = item(&uri, "/f/slow.mp4", &folder);
    let domain = slow.domain().clone();
    engine.submit(slow).await?;

    let part = folder.join("slow.mp4.part");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while std::fs::metadata(&part).map(|m| m.len()).unwrap_or(0) < 1_000 {
        assert!(tokio::time::Instant::now() < deadline, "partial never reached 1000 bytes");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(locks.is_held("slow.mp4"));

    engine.cancel();
    engine.wait_all().await?;
    engine.shutdown().await;

    assert_eq!(std::fs::metadata(&part)?.len(), 1_000);
    assert!(!folder.join("slow.mp4").exists());
    assert_eq!(locks.held_count(), 0);
    assert_eq!(stats.completed(), 0);

    let history = open_history(dir.path()).await?;
    let record = history
        .get_record(&domain, "/f/slow.mp4", "slow.mp4")
        .await?
        .ok_or("missing history row")?;
    assert!(!record.is_completed());
    history.close().await;
    Ok(())
}

#[tokio::test]
async fn test_completed_item_is_not_fetched_again() -> TestResult {
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .and(path("/f/once.webp"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body(64, 5)))
        .expect(1)
        .mount(&mock_server)
        .await;

    let dir = TempDir::new()?;
    let folder = dir.path().join("album");

    let first_stats = Arc::new(DownloadStats::new());
    let engine = start_engine(test_config(dir.path()), &first_stats).await?;
    run_to_completion(engine, vec![item(&mock_server.uri(), "/f/once.webp", &folder)]).await?;
    assert_eq!(first_stats.completed(), 1);

    let second_stats = Arc::new(DownloadStats::new());
    let engine = start_engine(test_config(dir.path()), &second_stats).await?;
    let again = item(&mock_server.uri(), "/f/once.webp", &folder).with_album_id("alb-42");
    let domain = again.domain().clone();
    run_to_completion(engine, vec![again]).await?;

    assert_eq!(second_stats.previously_downloaded(), 1);
    assert_eq!(second_stats.completed(), 0);

    let history = open_history(dir.path()).await?;
    let record = history
        .get_record(&domain, "/f/once.webp", "once.webp")
        .await?
        .ok_or("missing history row")?;
    assert_eq!(record.album_id.as_deref(), Some("alb-42"));
    history.close().await;
    Ok(())
}

#[tokio::test]
async fn test_excluded_kind_is_skipped_without_request() -> TestResult {
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body(10, 0)))
        .expect(0)
        .mount(&mock_server)
        .await;

    let dir = TempDir::new()?;
    let folder = dir.path().join("album");
    let mut config = test_config(dir.path());
    config.excluded_types = BTreeSet::from([MediaKind::Videos]);
    let stats = Arc::new(DownloadStats::new());
    let engine = start_engine(config, &stats).await?;
    let clip = item(&mock_server.uri(), "/f/clip.mkv", &folder);
    let domain = clip.domain().clone();

    run_to_completion(engine, vec![clip]).await?;

    assert_eq!(stats.skipped(), 1);
    let history = open_history(dir.path()).await?;
    assert!(history.get_record(&domain, "/f/clip.mkv", "clip.mkv").await?.is_none());
    history.close().await;
    Ok(())
}

#[tokio::test]
async fn test_mark_completed_mode_records_without_downloading() -> TestResult {
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body(10, 0)))
        .expect(0)
        .mount(&mock_server)
        .await;

    let dir = TempDir::new()?;
    let folder = dir.path().join("album");
    let mut config = test_config(dir.path());
    config.skip_download_mark_completed = true;
    let stats = Arc::new(DownloadStats::new());
    let engine = start_engine(config, &stats).await?;
    let pic = item(&mock_server.uri(), "/f/marked.jpg", &folder);
    let domain = pic.domain().clone();

    run_to_completion(engine, vec![pic]).await?;

    assert_eq!(stats.skipped(), 1);
    assert!(!folder.join("marked.jpg").exists());
    let history = open_history(dir.path()).await?;
    let record = history
        .get_record(&domain, "/f/marked.jpg", "marked.jpg")
        .await?
        .ok_or("missing history row")?;
    assert!(record.is_completed());
    history.close().await;
    Ok(())
}

#[tokio::test]
async fn test_missing_extension_fails_after_recording_attempt() -> TestResult {
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body(10, 0)))
        .expect(0)
        .mount(&mock_server)
        .await;

    let dir = TempDir::new()?;
    let folder = dir.path().join("album");
    let stats = Arc::new(DownloadStats::new());
    let engine = start_engine(test_config(dir.path()), &stats).await?;
    let bare = item(&mock_server.uri(), "/f/noext", &folder);
    let domain = bare.domain().clone();

    run_to_completion(engine, vec![bare]).await?;

    assert_eq!(stats.failed(), 1);
    let history = open_history(dir.path()).await?;
    let record = history
        .get_record(&domain, "/f/noext", "noext")
        .await?
        .ok_or("missing history row")?;
    assert!(!record.is_completed());
    history.close().await;
    Ok(())
}

/// Tracks how many tasks are between their first byte and completion.
#[derive(Default)]
struct ConcurrencyProbe {
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ProgressObserver for ConcurrencyProbe {
    fn task_added(&self, _item: &MediaItem, _expected_bytes: Option<u64>) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn task_completed(&self, _item: &MediaItem) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_per_host_worker_cap_is_respected() -> TestResult {
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(body(256, 4))
                .set_delay(Duration::from_millis(150)),
        )
        .expect(6)
        .mount(&mock_server)
        .await;

    let dir = TempDir::new()?;
    let folder = dir.path().join("album");
    let mut config = test_config(dir.path());
    config.max_workers_per_host = 2;
    let probe = Arc::new(ConcurrencyProbe::default());
    let history = open_history(dir.path()).await?;
    let engine = DownloadEngine::builder(config)
        .history(Arc::new(history))
        .observer(Arc::clone(&probe) as Arc<dyn ProgressObserver>)
        .build()
        .await?;

    let items = (0..6)
        .map(|i| item(&mock_server.uri(), &format!("/f/{i}.gif"), &folder))
        .collect();
    run_to_completion(engine, items).await?;

    let peak = probe.peak.load(Ordering::SeqCst);
    assert!((1..=2).contains(&peak), "peak concurrency was {peak}");
    for i in 0..6 {
        assert!(folder.join(format!("{i}.gif")).exists());
    }
    Ok(())
}

/// Delegates to a real store but fails every insert.
struct BrokenInserts(HistoryStore);

#[async_trait]
impl HistoryRepository for BrokenInserts {
    async fn check_complete(&self, domain: &DomainKey, url: &Url, referer: &Url) -> Result<bool, HistoryError> {
        self.0.check_complete(domain, url, referer).await
    }

    async fn insert_incomplete(&self, _domain: &DomainKey, _item: &MediaItem) -> Result<(), HistoryError> {
        Err(HistoryError::Open("disk I/O error".to_string()))
    }

    async fn mark_complete(&self, domain: &DomainKey, item: &MediaItem) -> Result<(), HistoryError> {
        self.0.mark_complete(domain, item).await
    }

    async fn get_downloaded_filename(
        &self,
        domain: &DomainKey,
        item: &MediaItem,
    ) -> Result<Option<String>, HistoryError> {
        self.0.get_downloaded_filename(domain, item).await
    }

    async fn check_filename_exists(&self, filename: &str) -> Result<bool, HistoryError> {
        self.0.check_filename_exists(filename).await
    }

    async fn set_album_id(&self, domain: &DomainKey, item: &MediaItem) -> Result<(), HistoryError> {
        self.0.set_album_id(domain, item).await
    }

    async fn close(&self) {
        self.0.close().await;
    }
}

#[tokio::test]
async fn test_history_failure_stops_engine() -> TestResult {
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body(10, 0)))
        .expect(0)
        .mount(&mock_server)
        .await;

    let dir = TempDir::new()?;
    let folder = dir.path().join("album");
    let store = HistoryStore::in_memory().await?;
    let engine = DownloadEngine::builder(test_config(dir.path()))
        .history(Arc::new(BrokenInserts(store)))
        .build()
        .await?;

    engine.submit(item(&mock_server.uri(), "/f/doomed.jpg", &folder)).await?;
    let result = tokio::time::timeout(Duration::from_secs(20), engine.wait_all()).await?;
    assert!(matches!(result, Err(EngineError::Fatal(HistoryError::Open(_)))));
    assert!(engine.cancellation_token().is_cancelled());
    engine.shutdown().await;
    Ok(())
}

async fn mount_size_probe(mock_server: &wiremock::MockServer, url_path: &str, total: usize) {
    Mock::given(method("GET"))
        .and(path(url_path))
        .and(header("range", "bytes=0-0"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("Content-Range", format!("bytes 0-0/{total}").as_str())
                .set_body_bytes(vec![0_u8]),
        )
        .mount(mock_server)
        .await;
}

#[tokio::test]
async fn test_complete_file_on_disk_is_recorded_without_streaming() -> TestResult {
    let mock_server = require_mock_server!();
    mount_size_probe(&mock_server, "/f/have.png", 500).await;

    let dir = TempDir::new()?;
    let folder = dir.path().join("album");
    std::fs::create_dir_all(&folder)?;
    let existing = body(500, 9);
    std::fs::write(folder.join("have.png"), &existing)?;

    let stats = Arc::new(DownloadStats::new());
    let engine = start_engine(test_config(dir.path()), &stats).await?;
    let have = item(&mock_server.uri(), "/f/have.png", &folder);
    let domain = have.domain().clone();
    run_to_completion(engine, vec![have]).await?;

    assert_eq!(stats.skipped(), 1);
    assert_eq!(stats.bytes(), 0);
    assert_eq!(std::fs::read(folder.join("have.png"))?, existing);
    assert!(!folder.join("have (1).png").exists());

    let history = open_history(dir.path()).await?;
    let record = history
        .get_record(&domain, "/f/have.png", "have.png")
        .await?
        .ok_or("missing history row")?;
    assert!(record.is_completed());
    history.close().await;
    Ok(())
}

#[tokio::test]
async fn test_full_size_partial_with_recorded_name_is_promoted() -> TestResult {
    let mock_server = require_mock_server!();
    mount_size_probe(&mock_server, "/f/done.gif", 300).await;

    let dir = TempDir::new()?;
    let folder = dir.path().join("album");
    std::fs::create_dir_all(&folder)?;
    let payload = body(300, 4);
    std::fs::write(folder.join("done.gif.part"), &payload)?;

    let done = item(&mock_server.uri(), "/f/done.gif", &folder);
    let domain = done.domain().clone();
    let seed = open_history(dir.path()).await?;
    seed.insert_incomplete(&domain, &done).await?;
    seed.close().await;

    let stats = Arc::new(DownloadStats::new());
    let engine = start_engine(test_config(dir.path()), &stats).await?;
    run_to_completion(engine, vec![done]).await?;

    assert_eq!(std::fs::read(folder.join("done.gif"))?, payload);
    assert!(!folder.join("done.gif.part").exists());
    assert_eq!(stats.bytes(), 0);

    let history = open_history(dir.path()).await?;
    let record = history
        .get_record(&domain, "/f/done.gif", "done.gif")
        .await?
        .ok_or("missing history row")?;
    assert!(record.is_completed());
    history.close().await;
    Ok(())
}

#[tokio::test]
async fn test_recorded_filename_is_reused_for_resume() -> TestResult {
    let mock_server = require_mock_server!();
    let full = body(300, 6);
    mount_size_probe(&mock_server, "/b/pic.jpg", 300).await;
    Mock::given(method("GET"))
        .and(path("/b/pic.jpg"))
        .and(header("range", "bytes=100-"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("Content-Range", "bytes 100-299/300")
                .set_body_bytes(full[100..].to_vec()),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let dir = TempDir::new()?;
    let folder = dir.path().join("album");
    std::fs::create_dir_all(&folder)?;
    let other = body(50, 1);
    std::fs::write(folder.join("pic.jpg"), &other)?;
    std::fs::write(folder.join("pic (1).jpg.part"), &full[..100])?;

    let pic = item(&mock_server.uri(), "/b/pic.jpg", &folder);
    let domain = pic.domain().clone();
    let seed = open_history(dir.path()).await?;
    seed.insert_incomplete(&domain, &pic).await?;
    sqlx::query("UPDATE media SET download_filename = 'pic (1).jpg' WHERE url_path = '/b/pic.jpg'")
        .execute(seed.database().pool())
        .await?;
    seed.close().await;

    let stats = Arc::new(DownloadStats::new());
    let engine = start_engine(test_config(dir.path()), &stats).await?;
    run_to_completion(engine, vec![pic]).await?;

    assert_eq!(std::fs::read(folder.join("pic (1).jpg"))?, full);
    assert_eq!(std::fs::read(folder.join("pic.jpg"))?, other);
    assert!(!folder.join("pic (2).jpg").exists());
    assert_eq!(stats.completed(), 1);
    assert_eq!(stats.bytes(), 200);

    let history = open_history(dir.path()).await?;
    let record = history
        .get_record(&domain, "/b/pic.jpg", "pic.jpg")
        .await?
        .ok_or("missing history row")?;
    assert!(record.is_completed());
    assert_eq!(record.download_filename.as_deref(), Some("pic (1).jpg"));
    history.close().await;
    Ok(())
}

#[tokio::test]
async fn test_filename_resolution_is_stable_for_same_disk_state() -> TestResult {
    let mock_server = require_mock_server!();
    mount_size_probe(&mock_server, "/c/pic.jpg", 500).await;

    let dir = TempDir::new()?;
    let folder = dir.path().join("album");
    std::fs::create_dir_all(&folder)?;
    std::fs::write(folder.join("pic.jpg"), body(10, 2))?;

    let mut chosen = Vec::new();
    for run in 0..2 {
        let mut config = test_config(dir.path());
        config.skip_download_mark_completed = true;
        let history_file = dir.path().join(format!("history-{run}.sqlite"));
        let history = HistoryStore::open_without_preallocation(&history_file).await?;
        let engine = DownloadEngine::builder(config)
            .history(Arc::new(history))
            .retry_policy(RetryPolicy::immediate(3))
            .build()
            .await?;
        let pic = item(&mock_server.uri(), "/c/pic.jpg", &folder);
        let domain = pic.domain().clone();
        run_to_completion(engine, vec![pic]).await?;

        let history = HistoryStore::open_without_preallocation(&history_file).await?;
        let record = history
            .get_record(&domain, "/c/pic.jpg", "pic.jpg")
            .await?
            .ok_or("missing history row")?;
        chosen.push(record.download_filename);
        history.close().await;
    }

    assert_eq!(chosen[0].as_deref(), Some("pic (1).jpg"));
    assert_eq!(chosen[0], chosen[1]);
    Ok(())
}

#[tokio::test]
async fn test_submitted_items_get_name_length_limits() -> TestResult {
    let mock_server = require_mock_server!();
    let long_name = format!("{}.jpg", "a".repeat(60));
    Mock::given(method("GET"))
        .and(path(format!("/f/{long_name}").as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body(32, 8)))
        .expect(1)
        .mount(&mock_server)
        .await;

    let dir = TempDir::new()?;
    let folder = dir.path().join("a_folder_name_that_is_long");
    let mut config = test_config(dir.path());
    config.max_filename_length = 20;
    config.max_folder_name_length = 10;
    let stats = Arc::new(DownloadStats::new());
    let engine = start_engine(config, &stats).await?;
    run_to_completion(engine, vec![item(&mock_server.uri(), &format!("/f/{long_name}"), &folder)])
        .await?;

    let expected = dir.path().join("a_folder_n").join(format!("{}.jpg", "a".repeat(16)));
    assert_eq!(std::fs::metadata(&expected)?.len(), 32);
    assert!(!folder.exists());
    assert_eq!(stats.completed(), 1);
    Ok(())
}
