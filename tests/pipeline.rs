//! End-to-end run of one capture through every stage, using the library API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;

use capture_harness::analysis::{AnalysisReport, Analyzer};
use capture_harness::blob_store::{BlobStore, SqliteBlobStore};
use capture_harness::capture::{CaptureRequest, CaptureService, SessionManager};
use capture_harness::config::Config;
use capture_harness::db;
use capture_harness::events::{EventPublisher, FallbackConsumer, Transport};
use capture_harness::ingestor::{Ingestor, Outcome};
use capture_harness::sqlite_store::{SqliteEventStore, SqliteProjectStore};
use capture_harness::uploader::Uploader;
use capture_harness_core::models::DeliveryMethod;
use capture_harness_core::store::{EventStore, ProjectStore};

struct CannedAnalyzer {
    calls: AtomicUsize,
}

#[async_trait]
impl Analyzer for CannedAnalyzer {
    async fn analyze(&self, payload: &str) -> Option<AnalysisReport> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert!(payload.contains("\"structure\""));
        Some(AnalysisReport {
            text: "Website Analysis: https://shop.example.com/\nA product grid.".to_string(),
            summarized: false,
            segments_total: 1,
            segments_succeeded: 1,
        })
    }
}

fn capture_request() -> CaptureRequest {
    CaptureRequest {
        image: Some("data:image/jpeg;base64,/9j/4AAQ".to_string()),
        area: Some(json!({"x": 10, "y": 20, "width": 300, "height": 200})),
        html: Some(
            r#"<html><head><script>track()</script></head><body>
               <div id="grid" class="products"><a href="/p/1">Blue mug</a></div>
               </body></html>"#
                .to_string(),
        ),
        url: Some("https://shop.example.com/".to_string()),
        title: Some("Shop".to_string()),
        timestamp: Some(json!(1700000000000_i64)),
    }
}

#[tokio::test]
async fn test_capture_to_storage() {
    let tmp = TempDir::new().unwrap();
    let config = Config::rooted_at(tmp.path());
    let pool = db::connect_migrated(&config).await.unwrap();

    // Capture
    let capture = CaptureService::new(&config, SessionManager::spawn(config.paths.capture_dir.clone()));
    let session = capture.sessions().start().await.unwrap();
    let (ack, artifact) = capture.accept(capture_request()).await.unwrap();
    assert_eq!(ack.session_id, session);
    assert_eq!(ack.timestamp, "1700000000000");
    let stored = capture.store(Arc::new(artifact)).await.unwrap();
    let processed = stored.processed.expect("html was submitted");

    let doc: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&processed).unwrap()).unwrap();
    assert_eq!(doc["metadata"]["url"], "https://shop.example.com/");
    assert!(!doc.to_string().contains("track()"));

    // Ingest
    let events: Arc<dyn EventStore> = Arc::new(SqliteEventStore::new(pool.clone()));
    let analyzer = Arc::new(CannedAnalyzer {
        calls: AtomicUsize::new(0),
    });
    let ingestor = Ingestor::new(
        &config,
        Some(analyzer.clone()),
        Some(Arc::new(EventPublisher::new(Transport::Direct, events.clone()))),
    );
    assert_eq!(
        ingestor.handle(&processed).await.unwrap(),
        Outcome::Processed { analyzed: true }
    );
    assert_eq!(ingestor.handle(&processed).await.unwrap(), Outcome::AlreadyReported);
    assert_eq!(analyzer.calls.load(Ordering::SeqCst), 1);

    let name = format!("{}_1700000000000", session);
    let out_dir = config.paths.prompt_store.join(&name);
    assert!(out_dir.join("analysis.txt").exists());
    assert!(out_dir.join("screenshot.jpg").exists());
    assert!(!config.paths.lock_dir().join(format!("{}.lock", name)).exists());

    // Upload
    let blobs = Arc::new(SqliteBlobStore::new(pool.clone()));
    let projects = Arc::new(SqliteProjectStore::new(pool.clone()));
    let uploader = Uploader::new(&config, blobs.clone(), Some(projects.clone())).unwrap();
    let stats = uploader.run_batch().await.unwrap();
    assert_eq!(stats.uploaded, 3);
    assert_eq!(stats.failed, 0);

    assert!(!out_dir.join("analysis.txt").exists());
    assert!(config.paths.done_dir().join(&name).join("analysis.txt").exists());

    let project = projects.find_project(&name).await.unwrap().unwrap();
    assert_eq!(project.user_id, "system");
    assert_eq!(project.files.len(), 3);
    assert_eq!(
        project.image_url.as_deref(),
        Some(format!("/api/files/{}/screenshot.jpg", name).as_str())
    );
    assert!(project.prompt.as_deref().unwrap().contains("product grid"));
    assert_eq!(
        project.structured_data.as_ref().unwrap()["metadata"]["title"],
        "Shop"
    );

    let blob = blobs.find_latest(&name, "screenshot.jpg").await.unwrap().unwrap();
    let (_, bytes) = blobs.get(&blob.id).await.unwrap().unwrap();
    assert_eq!(bytes, vec![0xff, 0xd8, 0xff, 0xe0, 0x00, 0x10]);

    // Second batch has nothing left to do
    let again = uploader.run_batch().await.unwrap();
    assert_eq!(again.uploaded, 0);

    // Events
    let mut consumer = FallbackConsumer::new(events, 10);
    let delivered = consumer.poll_once().await.unwrap();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].delivery_method, DeliveryMethod::Direct);
    assert_eq!(
        delivered[0].payload.image_url.as_deref(),
        Some(format!("/api/files/{}/screenshot.jpg", name).as_str())
    );
    assert!(consumer.poll_once().await.unwrap().is_empty());
}
