//! End-to-end ingestion tests: slab building and provider upload
//!
//! Uploads go to an in-process axum provider bound to loopback.

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use nilstore_core::metadata::FileRecord;
use nilstore_core::upload::{HEADER_UNIT_INDEX, UPLOAD_MANIFEST_PATH, UPLOAD_UNIT_PATH};
use nilstore_core::{
    Blake3Engine, DealId, EngineClient, LocalCache, Metrics, SlabBuilder, UnitKind, UnitStatus,
    UploadPipeline, UploadTarget, UNIT_CAPACITY,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

fn init_tracing() {
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn test_24mib_file_builds_expected_slab() {
    init_tracing();
    assert_eq!(UNIT_CAPACITY, 8_126_464);

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("video.bin");
    let data = patterned(24 * 1024 * 1024);
    std::fs::write(&path, &data).unwrap();

    let engine = EngineClient::spawn(Blake3Engine::new()).unwrap();
    let metrics = Metrics::new();
    let builder = SlabBuilder::with_metrics(engine.clone(), metrics.clone());
    let slab = builder.build_from_path(&path).await.unwrap();

    info!("Built slab {} with {} units", slab.manifest_root, slab.total_units());

    assert_eq!(slab.user_unit_count, 3);
    assert!(slab.witness_unit_count >= 1);
    assert_eq!(slab.total_units(), 1 + slab.witness_unit_count + 3);
    assert_eq!(slab.manifest_root.as_bytes().len(), 32);
    assert_eq!(
        slab.file,
        FileRecord::new("video.bin", 24 * 1024 * 1024, 0).unwrap()
    );

    let kinds: Vec<UnitKind> = slab.units.iter().map(|u| u.kind).collect();
    assert_eq!(kinds[0], UnitKind::Metadata);
    assert!(kinds[1..=slab.witness_unit_count]
        .iter()
        .all(|k| *k == UnitKind::Witness));
    assert!(slab.user_units().iter().all(|u| u.kind == UnitKind::UserData));
    for (i, unit) in slab.units.iter().enumerate() {
        assert_eq!(unit.index, i as u64);
    }
    assert_eq!(metrics.bytes_encoded(), 24 * 1024 * 1024);

    // Same bytes, same root
    let again = builder.build_bytes("video.bin", &data).await.unwrap();
    assert_eq!(again.manifest_root, slab.manifest_root);
    assert_eq!(again.manifest_blob, slab.manifest_blob);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_built_slab_reads_back_from_cache() {
    init_tracing();
    let data = patterned(UNIT_CAPACITY + 4096);

    let engine = EngineClient::spawn(Blake3Engine::new()).unwrap();
    let slab = SlabBuilder::new(engine)
        .build_bytes("straddle.bin", &data)
        .await
        .unwrap();

    let dir = TempDir::new().unwrap();
    let cache = LocalCache::open(dir.path()).unwrap();
    cache.put_slab(DealId(9), &slab).await.unwrap();

    assert_eq!(cache.manifest_root(DealId(9)).await.unwrap(), Some(slab.manifest_root));

    // Range crossing the first user unit boundary
    let start = UNIT_CAPACITY as u64 - 100;
    let got = cache
        .read_file_range(DealId(9), "straddle.bin", start, Some(200))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got, &data[start as usize..start as usize + 200]);
}

#[derive(Clone, Default)]
struct Provider {
    fail_index: Option<u64>,
    indices: Arc<Mutex<Vec<u64>>>,
    manifests: Arc<Mutex<usize>>,
}

async fn upload_unit(
    State(provider): State<Provider>,
    headers: HeaderMap,
    _body: Bytes,
) -> (StatusCode, &'static str) {
    let index = headers
        .get(HEADER_UNIT_INDEX)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if let Some(index) = index {
        provider.indices.lock().unwrap().push(index);
    }
    if index.is_some() && index == provider.fail_index {
        return (StatusCode::INTERNAL_SERVER_ERROR, "disk full");
    }
    (StatusCode::OK, "ok")
}

async fn upload_manifest(State(provider): State<Provider>, _body: Bytes) -> StatusCode {
    *provider.manifests.lock().unwrap() += 1;
    StatusCode::OK
}

async fn spawn_provider(provider: Provider) -> String {
    let app = Router::new()
        .route(UPLOAD_UNIT_PATH, post(upload_unit))
        .route(UPLOAD_MANIFEST_PATH, post(upload_manifest))
        .layer(DefaultBodyLimit::disable())
        .with_state(provider);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn test_failed_unit_does_not_block_the_rest() {
    init_tracing();

    // Small file: metadata, one witness unit and one user unit
    let engine = EngineClient::spawn(Blake3Engine::new()).unwrap();
    let slab = SlabBuilder::new(engine)
        .build_bytes("notes.txt", b"hello provider")
        .await
        .unwrap();
    assert_eq!(slab.total_units(), 3);

    let provider = Provider {
        fail_index: Some(1),
        ..Provider::default()
    };
    let base = spawn_provider(provider.clone()).await;

    let metrics = Metrics::new();
    let pipeline = UploadPipeline::with_metrics(
        UploadTarget {
            provider_base: base,
            deal_id: DealId(77),
            manifest_root: slab.manifest_root,
        },
        Duration::from_secs(10),
        metrics.clone(),
    )
    .unwrap();

    let all_successful = pipeline.upload(&slab.units).await;
    assert!(!all_successful);

    let progress = pipeline.progress();
    let statuses: Vec<UnitStatus> = progress.iter().map(|p| p.status).collect();
    assert_eq!(
        statuses,
        vec![UnitStatus::Complete, UnitStatus::Error, UnitStatus::Complete]
    );
    assert_eq!(
        progress[1].error.as_deref(),
        Some("Upload failed: 500 disk full")
    );
    assert_eq!(pipeline.failed_units(), vec![1]);

    // Unit 2 was still attempted, in order
    assert_eq!(*provider.indices.lock().unwrap(), vec![0, 1, 2]);
    assert_eq!(*provider.manifests.lock().unwrap(), 0);
    assert_eq!(metrics.units_uploaded(), 2);
    assert_eq!(metrics.units_failed(), 1);
}

#[tokio::test]
async fn test_full_upload_then_manifest() {
    init_tracing();

    let engine = EngineClient::spawn(Blake3Engine::new()).unwrap();
    let slab = SlabBuilder::new(engine)
        .build_bytes("notes.txt", b"hello provider")
        .await
        .unwrap();

    let provider = Provider::default();
    let base = spawn_provider(provider.clone()).await;
    let pipeline = UploadPipeline::new(
        UploadTarget {
            provider_base: base,
            deal_id: DealId(77),
            manifest_root: slab.manifest_root,
        },
        Duration::from_secs(10),
    )
    .unwrap();

    assert!(pipeline.upload(&slab.units).await);
    pipeline.upload_manifest(&slab.manifest_blob).await.unwrap();

    assert_eq!(provider.indices.lock().unwrap().len(), 3);
    assert_eq!(*provider.manifests.lock().unwrap(), 1);
}
