//! Fixtures shared by the unit tests.

use crate::{
    config::AppConfig,
    db,
    routes::routes::{AppState, routes},
    services::{deposit_service::DepositService, storage_service::StorageService},
    tasks::{Task, TaskScheduler},
};
use axum::{
    Router,
    body::Body,
    http::{Request, Response},
};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::{
    io::{Cursor, Write},
    sync::{Arc, Mutex},
};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tower::ServiceExt;
use zip::{ZipWriter, write::SimpleFileOptions};

pub const BASE_URL: &str = "http://sword.test";

/// A migrated SQLite database and payload root inside a temp dir.
pub async fn test_storage() -> (StorageService, TempDir) {
    let tmp = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", tmp.path().join("sword.db").display());
    let pool = db::connect(&url, 5).await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    let objects = tmp.path().join("objects");
    std::fs::create_dir_all(&objects).unwrap();
    (StorageService::new(Arc::new(pool), objects), tmp)
}

/// Keeps scheduled tasks instead of running them.
#[derive(Default)]
pub struct RecordingScheduler {
    tasks: Mutex<Vec<Task>>,
}

impl RecordingScheduler {
    pub fn tasks(&self) -> Vec<Task> {
        self.tasks.lock().unwrap().clone()
    }
}

impl TaskScheduler for RecordingScheduler {
    fn schedule(&self, task: Task) {
        self.tasks.lock().unwrap().push(task);
    }
}

/// Serve `router` on an ephemeral port and return its base URL.
pub async fn serve_remote(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

pub fn zip_bytes<B: AsRef<[u8]>>(entries: &[(&str, B)]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, bytes) in entries {
        writer
            .start_file(*name, SimpleFileOptions::default())
            .unwrap();
        writer.write_all(bytes.as_ref()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// Builds zipped BagIt bags with a SHA-256 payload manifest and an MD5 tag
/// manifest.
#[derive(Default)]
pub struct BagBuilder {
    root: String,
    payload: Vec<(String, Vec<u8>)>,
    unlisted: Vec<(String, Vec<u8>)>,
    info: Vec<(String, String)>,
    fetch: Vec<String>,
    metadata: Option<Vec<u8>>,
    corrupt: bool,
}

impl BagBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place the bag under a top-level directory such as `mybag/`.
    pub fn root(mut self, prefix: &str) -> Self {
        self.root = prefix.to_string();
        self
    }

    pub fn payload(mut self, name: &str, bytes: impl AsRef<[u8]>) -> Self {
        self.payload.push((name.to_string(), bytes.as_ref().to_vec()));
        self
    }

    /// A payload file missing from the manifest.
    pub fn unlisted_payload(mut self, name: &str, bytes: impl AsRef<[u8]>) -> Self {
        self.unlisted.push((name.to_string(), bytes.as_ref().to_vec()));
        self
    }

    pub fn info(mut self, label: &str, value: &str) -> Self {
        self.info.push((label.to_string(), value.to_string()));
        self
    }

    pub fn fetch(mut self, line: &str) -> Self {
        self.fetch.push(line.to_string());
        self
    }

    pub fn metadata(mut self, bytes: impl AsRef<[u8]>) -> Self {
        self.metadata = Some(bytes.as_ref().to_vec());
        self
    }

    /// Record a wrong checksum for the first payload file.
    pub fn corrupt_manifest(mut self) -> Self {
        self.corrupt = true;
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut tag_files: Vec<(String, Vec<u8>)> = vec![(
            "bagit.txt".into(),
            b"BagIt-Version: 1.0\nTag-File-Character-Encoding: UTF-8\n".to_vec(),
        )];

        let manifest: String = self
            .payload
            .iter()
            .enumerate()
            .map(|(index, (name, bytes))| {
                let checksum = if self.corrupt && index == 0 {
                    "0".repeat(64)
                } else {
                    format!("{:x}", Sha256::digest(bytes))
                };
                format!("{checksum}  data/{name}\n")
            })
            .collect();
        tag_files.push(("manifest-sha256.txt".into(), manifest.into_bytes()));

        if !self.info.is_empty() {
            let info: String = self
                .info
                .iter()
                .map(|(label, value)| format!("{label}: {value}\n"))
                .collect();
            tag_files.push(("bag-info.txt".into(), info.into_bytes()));
        }
        if !self.fetch.is_empty() {
            tag_files.push(("fetch.txt".into(), format!("{}\n", self.fetch.join("\n")).into_bytes()));
        }
        if let Some(metadata) = self.metadata {
            tag_files.push(("metadata/sword.json".into(), metadata));
        }

        let tag_manifest: String = tag_files
            .iter()
            .map(|(name, bytes)| format!("{:x}  {name}\n", md5::compute(bytes)))
            .collect();
        tag_files.push(("tagmanifest-md5.txt".into(), tag_manifest.into_bytes()));

        let root = &self.root;
        let entries: Vec<(String, Vec<u8>)> = tag_files
            .into_iter()
            .map(|(name, bytes)| (format!("{root}{name}"), bytes))
            .chain(
                self.payload
                    .into_iter()
                    .chain(self.unlisted)
                    .map(|(name, bytes)| (format!("{root}data/{name}"), bytes)),
            )
            .collect();
        let entries: Vec<(&str, &[u8])> = entries
            .iter()
            .map(|(name, bytes)| (name.as_str(), bytes.as_slice()))
            .collect();
        zip_bytes(&entries)
    }
}

/// A router over a fresh store, with background tasks recorded rather than run.
pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub scheduler: Arc<RecordingScheduler>,
    _tmp: TempDir,
}

pub async fn test_app() -> TestApp {
    test_app_with(|_| {}).await
}

pub async fn test_app_with(configure: impl FnOnce(&mut AppConfig)) -> TestApp {
    let (storage, tmp) = test_storage().await;
    let mut config = AppConfig {
        base_url: BASE_URL.into(),
        storage_dir: storage.base_path.display().to_string(),
        ..AppConfig::default()
    };
    configure(&mut config);
    let storage = storage.with_unpack_limit(config.max_unpacked_size);
    let config = Arc::new(config);
    let scheduler = Arc::new(RecordingScheduler::default());
    let deposits = DepositService::new(storage.clone(), config.clone(), scheduler.clone()).unwrap();
    let state = AppState {
        storage,
        deposits,
        config,
    };
    TestApp {
        router: routes().with_state(state.clone()),
        state,
        scheduler,
        _tmp: tmp,
    }
}

impl TestApp {
    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

pub async fn body_json(response: Response<Body>) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

/// The path part of one of the server's absolute URLs.
pub fn path_of(url: &str) -> &str {
    url.strip_prefix(BASE_URL).unwrap_or(url)
}
