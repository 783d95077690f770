#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use smartfolder_core::{
    FileSystem, InMemoryFs, PipelineConfig, PipelineObserver, RecordingBackend,
    RecordingObserver, RemoteError, RemoteId, ScanResult, ScanRuntime, ScanService,
};

/// Stand-in for the remote service.
///
/// Each upload gets a fresh remote id. Polls report progress for
/// `polls_before_done` rounds, then complete with the code scripted for the
/// uploaded file name (0 when nothing was scripted).
#[derive(Default)]
pub struct FakeScanService {
    next_id: AtomicUsize,
    polls_before_done: usize,
    reject_credentials: AtomicBool,
    uploads: Mutex<Vec<(String, String)>>,
    names: Mutex<HashMap<String, String>>,
    codes: Mutex<HashMap<String, i64>>,
    polls: Mutex<HashMap<String, usize>>,
}

impl FakeScanService {
    pub fn new(polls_before_done: usize) -> Self {
        Self {
            polls_before_done,
            ..Self::default()
        }
    }

    pub fn verdict_for(self, file_name: &str, code: i64) -> Self {
        self.codes
            .lock()
            .unwrap()
            .insert(file_name.to_string(), code);
        self
    }

    pub fn reject_credentials(&self, reject: bool) {
        self.reject_credentials.store(reject, Ordering::SeqCst);
    }

    /// `(file name, credential)` for every accepted upload.
    pub fn uploads(&self) -> Vec<(String, String)> {
        self.uploads.lock().unwrap().clone()
    }
}

#[async_trait]
impl ScanService for FakeScanService {
    async fn submit(
        &self,
        _contents: Vec<u8>,
        file_name: &str,
        credential: &str,
    ) -> Result<RemoteId, RemoteError> {
        if self.reject_credentials.load(Ordering::SeqCst) {
            return Err(RemoteError::Unauthorized);
        }
        let id = format!("remote-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.uploads
            .lock()
            .unwrap()
            .push((file_name.to_string(), credential.to_string()));
        self.names
            .lock()
            .unwrap()
            .insert(id.clone(), file_name.to_string());
        Ok(RemoteId::new(id).unwrap())
    }

    async fn poll(&self, remote_id: &RemoteId, _credential: &str) -> Result<ScanResult, RemoteError> {
        if self.reject_credentials.load(Ordering::SeqCst) {
            return Err(RemoteError::Unauthorized);
        }
        let name = self
            .names
            .lock()
            .unwrap()
            .get(remote_id.as_str())
            .cloned()
            .ok_or_else(|| RemoteError::Malformed("unknown data_id".to_string()))?;

        let round = {
            let mut polls = self.polls.lock().unwrap();
            let count = polls.entry(remote_id.as_str().to_string()).or_default();
            *count += 1;
            *count
        };

        if round <= self.polls_before_done {
            return Ok(ScanResult {
                queue_position: (self.polls_before_done - round) as i64,
                progress_percent: 50,
                result_code: 0,
                result_label: String::new(),
                observed_at: Utc::now(),
            });
        }

        let code = self.codes.lock().unwrap().get(&name).copied().unwrap_or(0);
        Ok(ScanResult {
            queue_position: 0,
            progress_percent: 100,
            result_code: code,
            result_label: (if code == 0 { "No threat detected" } else { "Infected" }).to_string(),
            observed_at: Utc::now(),
        })
    }
}

pub struct TestAgent {
    pub fs: Arc<InMemoryFs>,
    pub recorder: Arc<RecordingObserver>,
    pub service: Arc<FakeScanService>,
    pub backend: RecordingBackend,
    pub runtime: ScanRuntime,
}

pub fn fast_config() -> PipelineConfig {
    PipelineConfig {
        upload_interval_ms: 10,
        download_interval_ms: 10,
        device_poll_interval_ms: 10,
        ..PipelineConfig::default()
    }
}

pub fn agent(credential: &str, service: FakeScanService) -> TestAgent {
    agent_with_devices(credential, service, Vec::new())
}

pub fn agent_with_devices(
    credential: &str,
    service: FakeScanService,
    devices: Vec<std::path::PathBuf>,
) -> TestAgent {
    let fs = Arc::new(InMemoryFs::new());
    let recorder = Arc::new(RecordingObserver::new());
    let service = Arc::new(service);
    let backend = RecordingBackend::new();

    let runtime = ScanRuntime::builder(fast_config())
        .credential(credential)
        .filesystem(Arc::clone(&fs) as Arc<dyn FileSystem>)
        .observer(Arc::clone(&recorder) as Arc<dyn PipelineObserver>)
        .service(Arc::clone(&service) as Arc<dyn ScanService>)
        .watch_backend(Box::new(backend.clone()))
        .devices(devices)
        .build()
        .unwrap();

    TestAgent {
        fs,
        recorder,
        service,
        backend,
        runtime,
    }
}

/// Poll `condition` until it holds, panicking after five seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

pub async fn wait_idle(runtime: &ScanRuntime) {
    tokio::time::timeout(
        Duration::from_secs(5),
        runtime.wait_until_idle(Duration::from_millis(5)),
    )
    .await
    .expect("pipeline did not drain in time");
}
