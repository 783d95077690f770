//! Process-level wiring: one pipeline, one watcher, the two workers and the
//! optional device monitor, all stopped through a shared cancellation token.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::PipelineConfig;
use crate::credential::CredentialStore;
use crate::device::DeviceMonitor;
use crate::error::{Result, ScanError};
use crate::events::{NoopObserver, PipelineObserver};
use crate::fs::{FileSystem, RealFs};
use crate::pipeline::{DownloadWorker, QueueDepths, ScanPipeline, UploadWorker};
use crate::remote::{MetascanClient, ScanService};
use crate::types::SessionId;
use crate::watch::{NotifyBackend, PathWatcher, WatchBackend, WatchMessage};

/// Assembles a [`ScanRuntime`]. Anything not supplied falls back to the real
/// implementation: local filesystem, `notify` watches, the Metascan client.
pub struct ScanRuntimeBuilder {
    config: PipelineConfig,
    credential: String,
    fs: Option<Arc<dyn FileSystem>>,
    observer: Option<Arc<dyn PipelineObserver>>,
    service: Option<Arc<dyn ScanService>>,
    backend: Option<Box<dyn WatchBackend>>,
    clock: Option<Arc<dyn Clock>>,
    devices: Vec<PathBuf>,
}

impl fmt::Debug for ScanRuntimeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanRuntimeBuilder")
            .field("config", &self.config)
            .field("custom_fs", &self.fs.is_some())
            .field("custom_service", &self.service.is_some())
            .field("custom_backend", &self.backend.is_some())
            .field("devices", &self.devices)
            .finish()
    }
}

impl ScanRuntimeBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            credential: String::new(),
            fs: None,
            observer: None,
            service: None,
            backend: None,
            clock: None,
            devices: Vec::new(),
        }
    }

    pub fn credential(mut self, key: impl Into<String>) -> Self {
        self.credential = key.into();
        self
    }

    pub fn filesystem(mut self, fs: Arc<dyn FileSystem>) -> Self {
        self.fs = Some(fs);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn service(mut self, service: Arc<dyn ScanService>) -> Self {
        self.service = Some(service);
        self
    }

    pub fn watch_backend(mut self, backend: Box<dyn WatchBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Candidate mount points for the device monitor. Leaving this empty
    /// disables device detection.
    pub fn devices(mut self, devices: Vec<PathBuf>) -> Self {
        self.devices = devices;
        self
    }

    pub fn build(self) -> Result<ScanRuntime> {
        self.config.validate()?;

        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };
        let service: Arc<dyn ScanService> = match self.service {
            Some(service) => service,
            None => Arc::new(
                MetascanClient::new(&self.config.service_base_url, self.config.request_timeout())?
                    .with_clock(Arc::clone(&clock)),
            ),
        };

        let fs: Arc<dyn FileSystem> = match self.fs {
            Some(fs) => fs,
            None => Arc::new(RealFs::new()),
        };
        let observer: Arc<dyn PipelineObserver> = match self.observer {
            Some(observer) => observer,
            None => Arc::new(NoopObserver),
        };
        let pipeline = Arc::new(
            ScanPipeline::new(fs, Arc::new(CredentialStore::new(self.credential)), observer)
                .with_clock(clock),
        );

        let (watch_tx, watch_rx) = mpsc::unbounded_channel();
        let backend: Box<dyn WatchBackend> = match self.backend {
            Some(backend) => backend,
            None => Box::new(NotifyBackend::new(watch_tx.clone())?),
        };
        let watcher = Arc::new(PathWatcher::new(Arc::clone(&pipeline), backend));

        Ok(ScanRuntime {
            config: self.config,
            pipeline,
            watcher,
            service,
            devices: self.devices,
            watch_tx,
            watch_rx: Mutex::new(Some(watch_rx)),
            shutdown_token: CancellationToken::new(),
            worker_handles: Mutex::new(Vec::new()),
        })
    }
}

pub struct ScanRuntime {
    config: PipelineConfig,
    pipeline: Arc<ScanPipeline>,
    watcher: Arc<PathWatcher>,
    service: Arc<dyn ScanService>,
    devices: Vec<PathBuf>,
    watch_tx: mpsc::UnboundedSender<WatchMessage>,
    watch_rx: Mutex<Option<mpsc::UnboundedReceiver<WatchMessage>>>,
    shutdown_token: CancellationToken,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for ScanRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let worker_handle_count = self
            .worker_handles
            .try_lock()
            .map(|handles| handles.len())
            .unwrap_or_default();
        f.debug_struct("ScanRuntime")
            .field("config", &self.config)
            .field("pipeline", &self.pipeline)
            .field("watcher", &self.watcher)
            .field("devices", &self.devices)
            .field("worker_handle_count", &worker_handle_count)
            .field("shutdown_cancelled", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

impl ScanRuntime {
    pub fn builder(config: PipelineConfig) -> ScanRuntimeBuilder {
        ScanRuntimeBuilder::new(config)
    }

    pub fn pipeline(&self) -> &Arc<ScanPipeline> {
        &self.pipeline
    }

    pub fn watcher(&self) -> &Arc<PathWatcher> {
        &self.watcher
    }

    /// Feed for the watcher loop. Native watches use it; embedders and tests
    /// may inject events through it as well.
    pub fn watch_sender(&self) -> mpsc::UnboundedSender<WatchMessage> {
        self.watch_tx.clone()
    }

    /// Spawn the background loops. Fails if called twice.
    pub async fn start(&self) -> Result<()> {
        let Some(watch_rx) = self.watch_rx.lock().await.take() else {
            return Err(ScanError::Internal("scan runtime already started".to_string()));
        };
        let shutdown = self.shutdown_token.clone();
        let mut handles = self.worker_handles.lock().await;

        handles.push(tokio::spawn(
            Arc::clone(&self.watcher).run(watch_rx, shutdown.clone()),
        ));
        handles.push(tokio::spawn(
            UploadWorker::new(
                Arc::clone(&self.pipeline),
                Arc::clone(&self.service),
                self.config.upload_interval(),
            )
            .run(shutdown.clone()),
        ));
        handles.push(tokio::spawn(
            DownloadWorker::new(
                Arc::clone(&self.pipeline),
                Arc::clone(&self.service),
                self.config.download_interval(),
            )
            .run(shutdown.clone()),
        ));
        if !self.devices.is_empty() {
            handles.push(tokio::spawn(
                DeviceMonitor::new(
                    Arc::clone(&self.pipeline),
                    self.devices.clone(),
                    self.config.device_poll_interval(),
                )
                .run(shutdown.clone()),
            ));
        }

        info!(workers = handles.len(), "scan runtime started");
        Ok(())
    }

    pub async fn register_directory(&self, dir: &Path) -> bool {
        self.watcher.register(dir).await
    }

    pub async fn unregister_directory(&self, dir: &Path) -> bool {
        self.watcher.unregister(dir).await
    }

    /// Manual scan of a file or a whole directory. Returns how many sessions
    /// were queued or refreshed.
    pub async fn scan_now(&self, path: &Path, force: bool) -> Result<usize> {
        let metadata = self.pipeline.fs().metadata(path).await?;
        if metadata.is_dir {
            Ok(self.pipeline.submit_directory(path, force).await)
        } else {
            Ok(usize::from(self.pipeline.submit_file(path, force).await.is_some()))
        }
    }

    pub async fn scan_file(&self, path: &Path, force: bool) -> Option<SessionId> {
        self.pipeline.submit_file(path, force).await
    }

    pub fn set_credential(&self, key: impl Into<String>) -> bool {
        self.pipeline.set_credential(key)
    }

    pub fn outstanding_sessions(&self) -> usize {
        self.pipeline.outstanding_sessions()
    }

    pub async fn queue_depths(&self) -> QueueDepths {
        self.pipeline.queue_depths().await
    }

    /// Resolve once every accepted session has been finalized or dropped.
    pub async fn wait_until_idle(&self, check_every: Duration) {
        while self.pipeline.outstanding_sessions() > 0 {
            tokio::select! {
                _ = self.shutdown_token.cancelled() => return,
                _ = tokio::time::sleep(check_every) => {}
            }
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Cancel every loop and wait for them to finish their current step.
    pub async fn shutdown(&self) {
        info!("shutting down scan runtime");
        self.shutdown_token.cancel();

        let handles: Vec<_> = self.worker_handles.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "background task ended abnormally");
            }
        }
        info!("scan runtime stopped");
    }
}
