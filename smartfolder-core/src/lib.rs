//! Core of the SmartFolder scan agent.
//!
//! Watched directories and removable devices feed a submission gate that
//! deduplicates file changes against a ledger of modification times. Accepted
//! files become [`ScanSession`]s that travel through two queues: an upload
//! worker sends file contents to the remote scanning service, a download
//! worker polls for the verdict, and the pipeline finalizes each session as
//! clean or infected. Everything the outside world needs to know is published
//! as a [`PipelineEvent`].
//!
//! [`ScanRuntime`] wires the pieces together for a running agent.

pub mod clock;
pub mod config;
pub mod credential;
pub mod device;
pub mod error;
pub mod events;
pub mod fs;
pub mod pipeline;
pub mod remote;
pub mod runtime;
pub mod types;
pub mod watch;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::PipelineConfig;
pub use credential::CredentialStore;
pub use device::{DeviceChanges, DeviceMonitor};
pub use error::{Result, ScanError};
pub use events::{
    InProcEventBus, NoopObserver, ObserverSet, PipelineEvent, PipelineObserver,
    RecordingObserver, TracingObserver,
};
pub use fs::{FileSystem, FsMetadata, InMemoryFs, RealFs};
pub use pipeline::{
    Admission, DownloadSweep, DownloadWorker, QueueDepths, ScanPipeline, SessionQueue,
    UploadSweep, UploadWorker,
};
pub use remote::{MetascanClient, RemoteError, ScanService};
pub use runtime::{ScanRuntime, ScanRuntimeBuilder};
pub use types::{
    RemoteId, Resolution, ScanResult, ScanSession, SessionAction, SessionId, SessionStatus,
    Verdict,
};
pub use watch::{PathWatcher, RecordingBackend, WatchBackend, WatchEvent, WatchEventKind};
