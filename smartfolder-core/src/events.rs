//! Observable events emitted by the pipeline.
//!
//! The presentation layer (tray, tables, review lists) lives outside this
//! crate; it subscribes through a [`PipelineObserver`]. The in-process bus
//! fans events out over a broadcast channel, the tracing observer turns them
//! into log lines for headless runs.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::types::{ScanSession, SessionAction, SessionId, SessionStatus};

#[derive(Clone, Debug, Serialize)]
pub enum PipelineEvent {
    DirectorySetChanged {
        roots: Vec<PathBuf>,
    },
    SessionAdded {
        session: ScanSession,
    },
    SessionStatusChanged {
        session_id: SessionId,
        file: PathBuf,
        status: SessionStatus,
    },
    SessionActionChanged {
        session_id: SessionId,
        file: PathBuf,
        action: SessionAction,
    },
    ScanProgress {
        session_id: SessionId,
        file: PathBuf,
        queue_position: i64,
        progress_percent: i64,
    },
    VirusDetected {
        session: ScanSession,
    },
    CredentialInvalid,
    DeviceAppeared {
        path: PathBuf,
    },
    DeviceDisappeared {
        path: PathBuf,
    },
}

/// Sink for pipeline notifications. Implementations must not block.
pub trait PipelineObserver: Send + Sync {
    fn on_event(&self, event: PipelineEvent);
}

/// No-op observer used when nothing is wired up.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl PipelineObserver for NoopObserver {
    fn on_event(&self, _event: PipelineEvent) {}
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl PipelineObserver for TracingObserver {
    fn on_event(&self, event: PipelineEvent) {
        match event {
            PipelineEvent::DirectorySetChanged { roots } => {
                info!(target: "smartfolder::watch", roots = roots.len(), "watched directories changed")
            }
            PipelineEvent::SessionAdded { session } => {
                info!(session = %session.id, file = %session.file.display(), "session queued")
            }
            PipelineEvent::SessionStatusChanged {
                session_id,
                file,
                status,
            } => {
                info!(session = %session_id, file = %file.display(), %status, "session status")
            }
            PipelineEvent::SessionActionChanged {
                session_id,
                file,
                action,
            } => {
                info!(session = %session_id, file = %file.display(), action = action.label(), "session action")
            }
            PipelineEvent::ScanProgress {
                session_id,
                queue_position,
                progress_percent,
                ..
            } => {
                info!(session = %session_id, queue_position, progress_percent, "scan in progress")
            }
            PipelineEvent::VirusDetected { session } => {
                let label = session
                    .result
                    .as_ref()
                    .map(|result| result.result_label.clone())
                    .unwrap_or_default();
                warn!(session = %session.id, file = %session.file.display(), result = %label, "suspicious file detected")
            }
            PipelineEvent::CredentialInvalid => {
                warn!("the configured API key is missing or was rejected")
            }
            PipelineEvent::DeviceAppeared { path } => {
                info!(target: "smartfolder::device", path = %path.display(), "device appeared")
            }
            PipelineEvent::DeviceDisappeared { path } => {
                info!(target: "smartfolder::device", path = %path.display(), "device disappeared")
            }
        }
    }
}

/// Lightweight in-process event bus backed by a broadcast channel.
pub struct InProcEventBus {
    sender: broadcast::Sender<PipelineEvent>,
    capacity: usize,
}

impl fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl InProcEventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }
}

impl PipelineObserver for InProcEventBus {
    fn on_event(&self, event: PipelineEvent) {
        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }
}

/// Forwards each event to several observers in order.
#[derive(Default, Clone)]
pub struct ObserverSet {
    observers: Vec<Arc<dyn PipelineObserver>>,
}

impl fmt::Debug for ObserverSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverSet")
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.observers.push(observer);
        self
    }
}

impl PipelineObserver for ObserverSet {
    fn on_event(&self, event: PipelineEvent) {
        if let Some((last, rest)) = self.observers.split_last() {
            for observer in rest {
                observer.on_event(event.clone());
            }
            last.on_event(event);
        }
    }
}

/// Keeps every event in memory. Used by tests and by embedders that poll.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<PipelineEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Statuses reported for one session, in emission order.
    pub fn statuses_for(&self, id: SessionId) -> Vec<SessionStatus> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                PipelineEvent::SessionStatusChanged {
                    session_id, status, ..
                } if session_id == id => Some(status),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, predicate: impl Fn(&PipelineEvent) -> bool) -> usize {
        self.events().iter().filter(|event| predicate(event)).count()
    }
}

impl PipelineObserver for RecordingObserver {
    fn on_event(&self, event: PipelineEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn observer_set_fans_out_to_bus_and_recorder() {
        let bus = Arc::new(InProcEventBus::new(8));
        let recorder = Arc::new(RecordingObserver::new());
        let mut rx = bus.subscribe();

        let set = ObserverSet::new()
            .with(Arc::clone(&bus) as Arc<dyn PipelineObserver>)
            .with(Arc::clone(&recorder) as Arc<dyn PipelineObserver>);
        set.on_event(PipelineEvent::CredentialInvalid);

        assert!(matches!(
            rx.recv().await.unwrap(),
            PipelineEvent::CredentialInvalid
        ));
        assert_eq!(recorder.events().len(), 1);
    }

    #[test]
    fn bus_without_subscribers_drops_events() {
        let bus = InProcEventBus::new(1);
        bus.on_event(PipelineEvent::CredentialInvalid);
        bus.on_event(PipelineEvent::CredentialInvalid);
    }
}
