use std::sync::Arc;

use ddmux_config::DdmuxConfig;
use futures::StreamExt;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::ddms::DdmsChunkCodec;
use crate::device::{DeviceError, DeviceProcessSource, ProcessIdList};
use crate::handle::ProcessHandle;
use crate::process_map::ProcessMap;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessTrackerEvent {
    Created(u32),
    Destroyed(u32),
    /// The process list was emptied after a transient tracking failure.
    ProcessListCleared,
}

#[derive(Debug, Error)]
pub enum TrackerError {
    /// Tracking stopped and the device no longer answers.
    #[error("device {serial} is no longer reachable")]
    DeviceGone {
        serial: String,
        #[source]
        cause: Option<DeviceError>,
    },
}

enum StreamEnd {
    Ended,
    Failed(DeviceError),
}

/// Keeps the set of JDWP processes of one device up to date.
///
/// The process-id subscription is restarted after a transient failure, with
/// the process list cleared in between. Tracking stops when the device is
/// unreachable after a subscription ended, or on [`shutdown`](Self::shutdown_token).
pub struct ProcessTracker {
    device: Arc<dyn DeviceProcessSource>,
    config: DdmuxConfig,
    codec: Option<Arc<dyn DdmsChunkCodec>>,
    map: ProcessMap,
    processes: watch::Sender<Vec<Arc<ProcessHandle>>>,
    events: broadcast::Sender<ProcessTrackerEvent>,
    shutdown: CancellationToken,
}

impl ProcessTracker {
    pub fn new(device: Arc<dyn DeviceProcessSource>, config: DdmuxConfig) -> Self {
        let (processes, _) = watch::channel(Vec::new());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            device,
            config,
            codec: None,
            map: ProcessMap::new(),
            processes,
            events,
            shutdown: CancellationToken::new(),
        }
    }

    /// Starts property collection on every process as it appears.
    pub fn with_properties_collection(mut self, codec: Arc<dyn DdmsChunkCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Ordered snapshots of the live process handles.
    pub fn processes(&self) -> watch::Receiver<Vec<Arc<ProcessHandle>>> {
        self.processes.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ProcessTrackerEvent> {
        self.events.subscribe()
    }

    /// Cancelling the token stops [`run`](Self::run), which then destroys
    /// every remaining handle. Handle scopes are children of this token.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn run(mut self) -> Result<(), TrackerError> {
        let serial = self.device.serial().to_string();
        tracing::debug!(target: "ddmux.process", serial = %serial, "process tracker started");
        let result = self.track(&serial).await;

        self.apply(&ProcessIdList::new()).await;
        match &result {
            Ok(()) => tracing::debug!(target: "ddmux.process", serial = %serial, "process tracker stopped"),
            Err(err) => tracing::warn!(target: "ddmux.process", serial = %serial, error = %err, "process tracker stopped"),
        }
        result
    }

    async fn track(&mut self, serial: &str) -> Result<(), TrackerError> {
        let shutdown = self.shutdown.clone();
        loop {
            let end = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(()),
                end = self.stream_once() => end,
            };

            let cause = match end {
                StreamEnd::Ended => {
                    tracing::debug!(target: "ddmux.process", serial, "process list subscription ended");
                    None
                }
                StreamEnd::Failed(err) => {
                    tracing::warn!(target: "ddmux.process", serial, error = %err, "process list subscription failed");
                    Some(err)
                }
            };

            let reachable = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(()),
                reachable = self.device.is_reachable() => reachable,
            };
            if !reachable {
                return Err(TrackerError::DeviceGone {
                    serial: serial.to_string(),
                    cause,
                });
            }

            self.apply(&ProcessIdList::new()).await;
            let _ = self.events.send(ProcessTrackerEvent::ProcessListCleared);

            let delay = self.config.tracker.retry_delay();
            tracing::debug!(target: "ddmux.process", serial, ?delay, "retrying process list subscription");
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn stream_once(&mut self) -> StreamEnd {
        let mut stream = match self.device.track_processes().await {
            Ok(stream) => stream,
            Err(err) => return StreamEnd::Failed(err),
        };
        while let Some(next) = stream.next().await {
            match next {
                Ok(pids) => self.apply(&pids).await,
                Err(err) => return StreamEnd::Failed(err),
            }
        }
        StreamEnd::Ended
    }

    /// Makes the map match `pids`: removed handles are destroyed first, then
    /// new ones are created.
    async fn apply(&mut self, pids: &ProcessIdList) {
        let delta = self.map.delta(pids);
        if delta.is_empty() {
            return;
        }

        for pid in delta.removed {
            if let Some(handle) = self.map.get(pid).cloned() {
                handle.destroy().await;
                self.map.remove(pid);
                tracing::debug!(target: "ddmux.process", pid, "process removed");
                let _ = self.events.send(ProcessTrackerEvent::Destroyed(pid));
            }
        }
        for pid in delta.added {
            let handle = ProcessHandle::new(pid, self.device.clone(), &self.shutdown, &self.config);
            if let Some(codec) = &self.codec {
                handle.start_properties_collection(codec.clone());
            }
            self.map.insert(handle);
            tracing::debug!(target: "ddmux.process", pid, "process added");
            let _ = self.events.send(ProcessTrackerEvent::Created(pid));
        }

        self.processes.send_replace(self.map.snapshot());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDdmsCodec, ScriptedDevice, VmScript};
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::sync::broadcast::error::TryRecvError;

    const STEP: Duration = Duration::from_secs(5);

    fn fast_config() -> DdmuxConfig {
        let mut config = DdmuxConfig::default();
        config.tracker.retry_delay_ms = 5;
        config.collector.retry_delay_ms = 1;
        config
    }

    fn drain(events: &mut broadcast::Receiver<ProcessTrackerEvent>) -> Vec<ProcessTrackerEvent> {
        let mut out = Vec::new();
        loop {
            match events.try_recv() {
                Ok(event) => out.push(event),
                Err(TryRecvError::Empty | TryRecvError::Closed) => return out,
                Err(TryRecvError::Lagged(n)) => panic!("lagged by {n} events"),
            }
        }
    }

    #[tokio::test]
    async fn id_set_changes_create_and_destroy_handles() {
        let device = ScriptedDevice::new("emulator-5554").with_subscription(vec![
            Ok(ProcessIdList::from([1, 2])),
            Ok(ProcessIdList::from([2, 3])),
            Ok(ProcessIdList::new()),
        ]);
        device.set_reachable(false);
        let tracker = ProcessTracker::new(Arc::new(device), fast_config());
        let mut events = tracker.subscribe_events();

        let err = tokio::time::timeout(STEP, tracker.run())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, TrackerError::DeviceGone { cause: None, .. }), "{err:?}");

        use ProcessTrackerEvent::*;
        assert_eq!(
            drain(&mut events),
            vec![
                Created(1),
                Created(2),
                Destroyed(1),
                Created(3),
                Destroyed(2),
                Destroyed(3),
            ]
        );
    }

    #[tokio::test]
    async fn snapshots_follow_the_map() {
        let device = ScriptedDevice::new("emulator-5554")
            .with_open_subscription(vec![Ok(ProcessIdList::from([30, 10, 20]))]);
        let tracker = ProcessTracker::new(Arc::new(device), fast_config());
        let mut processes = tracker.processes();
        let shutdown = tracker.shutdown_token();
        let run = tokio::spawn(tracker.run());

        let snapshot = tokio::time::timeout(STEP, processes.wait_for(|p| p.len() == 3))
            .await
            .unwrap()
            .unwrap()
            .clone();
        let pids: Vec<u32> = snapshot.iter().map(|h| h.pid()).collect();
        assert_eq!(pids, vec![10, 20, 30]);

        shutdown.cancel();
        tokio::time::timeout(STEP, run).await.unwrap().unwrap().unwrap();
        assert!(processes.borrow().is_empty());
        assert!(snapshot.iter().all(|h| h.is_destroyed()));
    }

    #[tokio::test]
    async fn transient_failure_clears_list_and_resubscribes() {
        let device = Arc::new(ScriptedDevice::new("emulator-5554").with_subscription(vec![
            Ok(ProcessIdList::from([1])),
            Err(DeviceError::Tracking("connection reset".to_string())),
        ]));
        let mut subscriptions = device.subscriptions();
        let tracker = ProcessTracker::new(device.clone(), fast_config());
        let mut events = tracker.subscribe_events();
        let shutdown = tracker.shutdown_token();
        let run = tokio::spawn(tracker.run());

        tokio::time::timeout(STEP, subscriptions.wait_for(|n| *n >= 2))
            .await
            .unwrap()
            .unwrap();
        shutdown.cancel();
        tokio::time::timeout(STEP, run).await.unwrap().unwrap().unwrap();

        use ProcessTrackerEvent::*;
        assert_eq!(
            drain(&mut events),
            vec![Created(1), Destroyed(1), ProcessListCleared]
        );
    }

    #[tokio::test]
    async fn clean_end_while_reachable_is_retried() {
        let device = Arc::new(
            ScriptedDevice::new("emulator-5554")
                .with_subscription(vec![Ok(ProcessIdList::from([4]))])
                .with_open_subscription(vec![Ok(ProcessIdList::from([4, 5]))]),
        );
        let mut subscriptions = device.subscriptions();
        let tracker = ProcessTracker::new(device.clone(), fast_config());
        let mut processes = tracker.processes();
        let shutdown = tracker.shutdown_token();
        let run = tokio::spawn(tracker.run());

        tokio::time::timeout(STEP, processes.wait_for(|p| p.len() == 2))
            .await
            .unwrap()
            .unwrap();
        assert!(*subscriptions.borrow_and_update() >= 2);
        shutdown.cancel();
        tokio::time::timeout(STEP, run).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn failure_on_unreachable_device_is_terminal() {
        let device = Arc::new(ScriptedDevice::new("emulator-5554").with_subscription(vec![
            Ok(ProcessIdList::from([8])),
            Err(DeviceError::Tracking("device offline".to_string())),
        ]));
        device.set_reachable(false);
        let tracker = ProcessTracker::new(device.clone(), fast_config());
        let mut events = tracker.subscribe_events();

        let err = tokio::time::timeout(STEP, tracker.run())
            .await
            .unwrap()
            .unwrap_err();
        match err {
            TrackerError::DeviceGone { serial, cause } => {
                assert_eq!(serial, "emulator-5554");
                assert_eq!(
                    cause,
                    Some(DeviceError::Tracking("device offline".to_string()))
                );
            }
        }
        assert_eq!(*device.subscriptions().borrow(), 1);

        use ProcessTrackerEvent::*;
        // No ProcessListCleared: the handles go away with the tracker.
        assert_eq!(drain(&mut events), vec![Created(8), Destroyed(8)]);
    }

    #[tokio::test]
    async fn new_processes_get_their_properties_collected() {
        let device = ScriptedDevice::new("emulator-5554")
            .with_open_subscription(vec![Ok(ProcessIdList::from([1200]))])
            .with_vm(|pid| VmScript::app(pid, "com.example.tracked"));
        let tracker = ProcessTracker::new(Arc::new(device), fast_config())
            .with_properties_collection(Arc::new(MockDdmsCodec));
        let mut processes = tracker.processes();
        let shutdown = tracker.shutdown_token();
        let run = tokio::spawn(tracker.run());

        let handle = tokio::time::timeout(STEP, processes.wait_for(|p| p.len() == 1))
            .await
            .unwrap()
            .unwrap()[0]
            .clone();
        let mut properties = handle.subscribe_properties();
        tokio::time::timeout(
            STEP,
            properties.wait_for(|p| p.process_name.as_deref() == Some("com.example.tracked")),
        )
        .await
        .unwrap()
        .unwrap();

        shutdown.cancel();
        tokio::time::timeout(STEP, run).await.unwrap().unwrap().unwrap();
        assert!(handle.is_destroyed());
    }
}
