use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ddmux_config::{CollectorConfig, DdmuxConfig};
use ddmux_jdwp::{JdwpError, JdwpSession, ReferenceCountedResource, Retained, SharedJdwpSession};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::collector::{CollectorError, ProcessPropertiesCollector};
use crate::ddms::DdmsChunkCodec;
use crate::device::DeviceProcessSource;
use crate::properties::{ProcessProperties, ProcessPropertiesCell};

/// One JDWP process on a device.
///
/// The JDWP session is opened on the first [`retain_session`] and closed
/// when the last retainer releases it. Destroying the handle cancels its
/// scope, which stops property collection, and closes the session.
///
/// [`retain_session`]: ProcessHandle::retain_session
pub struct ProcessHandle {
    pid: u32,
    scope: CancellationToken,
    session: Arc<ReferenceCountedResource<SharedJdwpSession>>,
    properties: ProcessPropertiesCell,
    collector_config: CollectorConfig,
    collection_started: AtomicBool,
}

impl ProcessHandle {
    /// `parent` is the device scope; cancelling it destroys this handle's
    /// scope too, never the other way round.
    pub fn new(
        pid: u32,
        device: Arc<dyn DeviceProcessSource>,
        parent: &CancellationToken,
        config: &DdmuxConfig,
    ) -> Arc<Self> {
        let jdwp_config = config.jdwp.clone();
        let session = ReferenceCountedResource::new(move || {
            let device = device.clone();
            let jdwp_config = jdwp_config.clone();
            async move {
                let transport = device
                    .open_jdwp(pid)
                    .await
                    .map_err(|err| JdwpError::Transport(err.to_string()))?;
                tracing::debug!(target: "ddmux.process", pid, "opened JDWP session");
                Ok(SharedJdwpSession::new(JdwpSession::new(transport, jdwp_config)))
            }
        });

        Arc::new(Self {
            pid,
            scope: parent.child_token(),
            session,
            properties: ProcessPropertiesCell::new(pid),
            collector_config: config.collector.clone(),
            collection_started: AtomicBool::new(false),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn scope(&self) -> &CancellationToken {
        &self.scope
    }

    pub fn is_destroyed(&self) -> bool {
        self.scope.is_cancelled()
    }

    pub fn properties(&self) -> ProcessProperties {
        self.properties.get()
    }

    pub fn subscribe_properties(&self) -> watch::Receiver<ProcessProperties> {
        self.properties.subscribe()
    }

    /// Shares this process's JDWP session, opening it if nobody holds it.
    pub async fn retain_session(&self) -> Result<Retained<SharedJdwpSession>, JdwpError> {
        if self.is_destroyed() {
            return Err(JdwpError::Closed);
        }
        self.session.retain().await
    }

    /// Number of live session retainers.
    pub fn session_retainers(&self) -> usize {
        self.session.ref_count()
    }

    /// Spawns property collection in this handle's scope. Returns `None` if
    /// collection was already started.
    ///
    /// When the VM drops the session mid-collection the collector is run
    /// again on a fresh session, up to the configured number of attempts;
    /// the last failure lands in [`ProcessProperties::last_error`].
    pub fn start_properties_collection(
        self: &Arc<Self>,
        codec: Arc<dyn DdmsChunkCodec>,
    ) -> Option<JoinHandle<()>> {
        if self.collection_started.swap(true, Ordering::AcqRel) {
            return None;
        }
        let handle = self.clone();
        Some(tokio::spawn(async move {
            handle.collect_properties(codec).await;
        }))
    }

    async fn collect_properties(&self, codec: Arc<dyn DdmsChunkCodec>) {
        let pid = self.pid;
        let max_attempts = self.collector_config.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let retained = tokio::select! {
                biased;
                _ = self.scope.cancelled() => return,
                retained = self.retain_session() => retained,
            };
            match retained {
                Ok(session) => {
                    let mut collector = ProcessPropertiesCollector::new(
                        SharedJdwpSession::clone(&session),
                        codec.clone(),
                        self.properties.clone(),
                    );
                    let result = collector.collect(&self.scope).await;
                    session.release().await;
                    match result {
                        Ok(()) | Err(CollectorError::Cancelled) => return,
                        Err(err) if err.is_retryable() => {
                            tracing::debug!(
                                target: "ddmux.process",
                                pid,
                                attempt,
                                error = %err,
                                "property collection interrupted"
                            );
                            self.record_error(&err);
                        }
                        Err(err) => {
                            tracing::warn!(
                                target: "ddmux.process",
                                pid,
                                error = %err,
                                "property collection failed"
                            );
                            self.record_error(&err);
                            return;
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        target: "ddmux.process",
                        pid,
                        attempt,
                        error = %err,
                        "cannot open JDWP session"
                    );
                    self.record_error(&err);
                }
            }

            if attempt < max_attempts {
                tokio::select! {
                    biased;
                    _ = self.scope.cancelled() => return,
                    _ = tokio::time::sleep(self.collector_config.retry_delay()) => {}
                }
            }
        }
        tracing::warn!(
            target: "ddmux.process",
            pid,
            attempts = max_attempts,
            "giving up on property collection"
        );
    }

    fn record_error(&self, err: &dyn fmt::Display) {
        let message = err.to_string();
        self.properties.update(|props| props.with_last_error(message));
    }

    /// Cancels the scope and closes the session. Idempotent.
    pub async fn destroy(&self) {
        if !self.scope.is_cancelled() {
            tracing::debug!(target: "ddmux.process", pid = self.pid, "destroying process handle");
        }
        self.scope.cancel();
        self.session.close().await;
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("destroyed", &self.is_destroyed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDdmsCodec, ScriptedDevice, VmScript};
    use ddmux_jdwp::mock::{mock_connection, CloseCounter, CountingTransport};
    use ddmux_jdwp::PacketTransport;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    const STEP: Duration = Duration::from_secs(5);

    fn fast_config(max_attempts: u32) -> DdmuxConfig {
        let mut config = DdmuxConfig::default();
        config.collector.retry_delay_ms = 1;
        config.collector.max_attempts = max_attempts;
        config
    }

    #[tokio::test]
    async fn session_is_shared_and_closed_by_last_release() {
        let closes = Arc::new(Mutex::new(Vec::<CloseCounter>::new()));
        let device = {
            let closes = closes.clone();
            ScriptedDevice::new("emulator-5554").with_jdwp(move |_pid| {
                let (transport, _peer) = mock_connection();
                let counting = CountingTransport::new(transport);
                closes.lock().push(counting.close_count());
                Ok(Arc::new(counting) as Arc<dyn PacketTransport>)
            })
        };
        let handle = ProcessHandle::new(
            100,
            Arc::new(device),
            &CancellationToken::new(),
            &DdmuxConfig::default(),
        );

        let a = handle.retain_session().await.unwrap();
        let b = handle.retain_session().await.unwrap();
        assert_eq!(handle.session_retainers(), 2);
        assert_eq!(closes.lock().len(), 1);

        a.release().await;
        assert_eq!(closes.lock()[0].get(), 0);
        b.release().await;
        assert_eq!(closes.lock()[0].get(), 1);

        // A later retain opens a fresh channel.
        handle.retain_session().await.unwrap().release().await;
        assert_eq!(closes.lock().len(), 2);
    }

    #[tokio::test]
    async fn destroy_closes_session_and_refuses_new_retains() {
        let device = ScriptedDevice::new("emulator-5554").with_jdwp(|_pid| {
            let (transport, _peer) = mock_connection();
            Ok(Arc::new(transport) as Arc<dyn PacketTransport>)
        });
        let parent = CancellationToken::new();
        let handle = ProcessHandle::new(7, Arc::new(device), &parent, &DdmuxConfig::default());

        let session = handle.retain_session().await.unwrap();
        handle.destroy().await;
        assert!(session.is_closed());
        assert!(handle.is_destroyed());
        assert!(!parent.is_cancelled());
        assert!(matches!(handle.retain_session().await, Err(JdwpError::Closed)));
        session.release().await;
    }

    #[tokio::test]
    async fn parent_scope_cancels_handle_scope() {
        let parent = CancellationToken::new();
        let device = Arc::new(ScriptedDevice::new("emulator-5554"));
        let a = ProcessHandle::new(1, device.clone(), &parent, &DdmuxConfig::default());
        let b = ProcessHandle::new(2, device, &parent, &DdmuxConfig::default());

        a.destroy().await;
        assert!(!b.is_destroyed());
        parent.cancel();
        assert!(b.is_destroyed());
    }

    #[tokio::test]
    async fn collection_retries_on_fresh_sessions_and_records_last_error() {
        let device = ScriptedDevice::new("emulator-5554")
            .with_vm(|pid| VmScript::app(pid, "com.example.app").close_when_done());
        let opened = device.jdwp_open_count();
        let handle = ProcessHandle::new(
            321,
            Arc::new(device),
            &CancellationToken::new(),
            &fast_config(3),
        );

        let task = handle
            .start_properties_collection(Arc::new(MockDdmsCodec))
            .unwrap();
        assert!(handle
            .start_properties_collection(Arc::new(MockDdmsCodec))
            .is_none());
        tokio::time::timeout(STEP, task).await.unwrap().unwrap();

        assert_eq!(opened.get(), 3);
        let props = handle.properties();
        assert_eq!(props.process_name.as_deref(), Some("com.example.app"));
        assert_eq!(
            props.last_error.as_deref(),
            Some("JDWP session ended before property collection was released")
        );
        assert_eq!(handle.session_retainers(), 0);
    }

    #[tokio::test]
    async fn open_failures_are_retried_then_recorded() {
        let device = ScriptedDevice::new("emulator-5554");
        let opened = device.jdwp_open_count();
        let handle = ProcessHandle::new(
            9,
            Arc::new(device),
            &CancellationToken::new(),
            &fast_config(2),
        );

        let task = handle
            .start_properties_collection(Arc::new(MockDdmsCodec))
            .unwrap();
        tokio::time::timeout(STEP, task).await.unwrap().unwrap();

        assert_eq!(opened.get(), 2);
        let error = handle.properties().last_error.unwrap_or_default();
        assert!(error.contains("pid 9"), "{error}");
    }

    #[tokio::test]
    async fn destroy_stops_running_collection() {
        let device = ScriptedDevice::new("emulator-5554")
            .with_vm(|pid| VmScript::app(pid, "com.example.app"));
        let handle = ProcessHandle::new(
            44,
            Arc::new(device),
            &CancellationToken::new(),
            &fast_config(5),
        );

        let mut updates = handle.subscribe_properties();
        let task = handle
            .start_properties_collection(Arc::new(MockDdmsCodec))
            .unwrap();
        tokio::time::timeout(STEP, updates.wait_for(|p| p.process_name.is_some()))
            .await
            .unwrap()
            .unwrap();

        handle.destroy().await;
        tokio::time::timeout(STEP, task).await.unwrap().unwrap();
        assert_eq!(handle.session_retainers(), 0);
        assert_eq!(handle.properties().last_error, None);
    }
}
