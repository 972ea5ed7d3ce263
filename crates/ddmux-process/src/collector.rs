use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ddmux_jdwp::{JdwpError, ReceivedPacket, SharedJdwpSession};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::ddms::{is_ddms_command, ChunkType, DdmsChunk, DdmsChunkCodec, DdmsError, DDMS_PROTOCOL_VERSION};
use crate::properties::ProcessPropertiesCell;

#[derive(Debug, Clone, Error)]
pub enum CollectorError {
    /// The VM closed the JDWP connection while collection was still active.
    /// A fresh session may succeed.
    #[error("JDWP session ended before property collection was released")]
    SessionEndedPrematurely,
    #[error(transparent)]
    Jdwp(#[from] JdwpError),
    #[error("property collection cancelled")]
    Cancelled,
}

impl CollectorError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, CollectorError::SessionEndedPrematurely)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorState {
    Idle,
    SendingIntros,
    AwaitingReplies,
    Terminated(CollectorTermination),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorTermination {
    EndOfStream,
    Error,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Request {
    Helo,
    Feat,
    Reaq,
}

impl Request {
    fn chunk_type(self) -> ChunkType {
        match self {
            Request::Helo => ChunkType::HELO,
            Request::Feat => ChunkType::FEAT,
            Request::Reaq => ChunkType::REAQ,
        }
    }
}

/// Packet ids of the three introspection requests.
#[derive(Debug, Clone, Copy)]
struct RequestIds {
    helo: u32,
    feat: u32,
    reaq: u32,
}

impl RequestIds {
    fn match_reply(&self, id: u32) -> Option<Request> {
        if id == self.helo {
            Some(Request::Helo)
        } else if id == self.feat {
            Some(Request::Feat)
        } else if id == self.reaq {
            Some(Request::Reaq)
        } else {
            None
        }
    }
}

/// Runs one DDMS introspection exchange over a shared session and folds
/// what the VM reports into a [`ProcessPropertiesCell`].
pub struct ProcessPropertiesCollector {
    session: SharedJdwpSession,
    codec: Arc<dyn DdmsChunkCodec>,
    properties: ProcessPropertiesCell,
    state: CollectorState,
}

impl ProcessPropertiesCollector {
    pub fn new(
        session: SharedJdwpSession,
        codec: Arc<dyn DdmsChunkCodec>,
        properties: ProcessPropertiesCell,
    ) -> Self {
        Self {
            session,
            codec,
            properties,
            state: CollectorState::Idle,
        }
    }

    pub fn state(&self) -> CollectorState {
        self.state
    }

    /// Sends HELO, FEAT and REAQ, then applies replies and unsolicited DDMS
    /// commands until `cancel` fires or the session ends.
    ///
    /// There is no "done" message in the protocol, so this only returns with
    /// an error: [`CollectorError::Cancelled`] when the caller is finished,
    /// [`CollectorError::SessionEndedPrematurely`] when the VM hung up first.
    pub async fn collect(&mut self, cancel: &CancellationToken) -> Result<(), CollectorError> {
        let pid = self.properties.get().pid;
        let ids = RequestIds {
            helo: self.session.next_packet_id(),
            feat: self.session.next_packet_id(),
            reaq: self.session.next_packet_id(),
        };

        let ready = Arc::new(AtomicBool::new(false));
        let mut receiver = self
            .session
            .new_packet_receiver()
            .with_name(format!("properties-collector[{pid}]"))
            .on_activation({
                let ready = ready.clone();
                move || ready.store(true, Ordering::Release)
            })
            .activate();
        // Requests go out only once the receiver is listening, so no reply
        // can arrive unobserved.
        debug_assert!(ready.load(Ordering::Acquire));

        self.state = CollectorState::SendingIntros;
        let requests = [
            (ids.helo, self.codec.helo_request(DDMS_PROTOCOL_VERSION)),
            (ids.feat, self.codec.feat_request()),
            (ids.reaq, self.codec.reaq_request()),
        ];
        for (id, chunk) in requests {
            let chunk_type = chunk.chunk_type;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(self.terminate_cancelled()),
                sent = self.session.send_packet(chunk.into_command(id)) => {
                    if let Err(err) = sent {
                        self.state = CollectorState::Terminated(CollectorTermination::Error);
                        return Err(err.into());
                    }
                }
            }
            tracing::trace!(target: "ddmux.process", pid, id, chunk = %chunk_type, "sent DDMS request");
        }

        self.state = CollectorState::AwaitingReplies;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(self.terminate_cancelled()),
                next = receiver.recv() => next,
            };
            match next {
                Ok(Some(packet)) => self.handle_packet(&ids, &packet),
                Ok(None) => {
                    tracing::debug!(target: "ddmux.process", pid, "JDWP session ended during property collection");
                    self.state = CollectorState::Terminated(CollectorTermination::EndOfStream);
                    return Err(CollectorError::SessionEndedPrematurely);
                }
                Err(err) => {
                    self.state = CollectorState::Terminated(CollectorTermination::Error);
                    return Err(err.into());
                }
            }
        }
    }

    fn terminate_cancelled(&mut self) -> CollectorError {
        self.state = CollectorState::Terminated(CollectorTermination::Cancelled);
        CollectorError::Cancelled
    }

    fn handle_packet(&self, ids: &RequestIds, packet: &ReceivedPacket) {
        if packet.is_reply() {
            if let Some(request) = ids.match_reply(packet.id) {
                self.handle_reply(request, packet);
            }
        } else if is_ddms_command(packet) {
            if !packet.is_replay() {
                self.session.add_replay_packet(packet.to_packet());
            }
            self.handle_command(packet);
        }
    }

    fn handle_reply(&self, request: Request, packet: &ReceivedPacket) {
        let pid = self.properties.get().pid;
        if packet.error_code != 0 {
            tracing::debug!(
                target: "ddmux.process",
                pid,
                chunk = %request.chunk_type(),
                error_code = packet.error_code,
                "DDMS request rejected"
            );
            return;
        }
        let chunk = match DdmsChunk::from_packet(packet) {
            Ok(Some(chunk)) => chunk,
            Ok(None) => {
                // Usually another debugger already holds the VM.
                tracing::debug!(
                    target: "ddmux.process",
                    pid,
                    chunk = %request.chunk_type(),
                    "empty DDMS reply"
                );
                return;
            }
            Err(err) => return self.record_decode_error(err),
        };
        if chunk.chunk_type == ChunkType::FAIL {
            tracing::warn!(
                target: "ddmux.process",
                pid,
                chunk = %request.chunk_type(),
                "VM answered DDMS request with FAIL"
            );
            return;
        }

        let applied = match request {
            Request::Helo => self
                .codec
                .decode_helo(&chunk.payload)
                .map(|helo| self.properties.update(|props| props.with_helo(&helo))),
            Request::Feat => self
                .codec
                .decode_feat(&chunk.payload)
                .map(|features| self.properties.update(|props| props.with_features(features))),
            Request::Reaq => self
                .codec
                .decode_reaq(&chunk.payload)
                .map(|enabled| self.properties.update(|props| props.with_reaq_enabled(enabled))),
        };
        match applied {
            Ok(changed) => tracing::trace!(
                target: "ddmux.process",
                pid,
                chunk = %request.chunk_type(),
                changed,
                "applied DDMS reply"
            ),
            Err(err) => self.record_decode_error(err),
        }
    }

    fn handle_command(&self, packet: &ReceivedPacket) {
        let chunk = match DdmsChunk::from_packet(packet) {
            Ok(Some(chunk)) => chunk,
            Ok(None) => return,
            Err(err) => return self.record_decode_error(err),
        };
        let applied = match chunk.chunk_type {
            ChunkType::WAIT => self.codec.decode_wait(&chunk.payload).map(|wait| {
                tracing::debug!(target: "ddmux.process", reason = wait.reason, "VM waiting for debugger");
                self.properties
                    .update(|props| props.with_waiting_for_debugger(true))
            }),
            ChunkType::APNM => self
                .codec
                .decode_apnm(&chunk.payload)
                .map(|apnm| self.properties.update(|props| props.with_apnm(&apnm))),
            other => {
                tracing::trace!(target: "ddmux.process", chunk = %other, "ignoring DDMS command");
                return;
            }
        };
        if let Err(err) = applied {
            self.record_decode_error(err);
        }
    }

    fn record_decode_error(&self, err: DdmsError) {
        tracing::warn!(target: "ddmux.process", error = %err, "failed to decode DDMS chunk");
        self.properties
            .update(|props| props.with_last_error(err.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDdmsCodec, MockDdmsVm, VmScript};
    use crate::properties::ProcessProperties;
    use ddmux_config::JdwpConfig;
    use ddmux_jdwp::mock::mock_connection;
    use ddmux_jdwp::JdwpSession;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    const STEP: Duration = Duration::from_secs(5);

    fn shared_with_vm(script: VmScript) -> (SharedJdwpSession, tokio::task::JoinHandle<()>) {
        let (transport, peer) = mock_connection();
        let session = SharedJdwpSession::new(JdwpSession::new(
            Arc::new(transport),
            JdwpConfig::default(),
        ));
        let vm = tokio::spawn(async move {
            MockDdmsVm::new(peer, script).run().await.unwrap();
        });
        (session, vm)
    }

    fn collector(session: &SharedJdwpSession, pid: u32) -> ProcessPropertiesCollector {
        ProcessPropertiesCollector::new(
            session.clone(),
            Arc::new(MockDdmsCodec),
            ProcessPropertiesCell::new(pid),
        )
    }

    #[tokio::test]
    async fn full_exchange_populates_properties() {
        let script = VmScript::app(1234, "com.example.app")
            .with_features(&["hprof-heap-dump", "method-trace-profiling"])
            .with_reaq(true)
            .close_when_done();
        let (session, vm) = shared_with_vm(script);
        let mut collector = collector(&session, 1234);
        let properties = collector.properties.clone();

        let err = tokio::time::timeout(STEP, collector.collect(&CancellationToken::new()))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, CollectorError::SessionEndedPrematurely), "{err:?}");
        assert!(err.is_retryable());
        assert_eq!(
            collector.state(),
            CollectorState::Terminated(CollectorTermination::EndOfStream)
        );
        vm.await.unwrap();

        let props = properties.get();
        assert_eq!(props.process_name.as_deref(), Some("com.example.app"));
        assert_eq!(props.package_name.as_deref(), Some("com.example.app"));
        assert_eq!(props.user_id, Some(0));
        assert_eq!(props.vm_identifier.as_deref(), Some("ART"));
        assert_eq!(props.abi.as_deref(), Some("arm64-v8a"));
        assert_eq!(
            props.features,
            vec!["hprof-heap-dump".to_string(), "method-trace-profiling".to_string()]
        );
        assert!(props.reaq_enabled);
        assert!(!props.is_waiting_for_debugger);
        assert_eq!(props.last_error, None);
    }

    #[tokio::test]
    async fn empty_replies_leave_fields_unset() {
        let script = VmScript::silent(77).close_when_done();
        let (session, vm) = shared_with_vm(script);
        let mut collector = collector(&session, 77);
        let properties = collector.properties.clone();

        let err = tokio::time::timeout(STEP, collector.collect(&CancellationToken::new()))
            .await
            .unwrap()
            .unwrap_err();
        assert!(err.is_retryable());
        vm.await.unwrap();
        assert_eq!(properties.get(), ProcessProperties::new(77));
    }

    #[tokio::test]
    async fn early_name_then_apnm_and_wait() {
        let script = VmScript::app(55, "<pre-initialized>")
            .with_late_command(MockDdmsCodec::wait_command(0))
            .with_late_command(MockDdmsCodec::apnm_command("com.example.late", 10, Some("com.example")))
            .close_when_done();
        let (session, vm) = shared_with_vm(script);
        let mut collector = collector(&session, 55);
        let mut updates = collector.properties.subscribe();

        let err = tokio::time::timeout(STEP, collector.collect(&CancellationToken::new()))
            .await
            .unwrap()
            .unwrap_err();
        assert!(err.is_retryable());
        vm.await.unwrap();

        let props = updates.borrow_and_update().clone();
        assert_eq!(props.process_name.as_deref(), Some("com.example.late"));
        assert_eq!(props.package_name.as_deref(), Some("com.example"));
        assert_eq!(props.user_id, Some(10));
        assert!(props.is_waiting_for_debugger);
        // Both unsolicited commands were kept for later subscribers.
        assert_eq!(session.replay_len(), 2);
    }

    #[tokio::test]
    async fn replayed_commands_reach_a_second_collector() {
        let script = VmScript::app(9, "<pre-initialized>")
            .with_late_command(MockDdmsCodec::apnm_command("com.example.replayed", 0, None))
            .hold_open();
        let (session, _vm) = shared_with_vm(script);

        let first_cancel = CancellationToken::new();
        let mut first = collector(&session, 9);
        let mut first_updates = first.properties.subscribe();
        let first_task = {
            let cancel = first_cancel.clone();
            tokio::spawn(async move { first.collect(&cancel).await })
        };
        tokio::time::timeout(
            STEP,
            first_updates.wait_for(|p| p.process_name.as_deref() == Some("com.example.replayed")),
        )
        .await
        .unwrap()
        .unwrap();
        first_cancel.cancel();
        let err = first_task.await.unwrap().unwrap_err();
        assert!(matches!(err, CollectorError::Cancelled));
        assert_eq!(session.replay_len(), 1);

        // The second collector never saw APNM live; it gets it from the replay buffer.
        let second_cancel = CancellationToken::new();
        let mut second = collector(&session, 9);
        let mut second_updates = second.properties.subscribe();
        let second_task = {
            let cancel = second_cancel.clone();
            tokio::spawn(async move { second.collect(&cancel).await })
        };
        tokio::time::timeout(
            STEP,
            second_updates.wait_for(|p| p.process_name.as_deref() == Some("com.example.replayed")),
        )
        .await
        .unwrap()
        .unwrap();
        second_cancel.cancel();
        assert!(matches!(
            second_task.await.unwrap(),
            Err(CollectorError::Cancelled)
        ));
        // Replayed packets are not recorded twice.
        assert_eq!(session.replay_len(), 1);
    }

    #[tokio::test]
    async fn malformed_reply_is_recorded_as_last_error() {
        let script = VmScript::app(3, "com.example.app")
            .with_raw_feat_reply(DdmsChunk::new(ChunkType::FEAT, vec![0, 0, 0, 5]).encode())
            .close_when_done();
        let (session, vm) = shared_with_vm(script);
        let mut collector = collector(&session, 3);
        let properties = collector.properties.clone();

        let _ = tokio::time::timeout(STEP, collector.collect(&CancellationToken::new()))
            .await
            .unwrap();
        vm.await.unwrap();

        let props = properties.get();
        assert_eq!(props.process_name.as_deref(), Some("com.example.app"));
        assert!(props.features.is_empty());
        let error = props.last_error.unwrap_or_default();
        assert!(error.contains("FEAT"), "{error}");
    }

    #[tokio::test]
    async fn cancellation_before_replies_stops_collection() {
        let (session, _vm) = shared_with_vm(VmScript::unresponsive(5));
        let mut collector = collector(&session, 5);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = collector.collect(&cancel).await.unwrap_err();
        assert!(matches!(err, CollectorError::Cancelled));
        assert_eq!(
            collector.state(),
            CollectorState::Terminated(CollectorTermination::Cancelled)
        );
        assert!(!session.is_closed());
    }
}
