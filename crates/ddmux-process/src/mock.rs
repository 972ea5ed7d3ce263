//! Test doubles for DDMS property collection and process tracking.
//!
//! - [`MockDdmsCodec`]: a reference [`DdmsChunkCodec`] using the Android
//!   DDMS payload layouts.
//! - [`MockDdmsVm`]: plays a VM over a [`MockJdwpPeer`] following a
//!   [`VmScript`].
//! - [`ScriptedDevice`]: a [`DeviceProcessSource`] with scripted process-id
//!   subscriptions and in-memory JDWP channels.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use ddmux_jdwp::mock::{mock_connection, MockJdwpPeer};
use ddmux_jdwp::{JdwpPacket, JdwpReader, JdwpWriter, PacketIdGenerator, PacketTransport};
use futures::future::BoxFuture;
use futures::stream::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::ddms::{
    is_ddms_command, ApnmChunk, ChunkType, DdmsChunk, DdmsChunkCodec, DdmsError, HeloChunk,
    WaitChunk,
};
use crate::device::{DeviceError, DeviceProcessSource, ProcessIdList, ProcessIdStream};

static VM_PACKET_IDS: PacketIdGenerator = PacketIdGenerator::starting_at(0x4000_0000);

#[derive(Clone, Copy, Debug, Default)]
pub struct MockDdmsCodec;

impl MockDdmsCodec {
    pub fn encode_helo(helo: &HeloChunk) -> Vec<u8> {
        let mut w = JdwpWriter::new();
        w.write_u32(helo.protocol_version);
        w.write_u32(helo.pid);
        w.write_u32(helo.vm_identifier.encode_utf16().count() as u32);
        w.write_u32(helo.process_name.encode_utf16().count() as u32);
        w.write_utf16(&helo.vm_identifier);
        w.write_utf16(&helo.process_name);
        // Trailing fields are optional, but each one requires the previous.
        w.write_i32(helo.user_id.unwrap_or(0));
        w.write_utf16_with_len(helo.abi.as_deref().unwrap_or(""));
        w.write_utf16_with_len(helo.jvm_flags.as_deref().unwrap_or(""));
        w.write_bool(helo.is_native_debuggable.unwrap_or(false));
        if let Some(package_name) = &helo.package_name {
            w.write_utf16_with_len(package_name);
        }
        w.into_vec()
    }

    pub fn encode_feat(features: &[String]) -> Vec<u8> {
        let mut w = JdwpWriter::new();
        w.write_u32(features.len() as u32);
        for feature in features {
            w.write_utf16_with_len(feature);
        }
        w.into_vec()
    }

    pub fn encode_apnm(apnm: &ApnmChunk) -> Vec<u8> {
        let mut w = JdwpWriter::new();
        w.write_utf16_with_len(&apnm.process_name);
        w.write_i32(apnm.user_id.unwrap_or(0));
        if let Some(package_name) = &apnm.package_name {
            w.write_utf16_with_len(package_name);
        }
        w.into_vec()
    }

    /// A VM-originated WAIT command packet.
    pub fn wait_command(reason: u8) -> JdwpPacket {
        DdmsChunk::new(ChunkType::WAIT, vec![reason]).into_command(VM_PACKET_IDS.next_id())
    }

    /// A VM-originated APNM command packet.
    pub fn apnm_command(process_name: &str, user_id: i32, package_name: Option<&str>) -> JdwpPacket {
        let apnm = ApnmChunk {
            process_name: process_name.to_string(),
            user_id: Some(user_id),
            package_name: package_name.map(str::to_string),
        };
        DdmsChunk::new(ChunkType::APNM, Self::encode_apnm(&apnm)).into_command(VM_PACKET_IDS.next_id())
    }
}

fn malformed(chunk: ChunkType) -> impl Fn(ddmux_jdwp::JdwpError) -> DdmsError {
    move |err| DdmsError::malformed(chunk, err)
}

impl DdmsChunkCodec for MockDdmsCodec {
    fn helo_request(&self, protocol_version: u32) -> DdmsChunk {
        DdmsChunk::new(ChunkType::HELO, protocol_version.to_be_bytes().to_vec())
    }

    fn feat_request(&self) -> DdmsChunk {
        DdmsChunk::new(ChunkType::FEAT, Vec::new())
    }

    fn reaq_request(&self) -> DdmsChunk {
        DdmsChunk::new(ChunkType::REAQ, Vec::new())
    }

    fn decode_helo(&self, payload: &[u8]) -> Result<HeloChunk, DdmsError> {
        let err = malformed(ChunkType::HELO);
        let mut r = JdwpReader::new(payload);
        let protocol_version = r.read_u32().map_err(&err)?;
        let pid = r.read_u32().map_err(&err)?;
        let vm_len = r.read_u32().map_err(&err)? as usize;
        let name_len = r.read_u32().map_err(&err)? as usize;
        let mut helo = HeloChunk {
            protocol_version,
            pid,
            vm_identifier: r.read_utf16(vm_len).map_err(&err)?,
            process_name: r.read_utf16(name_len).map_err(&err)?,
            ..HeloChunk::default()
        };
        if r.remaining() >= 4 {
            helo.user_id = Some(r.read_i32().map_err(&err)?);
        }
        if r.remaining() >= 4 {
            helo.abi = Some(r.read_utf16_with_len().map_err(&err)?);
        }
        if r.remaining() >= 4 {
            helo.jvm_flags = Some(r.read_utf16_with_len().map_err(&err)?);
        }
        if r.remaining() >= 1 {
            helo.is_native_debuggable = Some(r.read_bool().map_err(&err)?);
        }
        if r.remaining() >= 4 {
            helo.package_name = Some(r.read_utf16_with_len().map_err(&err)?);
        }
        Ok(helo)
    }

    fn decode_feat(&self, payload: &[u8]) -> Result<Vec<String>, DdmsError> {
        let err = malformed(ChunkType::FEAT);
        let mut r = JdwpReader::new(payload);
        let count = r.read_u32().map_err(&err)?;
        (0..count)
            .map(|_| r.read_utf16_with_len().map_err(&err))
            .collect()
    }

    fn decode_reaq(&self, payload: &[u8]) -> Result<bool, DdmsError> {
        JdwpReader::new(payload)
            .read_bool()
            .map_err(malformed(ChunkType::REAQ))
    }

    fn decode_apnm(&self, payload: &[u8]) -> Result<ApnmChunk, DdmsError> {
        let err = malformed(ChunkType::APNM);
        let mut r = JdwpReader::new(payload);
        let mut apnm = ApnmChunk {
            process_name: r.read_utf16_with_len().map_err(&err)?,
            ..ApnmChunk::default()
        };
        if r.remaining() >= 4 {
            apnm.user_id = Some(r.read_i32().map_err(&err)?);
        }
        if r.remaining() >= 4 {
            apnm.package_name = Some(r.read_utf16_with_len().map_err(&err)?);
        }
        Ok(apnm)
    }

    fn decode_wait(&self, payload: &[u8]) -> Result<WaitChunk, DdmsError> {
        let reason = JdwpReader::new(payload)
            .read_u8()
            .map_err(malformed(ChunkType::WAIT))?;
        Ok(WaitChunk { reason })
    }
}

/// What a [`MockDdmsVm`] answers. `None` replies are sent empty.
#[derive(Clone, Debug, Default)]
pub struct VmScript {
    pub helo: Option<HeloChunk>,
    pub features: Option<Vec<String>>,
    pub reaq: Option<bool>,
    pub raw_feat_reply: Option<Vec<u8>>,
    /// Sent once, after the first REAQ reply.
    pub late_commands: Vec<JdwpPacket>,
    pub respond: bool,
    pub close_when_done: bool,
}

impl VmScript {
    /// A VM answering HELO for an app called `name` in user 0.
    pub fn app(pid: u32, name: &str) -> Self {
        Self {
            helo: Some(HeloChunk {
                protocol_version: 1,
                pid,
                vm_identifier: "ART".to_string(),
                process_name: name.to_string(),
                user_id: Some(0),
                abi: Some("arm64-v8a".to_string()),
                jvm_flags: Some(String::new()),
                is_native_debuggable: Some(false),
                package_name: Some(name.to_string()),
            }),
            respond: true,
            ..Self::default()
        }
    }

    /// A VM that answers every request with an empty reply.
    pub fn silent(_pid: u32) -> Self {
        Self {
            respond: true,
            ..Self::default()
        }
    }

    /// A VM that completes the handshake and then ignores every request.
    pub fn unresponsive(_pid: u32) -> Self {
        Self::default()
    }

    pub fn with_features(mut self, features: &[&str]) -> Self {
        self.features = Some(features.iter().map(|f| f.to_string()).collect());
        self
    }

    pub fn with_reaq(mut self, enabled: bool) -> Self {
        self.reaq = Some(enabled);
        self
    }

    /// Replies to FEAT with `payload` verbatim.
    pub fn with_raw_feat_reply(mut self, payload: Vec<u8>) -> Self {
        self.raw_feat_reply = Some(payload);
        self
    }

    pub fn with_late_command(mut self, packet: JdwpPacket) -> Self {
        self.late_commands.push(packet);
        self
    }

    /// Hang up once the first round of replies and late commands went out.
    pub fn close_when_done(mut self) -> Self {
        self.close_when_done = true;
        self
    }

    pub fn hold_open(mut self) -> Self {
        self.close_when_done = false;
        self
    }

    fn reply_payload(&self, chunk_type: ChunkType) -> Option<Vec<u8>> {
        let payload = match chunk_type {
            ChunkType::HELO => self.helo.as_ref().map(MockDdmsCodec::encode_helo)?,
            ChunkType::FEAT => {
                if let Some(raw) = &self.raw_feat_reply {
                    return Some(raw.clone());
                }
                MockDdmsCodec::encode_feat(self.features.as_ref()?)
            }
            ChunkType::REAQ => vec![u8::from(self.reaq?)],
            _ => return None,
        };
        Some(DdmsChunk::new(chunk_type, payload).encode())
    }
}

pub struct MockDdmsVm {
    peer: MockJdwpPeer,
    script: VmScript,
}

impl MockDdmsVm {
    pub fn new(peer: MockJdwpPeer, script: VmScript) -> Self {
        Self { peer, script }
    }

    /// Serves the connection until the debugger hangs up, or until the
    /// first round is done when the script says so.
    pub async fn run(mut self) -> io::Result<()> {
        self.peer.accept_handshake().await?;
        let mut late_sent = false;

        while let Some(packet) = self.peer.read_packet().await? {
            if !self.script.respond || !is_ddms_command(&packet) {
                continue;
            }
            let chunk = DdmsChunk::from_packet(&packet)
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
            let Some(chunk) = chunk else {
                continue;
            };
            let payload = self.script.reply_payload(chunk.chunk_type).unwrap_or_default();
            self.peer
                .send_packet(&JdwpPacket::reply(packet.id, 0, payload))
                .await?;

            if chunk.chunk_type == ChunkType::REAQ && !late_sent {
                late_sent = true;
                for command in &self.script.late_commands {
                    self.peer.send_packet(command).await?;
                }
                if self.script.close_when_done {
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

type JdwpConnector = Box<dyn Fn(u32) -> Result<Arc<dyn PacketTransport>, DeviceError> + Send + Sync>;

struct Subscription {
    items: Vec<Result<ProcessIdList, DeviceError>>,
    stay_open: bool,
}

/// Counts JDWP channel open attempts on a [`ScriptedDevice`].
#[derive(Clone, Debug, Default)]
pub struct OpenCounter(Arc<AtomicUsize>);

impl OpenCounter {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// A device whose `track-jdwp` subscriptions replay scripted snapshots.
///
/// Each subscription takes the next script; once the scripts run out,
/// subscriptions stay open without yielding anything.
pub struct ScriptedDevice {
    serial: String,
    reachable: AtomicBool,
    scripts: Mutex<VecDeque<Subscription>>,
    subscriptions: watch::Sender<usize>,
    connector: Option<JdwpConnector>,
    opened: OpenCounter,
}

impl ScriptedDevice {
    pub fn new(serial: &str) -> Self {
        Self {
            serial: serial.to_string(),
            reachable: AtomicBool::new(true),
            scripts: Mutex::new(VecDeque::new()),
            subscriptions: watch::channel(0).0,
            connector: None,
            opened: OpenCounter::default(),
        }
    }

    /// A subscription that yields `items` and then ends.
    pub fn with_subscription(self, items: Vec<Result<ProcessIdList, DeviceError>>) -> Self {
        self.scripts.lock().push_back(Subscription {
            items,
            stay_open: false,
        });
        self
    }

    /// A subscription that yields `items` and then stays open.
    pub fn with_open_subscription(self, items: Vec<Result<ProcessIdList, DeviceError>>) -> Self {
        self.scripts.lock().push_back(Subscription {
            items,
            stay_open: true,
        });
        self
    }

    pub fn with_jdwp(
        mut self,
        connector: impl Fn(u32) -> Result<Arc<dyn PacketTransport>, DeviceError> + Send + Sync + 'static,
    ) -> Self {
        self.connector = Some(Box::new(connector));
        self
    }

    /// Every JDWP channel is served by a fresh [`MockDdmsVm`].
    pub fn with_vm(self, script: impl Fn(u32) -> VmScript + Send + Sync + 'static) -> Self {
        self.with_jdwp(move |pid| {
            let (transport, peer) = mock_connection();
            let vm = MockDdmsVm::new(peer, script(pid));
            tokio::spawn(async move {
                if let Err(err) = vm.run().await {
                    tracing::debug!(target: "ddmux.process", pid, error = %err, "mock VM stopped");
                }
            });
            Ok(Arc::new(transport) as Arc<dyn PacketTransport>)
        })
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Number of `track_processes` calls so far.
    pub fn subscriptions(&self) -> watch::Receiver<usize> {
        self.subscriptions.subscribe()
    }

    pub fn jdwp_open_count(&self) -> OpenCounter {
        self.opened.clone()
    }
}

impl DeviceProcessSource for ScriptedDevice {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn track_processes(&self) -> BoxFuture<'_, Result<ProcessIdStream, DeviceError>> {
        Box::pin(async move {
            self.subscriptions.send_modify(|count| *count += 1);
            let next = self.scripts.lock().pop_front();
            let stream = match next {
                Some(Subscription { items, stay_open }) => {
                    let items = futures::stream::iter(items);
                    if stay_open {
                        items.chain(futures::stream::pending()).boxed()
                    } else {
                        items.boxed()
                    }
                }
                None => futures::stream::pending().boxed(),
            };
            Ok(stream)
        })
    }

    fn is_reachable(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move { self.reachable.load(Ordering::SeqCst) })
    }

    fn open_jdwp(&self, pid: u32) -> BoxFuture<'_, Result<Arc<dyn PacketTransport>, DeviceError>> {
        Box::pin(async move {
            self.opened.0.fetch_add(1, Ordering::SeqCst);
            match &self.connector {
                Some(connect) => connect(pid),
                None => Err(DeviceError::OpenJdwp {
                    pid,
                    message: "no JDWP process".to_string(),
                }),
            }
        })
    }
}
