//! Serial text console bridge.
//!
//! Talks a line protocol to a gateway radio running a text console:
//!
//! ```text
//! radio -> relay   MYINFO:<node>
//! radio -> relay   FROM:<node> TO:<node> CH:<n> [SNR:<f>] [RSSI:<i>] [HOP:<n>] MSG:<text>
//! relay -> radio   WHOAMI
//! relay -> radio   TO:<node> HOP:<n> CH:<n> MSG:<text>
//! relay -> radio   SETNAME:<alias>
//! ```
//!
//! Node ids may be decimal, `0x` hex or `!hex`. The same module also bridges the companion
//! serial port onto an in-memory duplex stream so the companion channel can treat it like
//! any other async reader/writer.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Result};
use log::{debug, info, trace, warn};
use serialport::SerialPort;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use super::{MeshPacket, MeshTransport, PacketSender, TransportError};
use crate::logutil::escape_log;
use crate::mail::{NodeId, BROADCAST_NODE};
use crate::validation::parse_node_id_str;

pub type SharedPort = Arc<Mutex<Box<dyn SerialPort>>>;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Open a serial port with the settings USB serial radios expect and wake the device.
pub async fn open_shared_port(port_name: &str, baud_rate: u32) -> Result<SharedPort> {
    debug!("Opening serial port {} at {} baud", port_name, baud_rate);

    let mut builder = serialport::new(port_name, baud_rate).timeout(Duration::from_millis(500));
    #[cfg(unix)]
    {
        builder = builder
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None);
    }
    let mut port = builder
        .open()
        .map_err(|e| anyhow!("Failed to open serial port {}: {}", port_name, e))?;

    // Toggle DTR/RTS to reset/ensure device wakes
    let _ = port.write_data_terminal_ready(true);
    let _ = port.write_request_to_send(true);
    sleep(Duration::from_millis(150)).await;

    // Drop whatever boot chatter is already buffered
    let _ = port.clear(serialport::ClearBuffer::Input);

    info!("Serial port {} ready", port_name);
    Ok(Arc::new(Mutex::new(port)))
}

fn lock_port(port: &SharedPort) -> MutexGuard<'_, Box<dyn SerialPort>> {
    port.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Drain whatever bytes the port has buffered without blocking.
fn read_available(port: &SharedPort) -> std::io::Result<Vec<u8>> {
    let mut guard = lock_port(port);
    let available = guard.bytes_to_read().map_err(std::io::Error::from)? as usize;
    if available == 0 {
        return Ok(Vec::new());
    }
    let mut buf = vec![0u8; available];
    let n = guard.read(&mut buf)?;
    buf.truncate(n);
    Ok(buf)
}

/// Longest console line kept while waiting for its newline.
const MAX_LINE_BYTES: usize = 4096;

/// Raw console bytes split into lines. Text is decoded only once a whole line is in, so a
/// character spread over two reads survives intact.
#[derive(Debug, Default)]
struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        if self.buf.len() > MAX_LINE_BYTES {
            warn!("Dropping {} console bytes without a line break", self.buf.len());
            self.buf.clear();
        }
        lines
    }
}

/// Parsed radio console line.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleEvent {
    MyInfo(NodeId),
    Packet(MeshPacket),
}

pub fn parse_console_line(line: &str) -> Option<ConsoleEvent> {
    let line = line.trim_end_matches(['\r', '\n']);
    if let Some(rest) = line.trim().strip_prefix("MYINFO:") {
        return parse_node_id_str(rest).ok().map(ConsoleEvent::MyInfo);
    }
    if !line.starts_with("FROM:") {
        return None;
    }
    let msg_at = line.find(" MSG:")?;
    let text = &line[msg_at + " MSG:".len()..];
    let mut packet = MeshPacket {
        from: 0,
        to: BROADCAST_NODE,
        channel: 0,
        text: text.to_string(),
        rx_snr: None,
        rx_rssi: None,
        hop_limit: None,
    };
    let mut have_from = false;
    for token in line[..msg_at].split_whitespace() {
        let (key, value) = token.split_once(':')?;
        match key {
            "FROM" => {
                packet.from = parse_node_id_str(value).ok()?;
                have_from = true;
            }
            "TO" => packet.to = parse_node_id_str(value).ok()?,
            "CH" => packet.channel = value.parse().ok()?,
            "SNR" => packet.rx_snr = value.parse().ok(),
            "RSSI" => packet.rx_rssi = value.parse().ok(),
            "HOP" => packet.hop_limit = value.parse().ok(),
            _ => {}
        }
    }
    have_from.then_some(ConsoleEvent::Packet(packet))
}

/// Gateway radio reached over a serial text console.
pub struct SerialRadio {
    port: SharedPort,
    local: Mutex<Option<NodeId>>,
}

impl SerialRadio {
    pub fn new(port: SharedPort) -> Arc<Self> {
        Arc::new(Self {
            port,
            local: Mutex::new(None),
        })
    }

    fn write_line(&self, line: &str) -> Result<(), TransportError> {
        let mut guard = lock_port(&self.port);
        guard.write_all(line.as_bytes())?;
        guard.write_all(b"\n")?;
        guard.flush()?;
        trace!("radio <- {}", escape_log(line));
        Ok(())
    }

    fn set_local(&self, id: NodeId) {
        if let Ok(mut local) = self.local.lock() {
            *local = Some(id);
        }
    }

    /// Poll the console and push decoded packets until shutdown or until the relay stops
    /// listening.
    pub fn spawn_reader(self: &Arc<Self>, packets: PacketSender, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let radio = Arc::clone(self);
        tokio::spawn(async move {
            info!("Starting radio reader task");
            let mut interval = tokio::time::interval(POLL_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut lines = LineBuffer::default();
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        info!("Radio reader received shutdown signal");
                        break;
                    }
                    _ = interval.tick() => {
                        let bytes = match read_available(&radio.port) {
                            Ok(bytes) => bytes,
                            Err(e) => {
                                warn!("Radio read error: {} - continuing", e);
                                sleep(Duration::from_millis(100)).await;
                                continue;
                            }
                        };
                        if bytes.is_empty() {
                            continue;
                        }
                        for line in lines.push(&bytes) {
                            trace!("radio -> {}", escape_log(line.trim_end()));
                            match parse_console_line(&line) {
                                Some(ConsoleEvent::MyInfo(id)) => radio.set_local(id),
                                Some(ConsoleEvent::Packet(packet)) => {
                                    if packets.send(packet).is_err() {
                                        debug!("Packet receiver gone, stopping radio reader");
                                        return;
                                    }
                                }
                                None => {}
                            }
                        }
                    }
                }
            }
        })
    }
}

impl MeshTransport for SerialRadio {
    fn local_node_id(&self) -> Option<NodeId> {
        self.local.lock().ok().and_then(|local| *local)
    }

    fn request_identity(&self) -> Result<(), TransportError> {
        self.write_line("WHOAMI")
    }

    fn send_text(&self, dest: NodeId, text: &str, hop_limit: u8, channel: u8) -> Result<(), TransportError> {
        if text.contains('\n') {
            return Err(TransportError::SendFailed("payload contains a newline".to_string()));
        }
        self.write_line(&format!("TO:{} HOP:{} CH:{} MSG:{}", dest, hop_limit, channel, text))
    }

    fn set_short_name(&self, alias: &str) -> Result<(), TransportError> {
        self.write_line(&format!("SETNAME:{}", alias))
    }
}

/// Bridge a companion serial port onto a duplex stream. Returns the relay's end; the
/// bridge task ends on shutdown or when the relay's end is dropped.
pub fn bridge_companion_port(port: SharedPort, mut shutdown: watch::Receiver<bool>) -> (DuplexStream, JoinHandle<()>) {
    let (relay_end, mut bridge_end) = tokio::io::duplex(4096);
    let handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(POLL_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut outbound = [0u8; 1024];
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                read = bridge_end.read(&mut outbound) => {
                    match read {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let mut guard = lock_port(&port);
                            if let Err(e) = guard.write_all(&outbound[..n]).and_then(|_| guard.flush()) {
                                warn!("Companion serial write failed: {}", e);
                            }
                        }
                    }
                }
                _ = interval.tick() => {
                    match read_available(&port) {
                        Ok(bytes) if !bytes.is_empty() => {
                            if bridge_end.write_all(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!("Companion serial read error: {}", e);
                            sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }
        debug!("Companion serial bridge stopped");
    });
    (relay_end, handle)
}
