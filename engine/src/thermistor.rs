//! Thermistor endpoint access and the shared sampling service.
//!
//! The thermistor server speaks a small datagram protocol: the request is
//! `$016\r\n` and the reply `!01<HHHH>\r`, where bit *n* of the 16-bit hex
//! payload is the state of channel *n*. Channel-to-name mapping comes from
//! the configuration.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, bail};
use futures::future::BoxFuture;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::tools::now_ms;

pub const THERMISTOR_REQUEST: &[u8] = b"$016\r\n";
const IO_TIMEOUT: Duration = Duration::from_secs(5);
const SAMPLE_CAPACITY: usize = 4096;

/// One reading of every configured channel. `seq` increases by one per
/// successful read, so consumers can tell a fresh sample from a repeat of
/// the one they already saw.
#[derive(Debug, Clone, PartialEq)]
pub struct ThermistorSample {
    pub seq: u64,
    pub timestamp_ms: i64,
    pub channels: HashMap<String, bool>,
}

/// Bounded history of thermistor readings.
///
/// Appending assigns the sample its sequence number; once the log is
/// full, new readings overwrite the oldest slot in place. Valve watchers
/// only ever consult the newest entry, so nothing is ever popped.
pub struct SampleLog {
    capacity: usize,
    slots: Vec<ThermistorSample>,
    /// Index the next reading will land in.
    write_at: usize,
    /// Total readings ever recorded, including overwritten ones. Doubles
    /// as the sequence-number source.
    recorded: u64,
}

impl SampleLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            slots: Vec::new(),
            write_at: 0,
            recorded: 0,
        }
    }

    /// Records a reading and returns the sequence number it was assigned.
    pub fn append(&mut self, timestamp_ms: i64, channels: HashMap<String, bool>) -> u64 {
        self.recorded += 1;
        let sample = ThermistorSample {
            seq: self.recorded,
            timestamp_ms,
            channels,
        };

        if self.slots.len() < self.capacity {
            self.slots.push(sample);
        } else {
            self.slots[self.write_at] = sample;
        }
        self.write_at = (self.write_at + 1) % self.capacity;

        self.recorded
    }

    /// Newest reading, if any has been recorded yet.
    pub fn latest(&self) -> Option<&ThermistorSample> {
        if self.slots.is_empty() {
            return None;
        }
        let newest = (self.write_at + self.slots.len() - 1) % self.slots.len();
        self.slots.get(newest)
    }

    pub fn recorded(&self) -> u64 {
        self.recorded
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

pub trait ThermistorReader: Send + Sync {
    /// Queries the endpoint once and returns the state of every mapped
    /// channel. Safe to call concurrently.
    fn read_all(&self) -> BoxFuture<'_, anyhow::Result<HashMap<String, bool>>>;
}

/// Parses a `!01<HHHH>\r` reply into the 16-bit channel mask.
pub fn parse_reply(data: &[u8]) -> anyhow::Result<u16> {
    let Some(rest) = data.strip_prefix(b"!01") else {
        bail!("invalid thermistor reply prefix: {data:?}");
    };
    let hex: Vec<u8> = rest
        .iter()
        .copied()
        .take_while(|byte| byte.is_ascii_hexdigit())
        .collect();
    if hex.is_empty() || rest.get(hex.len()) != Some(&b'\r') {
        bail!("malformed thermistor reply: {data:?}");
    }
    let text = std::str::from_utf8(&hex)?;
    let value = u32::from_str_radix(text, 16).context("hex payload")?;
    if value > u16::MAX as u32 {
        bail!("thermistor payload {value:#x} exceeds 16 bits");
    }
    Ok(value as u16)
}

/// Builds the reply datagram for a channel mask. The real server produces
/// these; the engine only needs it for loopback tests and simulators.
pub fn format_reply(mask: u16) -> Vec<u8> {
    format!("!01{mask:04X}\r").into_bytes()
}

/// Expands a channel mask into named channel states.
pub fn decode_channels(mask: u16, mapping: &BTreeMap<u8, String>) -> HashMap<String, bool> {
    mapping
        .iter()
        .map(|(bit, name)| (name.clone(), mask & (1 << bit) != 0))
        .collect()
}

/// Packs named channel states back into a mask. Unmapped names are ignored.
pub fn encode_channels(channels: &HashMap<String, bool>, mapping: &BTreeMap<u8, String>) -> u16 {
    let mut mask = 0u16;
    for (bit, name) in mapping {
        if channels.get(name).copied().unwrap_or(false) {
            mask |= 1 << bit;
        }
    }
    mask
}

/// Reader for the UDP thermistor server.
pub struct UdpThermistorReader {
    addr: String,
    mapping: BTreeMap<u8, String>,
}

impl UdpThermistorReader {
    pub fn new(addr: String, mapping: BTreeMap<u8, String>) -> Self {
        Self { addr, mapping }
    }
}

impl ThermistorReader for UdpThermistorReader {
    fn read_all(&self) -> BoxFuture<'_, anyhow::Result<HashMap<String, bool>>> {
        Box::pin(async move {
            let socket = UdpSocket::bind("0.0.0.0:0")
                .await
                .context("binding UDP socket")?;
            socket
                .connect(&self.addr)
                .await
                .with_context(|| format!("connecting to thermistor server {}", self.addr))?;

            socket
                .send(THERMISTOR_REQUEST)
                .await
                .context("sending thermistor request")?;

            let mut buf = [0u8; 64];
            let len = tokio::time::timeout(IO_TIMEOUT, socket.recv(&mut buf))
                .await
                .map_err(|_| anyhow::anyhow!("thermistor server {} timed out", self.addr))?
                .context("receiving thermistor reply")?;

            let mask = parse_reply(&buf[..len])?;
            Ok(decode_channels(mask, &self.mapping))
        })
    }
}

struct MonitorInner {
    reader: Arc<dyn ThermistorReader>,
    interval: Duration,
    samples: Mutex<SampleLog>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Shared sampling service feeding every valve supervisor.
///
/// One instance exists per run, owned by the orchestrator and handed to
/// supervisors by handle. It polls the reader on a fixed interval,
/// appends samples to a bounded buffer, and swallows individual read
/// errors with a warning; readers always consult the newest sample.
#[derive(Clone)]
pub struct ThermistorMonitor {
    inner: Arc<MonitorInner>,
}

impl ThermistorMonitor {
    pub fn new(reader: Arc<dyn ThermistorReader>, interval: Duration) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                reader,
                interval,
                samples: Mutex::new(SampleLog::new(SAMPLE_CAPACITY)),
                task: Mutex::new(None),
            }),
        }
    }

    /// Starts the sampling task. Idempotent: a running monitor is left
    /// alone.
    pub fn start(&self) {
        let mut slot = self.inner.task.lock().unwrap();
        if let Some(task) = slot.as_ref()
            && !task.is_finished()
        {
            return;
        }

        let inner = Arc::clone(&self.inner);
        *slot = Some(tokio::spawn(async move {
            loop {
                match inner.reader.read_all().await {
                    Ok(channels) => {
                        let mut samples = inner.samples.lock().unwrap();
                        samples.append(now_ms(), channels);
                    }
                    Err(err) => {
                        log::warn!("Error reading thermistors: {err:#}");
                    }
                }

                sleep(inner.interval).await;
            }
        }));
    }

    /// Stops the sampling task. Collected samples stay readable.
    pub fn stop(&self) {
        let mut slot = self.inner.task.lock().unwrap();
        if let Some(task) = slot.take()
            && !task.is_finished()
        {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        let slot = self.inner.task.lock().unwrap();
        slot.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Newest sample, if any has been collected yet.
    pub fn latest(&self) -> Option<ThermistorSample> {
        let samples = self.inner.samples.lock().unwrap();
        samples.latest().cloned()
    }

    /// One-shot read through the underlying endpoint, bypassing the
    /// sampling task. Used by the pre-fill check gate.
    pub async fn read_now(&self) -> anyhow::Result<HashMap<String, bool>> {
        self.inner.reader.read_all().await
    }
}
