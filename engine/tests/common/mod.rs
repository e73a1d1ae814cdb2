//! In-memory stand-ins for the hardware collaborators, plus a harness
//! that wires them into a resolved configuration.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::bail;
use futures::future::BoxFuture;
use tokio::time::Instant;

use cryofill_engine::alerts::AlertSource;
use cryofill_engine::config::{Action, Config, ConfigFile, InteractiveMode, Overrides};
use cryofill_engine::notify::Notifier;
use cryofill_engine::nps::{ActorReply, ActorTransport, NpsClient, OutletInfo, ScriptInfo};
use cryofill_engine::runner::Drivers;
use cryofill_engine::specs::CryostatProbe;
use cryofill_engine::thermistor::ThermistorReader;

pub const SAFETY_ACTOR: &str = "safety";

/// One command the fake NPS gateway has seen, stamped with the virtual
/// milliseconds since the harness was created.
#[derive(Debug, Clone)]
pub struct SeenCommand {
    pub at_ms: u64,
    pub actor: String,
    pub command: String,
}

#[derive(Default)]
struct OutletTable {
    /// outlet -> (id, on)
    outlets: HashMap<String, (u32, bool)>,
    next_id: u32,
}

impl OutletTable {
    fn entry(&mut self, outlet: &str) -> (u32, bool) {
        if let Some(&entry) = self.outlets.get(outlet) {
            return entry;
        }
        self.next_id += 1;
        let entry = (self.next_id, false);
        self.outlets.insert(outlet.to_string(), entry);
        entry
    }

    fn set(&mut self, outlet: &str, on: bool) {
        let (id, _) = self.entry(outlet);
        self.outlets.insert(outlet.to_string(), (id, on));
    }

    fn set_by_id(&mut self, id: u32, on: bool) {
        let name = self
            .outlets
            .iter()
            .find(|(_, (outlet_id, _))| *outlet_id == id)
            .map(|(name, _)| name.clone());
        if let Some(name) = name {
            self.outlets.insert(name, (id, on));
        }
    }

    fn is_on(&self, outlet: &str) -> bool {
        self.outlets
            .get(outlet)
            .map(|(_, on)| *on)
            .unwrap_or(false)
    }
}

/// Fake actor gateway: tracks outlet state, hands out script thread ids,
/// and records every command with its virtual timestamp.
pub struct MockTransport {
    t0: Instant,
    commands: Mutex<Vec<SeenCommand>>,
    table: Mutex<OutletTable>,
    next_thread: AtomicI64,
    pub fail_commands: AtomicBool,
    pub estop: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            t0: Instant::now(),
            commands: Mutex::new(Vec::new()),
            table: Mutex::new(OutletTable::default()),
            next_thread: AtomicI64::new(100),
            fail_commands: AtomicBool::new(false),
            estop: AtomicBool::new(false),
        }
    }

    pub fn commands(&self) -> Vec<SeenCommand> {
        self.commands.lock().unwrap().clone()
    }

    pub fn outlet_is_on(&self, outlet: &str) -> bool {
        self.table.lock().unwrap().is_on(outlet)
    }

    /// Virtual times (ms) at which a command matching `predicate` was
    /// seen.
    pub fn command_times(&self, predicate: impl Fn(&SeenCommand) -> bool) -> Vec<u64> {
        self.commands()
            .iter()
            .filter(|seen| predicate(seen))
            .map(|seen| seen.at_ms)
            .collect()
    }

    pub fn off_times(&self, outlet: &str) -> Vec<u64> {
        let expected = format!("off {outlet}");
        self.command_times(|seen| seen.command == expected)
    }

    pub fn open_times(&self, outlet: &str) -> Vec<u64> {
        let id = self.table.lock().unwrap().entry(outlet).0;
        let script_prefix = format!("scripts run cycle_with_timeout {id} ");
        let plain = format!("on {outlet}");
        self.command_times(|seen| {
            seen.command.starts_with(&script_prefix) || seen.command == plain
        })
    }
}

impl ActorTransport for MockTransport {
    fn send_command<'a>(
        &'a self,
        actor: &'a str,
        command: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<ActorReply>> {
        Box::pin(async move {
            self.commands.lock().unwrap().push(SeenCommand {
                at_ms: self.t0.elapsed().as_millis() as u64,
                actor: actor.to_string(),
                command: command.to_string(),
            });

            if self.fail_commands.load(Ordering::SeqCst) {
                bail!("transport down");
            }

            let mut reply = ActorReply::default();
            let parts: Vec<&str> = command.split_whitespace().collect();

            match parts.as_slice() {
                ["status"] if actor == SAFETY_ACTOR => {
                    reply.safety_status_labels = Some(if self.estop.load(Ordering::SeqCst) {
                        vec!["E_STOP_LN2".to_string()]
                    } else {
                        Vec::new()
                    });
                }
                ["status", outlet] => {
                    let (id, on) = self.table.lock().unwrap().entry(outlet);
                    reply.outlet_info = Some(OutletInfo { id, state: on });
                }
                ["on", outlet] => {
                    self.table.lock().unwrap().set(outlet, true);
                }
                ["on", "--off-after", _secs, outlet] => {
                    self.table.lock().unwrap().set(outlet, true);
                }
                ["off", outlet] => {
                    self.table.lock().unwrap().set(outlet, false);
                }
                ["scripts", "run", "cycle_with_timeout", id, _secs] => {
                    let id: u32 = id.parse()?;
                    self.table.lock().unwrap().set_by_id(id, true);
                    reply.script = Some(ScriptInfo {
                        thread_id: self.next_thread.fetch_add(1, Ordering::SeqCst),
                    });
                }
                ["scripts", "stop"] | ["scripts", "stop", _] => {}
                _ => bail!("unhandled command {command:?}"),
            }

            Ok(reply)
        })
    }
}

/// Fake thermistor server: channels toggled by the test.
pub struct MockThermistors {
    channels: Mutex<HashMap<String, bool>>,
    pub fail_reads: AtomicBool,
}

impl MockThermistors {
    pub fn new(channels: &[&str]) -> Self {
        Self {
            channels: Mutex::new(
                channels
                    .iter()
                    .map(|name| (name.to_string(), false))
                    .collect(),
            ),
            fail_reads: AtomicBool::new(false),
        }
    }

    pub fn set(&self, channel: &str, active: bool) {
        self.channels
            .lock()
            .unwrap()
            .insert(channel.to_string(), active);
    }
}

impl ThermistorReader for MockThermistors {
    fn read_all(&self) -> BoxFuture<'_, anyhow::Result<HashMap<String, bool>>> {
        Box::pin(async move {
            if self.fail_reads.load(Ordering::SeqCst) {
                bail!("thermistor server down");
            }
            Ok(self.channels.lock().unwrap().clone())
        })
    }
}

/// Fake alert endpoint.
pub struct MockAlerts {
    pub o2: AtomicBool,
    pub estop: AtomicBool,
    pub fail_o2_reads: AtomicBool,
    pub o2_reads: AtomicU32,
}

impl MockAlerts {
    pub fn new() -> Self {
        Self {
            o2: AtomicBool::new(false),
            estop: AtomicBool::new(false),
            fail_o2_reads: AtomicBool::new(false),
            o2_reads: AtomicU32::new(0),
        }
    }
}

impl AlertSource for MockAlerts {
    fn o2_alert(&self) -> BoxFuture<'_, anyhow::Result<bool>> {
        Box::pin(async move {
            self.o2_reads.fetch_add(1, Ordering::SeqCst);
            if self.fail_o2_reads.load(Ordering::SeqCst) {
                bail!("alerts endpoint down");
            }
            Ok(self.o2.load(Ordering::SeqCst))
        })
    }

    fn ln2_estops_active(&self) -> BoxFuture<'_, anyhow::Result<bool>> {
        Box::pin(async move { Ok(self.estop.load(Ordering::SeqCst)) })
    }
}

/// Fake cryostat summary API with nominal cold, evacuated cryostats.
pub struct MockProbe {
    pub pressures: Mutex<HashMap<String, f64>>,
    pub temperatures: Mutex<HashMap<String, f64>>,
}

impl MockProbe {
    pub fn nominal(cameras: &[&str]) -> Self {
        Self {
            pressures: Mutex::new(
                cameras
                    .iter()
                    .map(|camera| (camera.to_string(), 1e-6))
                    .collect(),
            ),
            temperatures: Mutex::new(
                cameras
                    .iter()
                    .map(|camera| (camera.to_string(), -183.0))
                    .collect(),
            ),
        }
    }
}

impl CryostatProbe for MockProbe {
    fn pressures<'a>(
        &'a self,
        cameras: &'a [String],
    ) -> BoxFuture<'a, anyhow::Result<HashMap<String, f64>>> {
        Box::pin(async move {
            let table = self.pressures.lock().unwrap();
            let mut out = HashMap::new();
            for camera in cameras {
                match table.get(camera) {
                    Some(&value) => {
                        out.insert(camera.clone(), value);
                    }
                    None => bail!("no pressure for {camera}"),
                }
            }
            Ok(out)
        })
    }

    fn temperatures<'a>(
        &'a self,
        cameras: &'a [String],
    ) -> BoxFuture<'a, anyhow::Result<HashMap<String, f64>>> {
        Box::pin(async move {
            let table = self.temperatures.lock().unwrap();
            let mut out = HashMap::new();
            for camera in cameras {
                match table.get(camera) {
                    Some(&value) => {
                        out.insert(camera.clone(), value);
                    }
                    None => bail!("no temperature for {camera}"),
                }
            }
            Ok(out)
        })
    }
}

/// Config file for a three-camera spectrograph with a shared purge line.
pub fn test_config_file() -> ConfigFile {
    serde_json::from_str(
        r#"{
            "defaults": {
                "cameras": ["r1", "b1", "z1"],
                "min_purge_time": 10.0,
                "max_purge_time": 2000.0,
                "min_fill_time": 5.0,
                "max_fill_time": 600.0,
                "max_pressure": 0.001,
                "max_temperature": -140.0,
                "max_temperature_increase": 0.0
            },
            "profiles": {},
            "valves": {
                "purge": {
                    "actor": "nps.sp1",
                    "outlet": "purge",
                    "thermistor": { "channel": "supply" }
                },
                "r1": { "actor": "nps.sp1", "outlet": "r1" },
                "b1": { "actor": "nps.sp1", "outlet": "b1" },
                "z1": { "actor": "nps.sp1", "outlet": "z1" }
            },
            "thermistors": {
                "host": "127.0.0.1",
                "port": 1025,
                "channels": {
                    "channel0": "supply",
                    "channel1": "r1",
                    "channel2": "b1",
                    "channel3": "z1"
                }
            },
            "endpoints": {
                "nps_url": "http://127.0.0.1:1",
                "alerts_url": "http://127.0.0.1:1/alerts",
                "api_url": "http://127.0.0.1:1",
                "notify_url": null,
                "safety_actor": "safety"
            }
        }"#,
    )
    .expect("test config is valid")
}

pub struct Harness {
    pub transport: Arc<MockTransport>,
    pub thermistors: Arc<MockThermistors>,
    pub alerts: Arc<MockAlerts>,
    pub probe: Arc<MockProbe>,
    pub config: Config,
}

impl Harness {
    /// Builds a harness for the default three-camera set. `tweak` adjusts
    /// the CLI-level overrides before resolution.
    pub fn new(action: Action, tweak: impl FnOnce(&mut Overrides)) -> Self {
        let mut overrides = Overrides {
            action,
            interactive: Some(InteractiveMode::No),
            lock_path: Some(std::env::temp_dir().join(format!(
                "cryofill-harness-{}.lock",
                rand::random::<u64>()
            ))),
            ..Overrides::default()
        };
        tweak(&mut overrides);

        let config = Config::resolve(overrides, &test_config_file()).expect("config resolves");

        Self {
            transport: Arc::new(MockTransport::new()),
            thermistors: Arc::new(MockThermistors::new(&["supply", "r1", "b1", "z1"])),
            alerts: Arc::new(MockAlerts::new()),
            probe: Arc::new(MockProbe::nominal(&["r1", "b1", "z1"])),
            config,
        }
    }

    pub fn drivers(&self) -> Drivers {
        let transport: Arc<dyn ActorTransport> = self.transport.clone();
        let alerts: Arc<dyn AlertSource> = self.alerts.clone();
        Drivers {
            nps: Arc::new(NpsClient::new(transport, alerts.clone(), self.config.dry_run)),
            reader: self.thermistors.clone(),
            alerts,
            probe: self.probe.clone(),
            notifier: Notifier::disabled(),
        }
    }

    /// Spawns a task that flips `channel` active `delay_secs` after
    /// `outlet` is commanded open.
    pub fn fire_after_open(&self, outlet: &str, channel: &str, delay_secs: f64) {
        let transport = Arc::clone(&self.transport);
        let thermistors = Arc::clone(&self.thermistors);
        let outlet = outlet.to_string();
        let channel = channel.to_string();
        tokio::spawn(async move {
            while !transport.outlet_is_on(&outlet) {
                tokio::time::sleep(std::time::Duration::from_millis(250)).await;
            }
            tokio::time::sleep(std::time::Duration::from_secs_f64(delay_secs)).await;
            thermistors.set(&channel, true);
        });
    }

    /// Spawns a task that asserts the O2 alarm `delay_secs` after
    /// `outlet` is commanded open.
    pub fn o2_alarm_after_open(&self, outlet: &str, delay_secs: f64) {
        let transport = Arc::clone(&self.transport);
        let alerts = Arc::clone(&self.alerts);
        let outlet = outlet.to_string();
        tokio::spawn(async move {
            while !transport.outlet_is_on(&outlet) {
                tokio::time::sleep(std::time::Duration::from_millis(250)).await;
            }
            tokio::time::sleep(std::time::Duration::from_secs_f64(delay_secs)).await;
            alerts.o2.store(true, Ordering::SeqCst);
        });
    }
}
