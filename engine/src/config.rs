//! Run configuration.
//!
//! Options resolve in three layers: built-in defaults (embedded JSON), an
//! optional operator config file (`--config` or `CRYOFILL_CONFIG_FILE`),
//! and CLI flags, which always win. Profiles are named bundles of defaults
//! from the config file applied below explicit flags.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow, bail};
use serde::{Deserialize, Serialize};

use crate::tools::{is_container, now_ms};

const BUILTIN_CONFIG: &str = include_str!("default_config.json");

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    #[default]
    PurgeAndFill,
    Purge,
    Fill,
    /// Purge-and-fill with the `auto-fill` profile applied.
    AutoFill,
    /// Close every valve and release the lock.
    Abort,
    ClearLock,
    CloseValves,
    ListProfiles,
    /// Run the operational HTTP server.
    Serve,
}

impl Action {
    pub fn includes_purge(self) -> bool {
        matches!(self, Self::PurgeAndFill | Self::Purge | Self::AutoFill)
    }

    pub fn includes_fill(self) -> bool {
        matches!(self, Self::PurgeAndFill | Self::Fill | Self::AutoFill)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PurgeAndFill => "purge-and-fill",
            Self::Purge => "purge",
            Self::Fill => "fill",
            Self::AutoFill => "auto-fill",
            Self::Abort => "abort",
            Self::ClearLock => "clear-lock",
            Self::CloseValves => "close-valves",
            Self::ListProfiles => "list-profiles",
            Self::Serve => "serve",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum InteractiveMode {
    Auto,
    Yes,
    No,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    #[default]
    Error,
}

fn default_monitoring_interval() -> f64 {
    1.0
}

fn default_required_active_time() -> f64 {
    10.0
}

fn default_true() -> bool {
    true
}

fn default_thermistor() -> Option<ThermistorConfig> {
    Some(ThermistorConfig::default())
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Thermistor section of a valve descriptor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThermistorConfig {
    /// Channel name on the thermistor server. Defaults to the outlet name.
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default = "default_monitoring_interval")]
    pub monitoring_interval: f64,
    /// Continuous active seconds required before the reading is trusted.
    #[serde(default = "default_required_active_time")]
    pub required_active_time: f64,
    #[serde(default = "default_true")]
    pub close_on_active: bool,
    #[serde(default)]
    pub disabled: bool,
}

impl Default for ThermistorConfig {
    fn default() -> Self {
        Self {
            channel: None,
            monitoring_interval: default_monitoring_interval(),
            required_active_time: default_required_active_time(),
            close_on_active: true,
            disabled: false,
        }
    }
}

/// Static descriptor for one valve. A valve carries a thermistor section
/// by default; `"thermistor": null` opts a valve out of monitoring.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValveConfig {
    pub actor: String,
    pub outlet: String,
    #[serde(default = "default_thermistor")]
    pub thermistor: Option<ThermistorConfig>,
}

impl ValveConfig {
    /// Fills in derived fields; the thermistor channel defaults to the
    /// outlet name. Called once when the config is resolved.
    pub fn resolved(mut self) -> anyhow::Result<Self> {
        if self.actor.is_empty() || self.outlet.is_empty() {
            bail!("valve descriptor requires both an actor and an outlet");
        }
        if let Some(thermistor) = &mut self.thermistor {
            if thermistor.monitoring_interval <= 0.0 {
                bail!("thermistor monitoring_interval must be positive");
            }
            if thermistor.required_active_time < 0.0 {
                bail!("thermistor required_active_time cannot be negative");
            }
            if thermistor.channel.is_none() {
                thermistor.channel = Some(self.outlet.clone());
            }
        }
        Ok(self)
    }

    pub fn thermistor_channel(&self) -> Option<&str> {
        self.thermistor
            .as_ref()
            .and_then(|t| t.channel.as_deref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Defaults {
    pub cameras: Option<Vec<String>>,
    pub min_purge_time: Option<f64>,
    pub max_purge_time: Option<f64>,
    pub min_fill_time: Option<f64>,
    pub max_fill_time: Option<f64>,
    pub max_pressure: Option<f64>,
    pub max_temperature: Option<f64>,
    pub max_temperature_increase: Option<f64>,
    pub lock_path: Option<PathBuf>,
}

/// A profile is a bundle of defaults applied below explicit CLI flags.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Profile {
    pub interactive: Option<InteractiveMode>,
    pub notify: Option<bool>,
    pub notification_level: Option<NotificationLevel>,
    pub use_thermistors: Option<bool>,
    pub require_all_thermistors: Option<bool>,
    pub check_pressures: Option<bool>,
    pub check_temperatures: Option<bool>,
    pub purge_time: Option<f64>,
    pub min_purge_time: Option<f64>,
    pub max_purge_time: Option<f64>,
    pub fill_time: Option<f64>,
    pub min_fill_time: Option<f64>,
    pub max_fill_time: Option<f64>,
    pub data_extra_time: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThermistorServerConfig {
    pub host: String,
    pub port: u16,
    /// `channelN` -> channel name mapping for the 16-bit reply payload.
    pub channels: HashMap<String, String>,
}

impl ThermistorServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Bit index -> channel name, parsed from the `channelN` keys.
    pub fn channel_map(&self) -> BTreeMap<u8, String> {
        let mut map = BTreeMap::new();
        for (key, name) in &self.channels {
            if name.is_empty() {
                continue;
            }
            if let Some(index) = key.strip_prefix("channel")
                && let Ok(index) = index.parse::<u8>()
                && index < 16
            {
                map.insert(index, name.clone());
            }
        }
        map
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoints {
    /// Base URL of the NPS/actor command gateway.
    pub nps_url: String,
    /// O2 alert endpoint.
    pub alerts_url: String,
    /// Cryostat summary API.
    pub api_url: String,
    /// Notification webhook; `null` disables notifications.
    pub notify_url: Option<String>,
    /// Actor whose `status` reply carries the e-stop labels.
    pub safety_actor: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub profiles: HashMap<String, Profile>,
    pub valves: BTreeMap<String, ValveConfig>,
    pub thermistors: ThermistorServerConfig,
    pub endpoints: Endpoints,
}

/// Sections of an operator-provided config file. Any section that is
/// present replaces the built-in one wholesale.
#[derive(Debug, Clone, Deserialize, Default)]
struct ConfigFileOverlay {
    defaults: Option<Defaults>,
    profiles: Option<HashMap<String, Profile>>,
    valves: Option<BTreeMap<String, ValveConfig>>,
    thermistors: Option<ThermistorServerConfig>,
    endpoints: Option<Endpoints>,
}

impl ConfigFile {
    pub fn builtin() -> Self {
        serde_json::from_str(BUILTIN_CONFIG).expect("embedded default config is valid")
    }

    /// Loads the built-in configuration, overlaid with `path` (or the
    /// `CRYOFILL_CONFIG_FILE` env var) when provided.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = Self::builtin();

        let env_path = std::env::var("CRYOFILL_CONFIG_FILE").ok().map(PathBuf::from);
        let path = path.map(Path::to_path_buf).or(env_path);

        if let Some(path) = path {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            let overlay: ConfigFileOverlay = serde_json::from_str(&raw)
                .with_context(|| format!("parsing config file {}", path.display()))?;

            if let Some(defaults) = overlay.defaults {
                config.defaults = defaults;
            }
            if let Some(profiles) = overlay.profiles {
                config.profiles = profiles;
            }
            if let Some(valves) = overlay.valves {
                config.valves = valves;
            }
            if let Some(thermistors) = overlay.thermistors {
                config.thermistors = thermistors;
            }
            if let Some(endpoints) = overlay.endpoints {
                config.endpoints = endpoints;
            }
        }

        Ok(config)
    }
}

/// Raw option values, typically from the CLI. `None` means "not given".
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub action: Action,
    pub cameras: Option<Vec<String>>,
    pub profile: Option<String>,
    pub interactive: Option<InteractiveMode>,
    pub no_prompt: bool,
    pub dry_run: bool,
    pub clear_lock: bool,
    pub use_thermistors: Option<bool>,
    pub require_all_thermistors: Option<bool>,
    pub check_pressures: Option<bool>,
    pub check_temperatures: Option<bool>,
    pub max_pressure: Option<f64>,
    pub max_temperature: Option<f64>,
    pub max_temperature_increase: Option<f64>,
    pub purge_time: Option<f64>,
    pub min_purge_time: Option<f64>,
    pub max_purge_time: Option<f64>,
    pub fill_time: Option<f64>,
    pub min_fill_time: Option<f64>,
    pub max_fill_time: Option<f64>,
    pub notify: Option<bool>,
    pub notification_level: Option<NotificationLevel>,
    pub quiet: bool,
    pub verbose: bool,
    pub write_log: bool,
    pub log_path: Option<PathBuf>,
    pub write_json: bool,
    pub write_data: bool,
    pub data_path: Option<PathBuf>,
    pub data_extra_time: Option<f64>,
    pub lock_path: Option<PathBuf>,
    pub listen: Option<String>,
}

/// Fully resolved options for one run.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub action: Action,
    pub cameras: Vec<String>,
    pub purge_valve: String,
    pub interactive: bool,
    pub no_prompt: bool,
    pub dry_run: bool,
    pub clear_lock: bool,
    pub use_thermistors: bool,
    pub require_all_thermistors: bool,
    pub max_pressure: Option<f64>,
    pub max_temperature: Option<f64>,
    pub purge_time: Option<f64>,
    pub min_purge_time: f64,
    pub max_purge_time: f64,
    pub fill_time: Option<f64>,
    pub min_fill_time: f64,
    pub max_fill_time: f64,
    pub max_temperature_increase: f64,
    pub notify: bool,
    pub notification_level: NotificationLevel,
    pub quiet: bool,
    pub verbose: bool,
    pub log_path: Option<PathBuf>,
    pub json_log_path: Option<PathBuf>,
    pub record_path: Option<PathBuf>,
    pub data_path: Option<PathBuf>,
    pub data_extra_time: f64,
    pub lock_path: PathBuf,
    pub listen: String,
    pub valves: BTreeMap<String, ValveConfig>,
    pub thermistors: ThermistorServerConfig,
    pub endpoints: Endpoints,
}

impl Config {
    /// Resolves CLI overrides against a loaded config file.
    pub fn resolve(opts: Overrides, file: &ConfigFile) -> anyhow::Result<Self> {
        let defaults = &file.defaults;

        let profile_name = match (&opts.profile, opts.action) {
            (Some(name), _) => Some(name.clone()),
            (None, Action::AutoFill) => Some("auto-fill".to_string()),
            (None, _) => None,
        };
        let profile = match &profile_name {
            Some(name) => Some(
                file.profiles
                    .get(name)
                    .cloned()
                    .ok_or_else(|| anyhow!("unknown profile {name:?}"))?,
            ),
            None => None,
        };
        let profile = profile.unwrap_or_default();

        let cameras = opts
            .cameras
            .or_else(|| defaults.cameras.clone())
            .unwrap_or_default();
        if opts.action.includes_fill() && cameras.is_empty() {
            bail!("no cameras selected and no default cameras configured");
        }

        let interactive_mode = opts
            .interactive
            .or(profile.interactive)
            .unwrap_or(InteractiveMode::Auto);
        let interactive = match interactive_mode {
            InteractiveMode::Yes => {
                if is_container() {
                    log::warn!("Interactive mode may not work in containers.");
                }
                true
            }
            InteractiveMode::No => false,
            InteractiveMode::Auto => !is_container(),
        };
        let no_prompt = opts.no_prompt || !interactive;

        let use_thermistors = opts
            .use_thermistors
            .or(profile.use_thermistors)
            .unwrap_or(true);
        let require_all_thermistors = opts
            .require_all_thermistors
            .or(profile.require_all_thermistors)
            .unwrap_or(false);

        let check_pressures = opts
            .check_pressures
            .or(profile.check_pressures)
            .unwrap_or(true);
        let check_temperatures = opts
            .check_temperatures
            .or(profile.check_temperatures)
            .unwrap_or(true);

        let max_pressure = if check_pressures {
            let value = opts.max_pressure.or(defaults.max_pressure);
            Some(value.ok_or_else(|| anyhow!("pressure checks enabled but no max_pressure"))?)
        } else {
            None
        };
        let max_temperature = if check_temperatures {
            let value = opts.max_temperature.or(defaults.max_temperature);
            Some(
                value.ok_or_else(|| anyhow!("temperature checks enabled but no max_temperature"))?,
            )
        } else {
            None
        };

        let purge_time = opts.purge_time.or(profile.purge_time);
        let fill_time = opts.fill_time.or(profile.fill_time);
        let min_purge_time = opts
            .min_purge_time
            .or(profile.min_purge_time)
            .or(defaults.min_purge_time)
            .unwrap_or(0.0);
        let max_purge_time = opts
            .max_purge_time
            .or(profile.max_purge_time)
            .or(defaults.max_purge_time)
            .ok_or_else(|| anyhow!("max_purge_time is not configured"))?;
        let min_fill_time = opts
            .min_fill_time
            .or(profile.min_fill_time)
            .or(defaults.min_fill_time)
            .unwrap_or(0.0);
        let max_fill_time = opts
            .max_fill_time
            .or(profile.max_fill_time)
            .or(defaults.max_fill_time)
            .ok_or_else(|| anyhow!("max_fill_time is not configured"))?;

        if use_thermistors && (purge_time.is_some() || fill_time.is_some()) {
            bail!("fixed purge/fill times cannot be combined with thermistors");
        }
        if !use_thermistors && no_prompt {
            if opts.action.includes_purge() && purge_time.is_none() {
                bail!("running without thermistors or prompts requires --purge-time");
            }
            if opts.action.includes_fill() && fill_time.is_none() {
                bail!("running without thermistors or prompts requires --fill-time");
            }
        }
        for (label, value) in [
            ("min_purge_time", min_purge_time),
            ("max_purge_time", max_purge_time),
            ("min_fill_time", min_fill_time),
            ("max_fill_time", max_fill_time),
            ("purge_time", purge_time.unwrap_or(0.0)),
            ("fill_time", fill_time.unwrap_or(0.0)),
        ] {
            if !value.is_finite() || value < 0.0 {
                bail!("{label} must be a non-negative number of seconds");
            }
        }
        if min_purge_time > max_purge_time {
            bail!("min_purge_time exceeds max_purge_time");
        }
        if min_fill_time > max_fill_time {
            bail!("min_fill_time exceeds max_fill_time");
        }

        let purge_valve = "purge".to_string();
        let mut valves = BTreeMap::new();
        for (name, valve) in &file.valves {
            valves.insert(name.clone(), valve.clone().resolved()?);
        }
        for name in cameras.iter().chain([&purge_valve]) {
            if !valves.contains_key(name) {
                bail!("no valve descriptor for {name:?} in the configuration");
            }
        }

        // All run artifacts hang off one timestamped base name.
        let base = format!("cryofill_{}", now_ms());
        let write_log = opts.write_log || opts.log_path.is_some();
        let log_path = if write_log {
            Some(
                opts.log_path
                    .unwrap_or_else(|| PathBuf::from(format!("./{base}.log"))),
            )
        } else {
            None
        };
        // The JSON artifacts only make sense next to a log.
        let write_json = opts.write_json && write_log;
        let stem = log_path
            .as_deref()
            .map(|p| p.with_extension(""))
            .unwrap_or_else(|| PathBuf::from(format!("./{base}")));
        let json_log_path = write_json.then(|| stem.with_extension("jsonl"));
        let record_path = write_json.then(|| stem.with_extension("json"));

        let write_data = opts.write_data || opts.data_path.is_some();
        let data_path = if write_data {
            Some(
                opts.data_path
                    .unwrap_or_else(|| PathBuf::from(format!("{}_data.json", stem.display()))),
            )
        } else {
            None
        };

        let lock_path = opts
            .lock_path
            .or_else(|| defaults.lock_path.clone())
            .unwrap_or_else(|| PathBuf::from("/data/cryofill.lock"));

        Ok(Self {
            action: opts.action,
            cameras,
            purge_valve,
            interactive,
            no_prompt,
            dry_run: opts.dry_run,
            clear_lock: opts.clear_lock,
            use_thermistors,
            require_all_thermistors,
            max_pressure,
            max_temperature,
            purge_time,
            min_purge_time,
            max_purge_time,
            fill_time,
            min_fill_time,
            max_fill_time,
            max_temperature_increase: opts
                .max_temperature_increase
                .or(defaults.max_temperature_increase)
                .unwrap_or(0.0),
            notify: opts.notify.or(profile.notify).unwrap_or(false),
            notification_level: opts
                .notification_level
                .or(profile.notification_level)
                .unwrap_or_default(),
            quiet: opts.quiet,
            verbose: opts.verbose,
            log_path,
            json_log_path,
            record_path,
            data_path,
            data_extra_time: opts
                .data_extra_time
                .or(profile.data_extra_time)
                .unwrap_or(0.0),
            lock_path,
            listen: opts.listen.unwrap_or_else(|| "0.0.0.0:8095".to_string()),
            valves,
            thermistors: file.thermistors.clone(),
            endpoints: file.endpoints.clone(),
        })
    }

    /// Effective ceiling for the purge phase: a fixed purge time overrides
    /// the configured maximum.
    pub fn purge_ceiling(&self) -> f64 {
        self.purge_time.unwrap_or(self.max_purge_time)
    }

    pub fn fill_ceiling(&self) -> f64 {
        self.fill_time.unwrap_or(self.max_fill_time)
    }

    pub fn valve(&self, name: &str) -> anyhow::Result<&ValveConfig> {
        self.valves
            .get(name)
            .ok_or_else(|| anyhow!("no valve descriptor for {name:?}"))
    }
}
