use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use cryofill_engine::config::{
    Action, Config, ConfigFile, InteractiveMode, NotificationLevel, Overrides,
};
use cryofill_engine::{logging, runner, web};

/// LN2 purge-and-fill control.
#[derive(Debug, Parser)]
#[command(name = "cryofill", version, max_term_width = 100)]
struct Cli {
    /// What to run.
    #[arg(value_enum, default_value_t = Action::PurgeAndFill)]
    action: Action,

    /// Configuration file overriding the built-in defaults.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Named profile from the configuration file.
    #[arg(long)]
    profile: Option<String>,

    /// Comma-separated cameras to fill. Defaults to the configured set.
    #[arg(short, long, value_delimiter = ',')]
    cameras: Option<Vec<String>>,

    /// Controls whether interactive features are shown.
    #[arg(short, long, value_enum)]
    interactive: Option<InteractiveMode>,

    /// Does not prompt the operator to finish or abort a purge/fill.
    #[arg(long)]
    no_prompt: bool,

    /// Goes through the run without commanding any valve.
    #[arg(long)]
    dry_run: bool,

    /// Removes an existing lock file before starting.
    #[arg(long)]
    clear_lock: bool,

    /// Use thermistors to decide when valves close.
    #[arg(long, overrides_with = "no_use_thermistors")]
    use_thermistors: bool,
    #[arg(long, hide = true)]
    no_use_thermistors: bool,

    /// Keep every fill valve open until all thermistors have reported.
    #[arg(long)]
    require_all_thermistors: bool,

    /// Abort if the pressure of any cryostat is above the limit.
    #[arg(long, overrides_with = "no_check_pressures")]
    check_pressures: bool,
    #[arg(long, hide = true)]
    no_check_pressures: bool,

    /// Abort if the temperature of any cryostat is above the limit.
    #[arg(long, overrides_with = "no_check_temperatures")]
    check_temperatures: bool,
    #[arg(long, hide = true)]
    no_check_temperatures: bool,

    /// Maximum cryostat pressure (Torr).
    #[arg(long)]
    max_pressure: Option<f64>,

    /// Maximum cryostat LN2 temperature (degC).
    #[arg(long)]
    max_temperature: Option<f64>,

    /// Allowed LN2 temperature increase after the fill (degC).
    #[arg(long)]
    max_temperature_increase: Option<f64>,

    /// Fixed purge time in seconds. Requires --no-use-thermistors.
    #[arg(long)]
    purge_time: Option<f64>,
    #[arg(long)]
    min_purge_time: Option<f64>,
    #[arg(long)]
    max_purge_time: Option<f64>,

    /// Fixed fill time in seconds. Requires --no-use-thermistors.
    #[arg(long)]
    fill_time: Option<f64>,
    #[arg(long)]
    min_fill_time: Option<f64>,
    #[arg(long)]
    max_fill_time: Option<f64>,

    /// Send notifications of success/failure to the configured webhook.
    #[arg(long, overrides_with = "no_notify")]
    notify: bool,
    #[arg(long, hide = true)]
    no_notify: bool,

    /// Minimum level that triggers a notification.
    #[arg(long, value_enum)]
    notification_level: Option<NotificationLevel>,

    /// Only output error messages.
    #[arg(short, long)]
    quiet: bool,

    /// Output additional information.
    #[arg(short, long)]
    verbose: bool,

    /// Save the log to a file.
    #[arg(long)]
    write_log: bool,

    /// Path of the log file. Implies --write-log.
    #[arg(long, value_name = "PATH")]
    log_path: Option<PathBuf>,

    /// Write the run record and a JSON-lines log next to the log file.
    #[arg(long)]
    write_json: bool,

    /// Validate cryostat data collected during the run.
    #[arg(long)]
    write_data: bool,

    /// Path of the post-run dataset. Implies --write-data.
    #[arg(long, value_name = "PATH")]
    data_path: Option<PathBuf>,

    /// Extra seconds of data to wait for after the run completes.
    #[arg(long)]
    data_extra_time: Option<f64>,

    /// Path of the lock file.
    #[arg(long, value_name = "PATH")]
    lock_path: Option<PathBuf>,

    /// Address the HTTP server binds to (serve action).
    #[arg(long, value_name = "ADDR")]
    listen: Option<String>,
}

/// Resolves a `--flag/--no-flag` pair into an optional override.
fn flag_pair(yes: bool, no: bool) -> Option<bool> {
    match (yes, no) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}

impl Cli {
    fn into_overrides(self) -> Overrides {
        Overrides {
            action: self.action,
            cameras: self.cameras,
            profile: self.profile,
            interactive: self.interactive,
            no_prompt: self.no_prompt,
            dry_run: self.dry_run,
            clear_lock: self.clear_lock,
            use_thermistors: flag_pair(self.use_thermistors, self.no_use_thermistors),
            require_all_thermistors: self.require_all_thermistors.then_some(true),
            check_pressures: flag_pair(self.check_pressures, self.no_check_pressures),
            check_temperatures: flag_pair(self.check_temperatures, self.no_check_temperatures),
            max_pressure: self.max_pressure,
            max_temperature: self.max_temperature,
            max_temperature_increase: self.max_temperature_increase,
            purge_time: self.purge_time,
            min_purge_time: self.min_purge_time,
            max_purge_time: self.max_purge_time,
            fill_time: self.fill_time,
            min_fill_time: self.min_fill_time,
            max_fill_time: self.max_fill_time,
            notify: flag_pair(self.notify, self.no_notify),
            notification_level: self.notification_level,
            quiet: self.quiet,
            verbose: self.verbose,
            write_log: self.write_log,
            log_path: self.log_path,
            write_json: self.write_json,
            write_data: self.write_data,
            data_path: self.data_path,
            data_extra_time: self.data_extra_time,
            lock_path: self.lock_path,
            listen: self.listen,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config_path = cli.config.clone();

    let file = match ConfigFile::load(config_path.as_deref()) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("cryofill: {err:#}");
            return ExitCode::FAILURE;
        }
    };

    if cli.action == Action::ListProfiles {
        let mut names: Vec<&String> = file.profiles.keys().collect();
        names.sort();
        for name in names {
            println!("{name}");
        }
        return ExitCode::SUCCESS;
    }

    let config = match Config::resolve(cli.into_overrides(), &file) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("cryofill: {err:#}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = logging::init(
        config.quiet,
        config.verbose,
        config.log_path.as_deref(),
        config.json_log_path.as_deref(),
    ) {
        eprintln!("cryofill: failed to set up logging: {err:#}");
        return ExitCode::FAILURE;
    }

    if config.action == Action::Serve {
        return match web::serve(config).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                log::error!("{err:#}");
                ExitCode::FAILURE
            }
        };
    }

    let drivers = runner::build_drivers(&config);
    match runner::run(&config, &drivers).await {
        0 => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    }
}
