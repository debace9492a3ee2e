use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use mdctl::assemble::{assemble, AssembleOptions, RunPolicy};
use mdctl::build::{build, BuildOptions};
use mdctl::config::{self, ArrayIdentity, ConfigFile};
use mdctl::create::{create, md_minor_of, CreateOptions, NoProbe};
use mdctl::detail::detail;
use mdctl::driver::{DriverOps, MdDevice};
use mdctl::examine::examine;
use mdctl::manage::{ro_toggle, runstop, subdevs, SubdevOp};
use mdctl::monitor::{monitor, AlertTargets, MonitorOptions};
use mdctl::{MdError, NAME};

#[derive(Parser)]
#[command(name = "mdctl")]
#[command(about = "Administration tool for Linux md (software RAID) arrays")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Be more verbose about what is happening
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (default /etc/mdctl.conf)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ExportFormat {
    Text,
    Json,
}

impl std::fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ExportFormat::Text => "text",
            ExportFormat::Json => "json",
        })
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Assemble a pre-existing array from its member devices
    Assemble {
        /// md device to assemble; omit with --scan to assemble every
        /// array the config file names
        device: Option<String>,

        /// Member devices; when omitted, candidates come from the config
        /// file's DEVICE lines
        members: Vec<String>,

        /// Only accept members carrying this array uuid (32 hex digits)
        #[arg(short, long)]
        uuid: Option<String>,

        /// Only accept members whose superblock names this preferred minor
        #[arg(short = 'm', long)]
        super_minor: Option<u32>,

        /// Take device and identity information from the config file
        #[arg(short, long)]
        scan: bool,

        /// Rewrite stale superblocks if that is what it takes to start a
        /// degraded array
        #[arg(short, long)]
        force: bool,

        /// Start the array even if it looks degraded
        #[arg(short = 'R', long)]
        run: bool,

        /// Assemble the array but do not start it
        #[arg(long)]
        no_start: bool,
    },

    /// Create a new array with superblocks
    Create {
        /// md device to create
        device: String,

        /// Member devices, in slot order
        members: Vec<String>,

        /// Raid level (linear, raid0, raid1, raid4, raid5, ...)
        #[arg(short, long)]
        level: String,

        /// Number of active devices in the array
        #[arg(short = 'n', long = "raid-devices")]
        raid_devices: u32,

        /// Number of spare devices
        #[arg(short = 'x', long = "spare-devices", default_value_t = 0)]
        spare_devices: u32,

        /// Chunk size in KiB (power of two, default 64)
        #[arg(short = 'c', long, default_value_t = 0)]
        chunk: u32,

        /// Per-member size in KiB (default: smallest device)
        #[arg(short = 'z', long, default_value_t = 0)]
        size: u32,

        /// Parity layout for raid5
        #[arg(short = 'p', long)]
        layout: Option<String>,

        /// Start the array without asking questions
        #[arg(short = 'R', long)]
        run: bool,
    },

    /// Build a legacy array without superblocks (linear or raid0)
    Build {
        /// md device to build
        device: String,

        /// Member devices, in slot order
        members: Vec<String>,

        /// Raid level (linear or raid0)
        #[arg(short, long)]
        level: String,

        /// Number of devices in the array
        #[arg(short = 'n', long = "raid-devices")]
        raid_devices: u32,

        /// Chunk size in KiB (power of two, default 64)
        #[arg(short = 'c', long, default_value_t = 0)]
        chunk: u32,
    },

    /// Print details of one or more running arrays
    Detail {
        devices: Vec<String>,

        /// Output format
        #[arg(long, value_enum, default_value_t = ExportFormat::Text)]
        export: ExportFormat,
    },

    /// Print the superblock found on one or more member devices
    Examine {
        devices: Vec<String>,

        /// Output format
        #[arg(long, value_enum, default_value_t = ExportFormat::Text)]
        export: ExportFormat,
    },

    /// Watch arrays and report state changes
    Monitor {
        /// Arrays to watch; default: every array in the config file
        devices: Vec<String>,

        /// Mail address alerted about failures
        #[arg(short, long)]
        mail: Option<String>,

        /// Program run for every event: cmd EVENT ARRAY [DEVICE]
        #[arg(short = 'p', long)]
        program: Option<String>,

        /// Seconds between polls
        #[arg(short, long, default_value_t = 60)]
        delay: u64,
    },

    /// Start a configured array
    Run { device: String },

    /// Stop a running array
    Stop { device: String },

    /// Mark an array readonly
    Readonly { device: String },

    /// Make a readonly array writable again
    Readwrite { device: String },

    /// Hot-add devices to a running array
    Add {
        device: String,
        members: Vec<String>,
    },

    /// Hot-remove devices from a running array
    Remove {
        device: String,
        members: Vec<String>,
    },

    /// Mark member devices as faulty
    Fail {
        device: String,
        members: Vec<String>,
    },
}

fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.verbose { "info" } else { "warn" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = setup_signal_handlers() {
        eprintln!("{}: cannot install signal handlers: {}", NAME, e);
    }

    // Every mode talks to block devices or the md driver.
    if !is_root() {
        eprintln!("{}: must be run as root", NAME);
        std::process::exit(1);
    }

    match run(cli) {
        Ok(()) => {}
        Err(e) => {
            eprintln!("{}: {:#}", NAME, e);
            std::process::exit(exit_code(&e));
        }
    }
}

fn exit_code(e: &anyhow::Error) -> i32 {
    match e.downcast_ref::<MdError>() {
        Some(MdError::Usage(_)) => 2,
        _ => 1,
    }
}

fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

fn setup_signal_handlers() -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    std::thread::spawn(move || {
        for _sig in signals.forever() {
            mdctl::set_interrupted();
        }
    });
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    let config = ConfigFile::load(cli.config.as_deref())?;
    let verbose = cli.verbose;

    match cli.command {
        Commands::Assemble {
            device,
            members,
            uuid,
            super_minor,
            scan,
            force,
            run,
            no_start,
        } => {
            let runstop = match (run, no_start) {
                (true, true) => {
                    return Err(MdError::Usage(
                        "cannot both run and not start an array".to_string(),
                    )
                    .into())
                }
                (true, false) => RunPolicy::ForceRun,
                (false, true) => RunPolicy::NoRun,
                (false, false) => RunPolicy::Auto,
            };
            let opts = AssembleOptions {
                runstop,
                force,
                verbose,
            };
            let uuid = match uuid.as_deref() {
                Some(s) => Some(
                    config::parse_uuid(s)
                        .ok_or_else(|| MdError::Usage(format!("bad uuid: {}", s)))?,
                ),
                None => None,
            };
            if !scan {
                let device = device.ok_or_else(|| {
                    MdError::Usage("an md device must be given to assemble".to_string())
                })?;
                let ident = ArrayIdentity {
                    device: Some(device.clone()),
                    uuid,
                    super_minor,
                    ..ArrayIdentity::default()
                };
                assemble_one(&device, &ident, Some(members.as_slice()), &config, &opts)?;
            } else if let Some(device) = device {
                // Scan with named arrays: identity must come from the
                // config file.
                let mut failed = false;
                for dev in std::iter::once(device).chain(members) {
                    let Some(ident) = config.identity_for(&dev).cloned() else {
                        eprintln!("{}: {} not identified in config file", NAME, dev);
                        failed = true;
                        continue;
                    };
                    if let Err(e) = assemble_one(&dev, &ident, None, &config, &opts) {
                        eprintln!("{}: {:#}", NAME, anyhow::Error::from(e));
                        failed = true;
                    }
                }
                if failed {
                    std::process::exit(1);
                }
            } else {
                // Full scan: every array the config file names, skipping
                // the ones already running.
                if config.identities().is_empty() {
                    return Err(MdError::Usage(
                        "no arrays found in config file".to_string(),
                    )
                    .into());
                }
                let mut failed = false;
                for ident in config.identities().to_vec() {
                    let dev = ident.device.clone().unwrap_or_default();
                    match MdDevice::open(Path::new(&dev)) {
                        Ok(driver) => {
                            if driver.query_array().is_ok() {
                                continue;
                            }
                        }
                        Err(e) => {
                            eprintln!("{}: {}", NAME, e);
                            failed = true;
                            continue;
                        }
                    }
                    if let Err(e) = assemble_one(&dev, &ident, None, &config, &opts) {
                        eprintln!("{}: {:#}", NAME, anyhow::Error::from(e));
                        failed = true;
                    }
                }
                if failed {
                    std::process::exit(1);
                }
            }
        }

        Commands::Create {
            device,
            members,
            level,
            raid_devices,
            spare_devices,
            chunk,
            size,
            layout,
            run,
        } => {
            let level = config::level_from_name(&level)
                .ok_or_else(|| MdError::Usage(format!("invalid raid level: {}", level)))?;
            check_chunk(chunk)?;
            let layout = match layout.as_deref() {
                Some(name) => {
                    if level != 5 {
                        return Err(MdError::Usage(format!(
                            "layout is not meaningful for level {} arrays",
                            level
                        ))
                        .into());
                    }
                    Some(config::r5_layout_from_name(name).ok_or_else(|| {
                        MdError::Usage(format!("layout {} not understood for raid5", name))
                    })?)
                }
                None => None,
            };
            if spare_devices > 0 && level < 1 {
                return Err(MdError::Usage(format!(
                    "raid level {} is incompatible with spare devices",
                    level
                ))
                .into());
            }
            let driver = MdDevice::open(Path::new(&device))?;
            let md_minor = md_minor_of(Path::new(&device))?;
            let opts = CreateOptions {
                level,
                raid_disks: raid_devices,
                spare_disks: spare_devices,
                chunk_kib: chunk,
                layout,
                size_kib: size,
                run,
                verbose,
            };
            create(
                &device,
                &driver,
                md_minor,
                &members,
                &opts,
                &NoProbe,
                &mut ask,
            )?;
        }

        Commands::Build {
            device,
            members,
            level,
            raid_devices,
            chunk,
        } => {
            let level = config::level_from_name(&level)
                .ok_or_else(|| MdError::Usage(format!("invalid raid level: {}", level)))?;
            check_chunk(chunk)?;
            let driver = MdDevice::open(Path::new(&device))?;
            let md_minor = md_minor_of(Path::new(&device))?;
            let opts = BuildOptions {
                level,
                raid_disks: raid_devices,
                chunk_kib: chunk,
                verbose,
            };
            build(&device, &driver, md_minor, &members, &opts)?;
        }

        Commands::Detail { devices, export } => {
            if devices.is_empty() {
                return Err(MdError::Usage("no devices given to detail".to_string()).into());
            }
            let mut failed = false;
            for dev in &devices {
                match MdDevice::open(Path::new(dev)).map_err(MdError::from).and_then(
                    |driver| detail(dev, &driver),
                ) {
                    Ok(report) => print_report(&report, export)?,
                    Err(e) => {
                        eprintln!("{}: {:#}", NAME, anyhow::Error::from(e));
                        failed = true;
                    }
                }
            }
            if failed {
                std::process::exit(1);
            }
        }

        Commands::Examine { devices, export } => {
            if devices.is_empty() {
                return Err(MdError::Usage("no devices given to examine".to_string()).into());
            }
            let mut failed = false;
            for dev in &devices {
                match examine(Path::new(dev)) {
                    Ok(report) => print_report(&report, export)?,
                    Err(e) => {
                        eprintln!("{}: {:#}", NAME, anyhow::Error::from(e));
                        failed = true;
                    }
                }
            }
            if failed {
                std::process::exit(1);
            }
        }

        Commands::Monitor {
            devices,
            mail,
            program,
            delay,
        } => {
            if delay < 1 {
                return Err(MdError::Usage("invalid delay".to_string()).into());
            }
            let targets = AlertTargets { mail, program };
            let opts = MonitorOptions { period_secs: delay };
            monitor(&devices, &config, &targets, &opts)?;
        }

        Commands::Run { device } => {
            let driver = MdDevice::open(Path::new(&device))?;
            runstop(&device, &driver, 1)?;
        }

        Commands::Stop { device } => {
            let driver = MdDevice::open(Path::new(&device))?;
            runstop(&device, &driver, -1)?;
        }

        Commands::Readonly { device } => {
            let driver = MdDevice::open(Path::new(&device))?;
            ro_toggle(&device, &driver, 1)?;
        }

        Commands::Readwrite { device } => {
            let driver = MdDevice::open(Path::new(&device))?;
            ro_toggle(&device, &driver, -1)?;
        }

        Commands::Add { device, members } => {
            manage_subdevs(&device, members, SubdevOp::Add)?;
        }

        Commands::Remove { device, members } => {
            manage_subdevs(&device, members, SubdevOp::Remove)?;
        }

        Commands::Fail { device, members } => {
            manage_subdevs(&device, members, SubdevOp::Fault)?;
        }
    }
    Ok(())
}

fn assemble_one(
    device: &str,
    ident: &ArrayIdentity,
    members: Option<&[String]>,
    config: &ConfigFile,
    opts: &AssembleOptions,
) -> Result<(), MdError> {
    let driver = MdDevice::open(Path::new(device))?;
    let outcome = assemble(device, &driver, ident, members, config, opts)?;
    if outcome.started {
        let spares = if outcome.sparecnt > 0 {
            format!(" and {} spare{}", outcome.sparecnt, plural(outcome.sparecnt))
        } else {
            String::new()
        };
        eprintln!(
            "{}: {} has been started with {} drive{}{}.",
            NAME,
            device,
            outcome.okcnt,
            plural(outcome.okcnt),
            spares
        );
    } else {
        eprintln!(
            "{}: {} assembled from {} drive{}, but not started.",
            NAME,
            device,
            outcome.okcnt,
            plural(outcome.okcnt)
        );
    }
    Ok(())
}

fn manage_subdevs(device: &str, members: Vec<String>, op: SubdevOp) -> Result<()> {
    if members.is_empty() {
        return Err(MdError::Usage("no member devices given".to_string()).into());
    }
    let driver = MdDevice::open(Path::new(device))?;
    let ops: Vec<(String, SubdevOp)> = members.into_iter().map(|m| (m, op)).collect();
    subdevs(device, &driver, &ops)?;
    Ok(())
}

fn check_chunk(chunk: u32) -> Result<(), MdError> {
    if chunk != 0 && (chunk < 4 || !chunk.is_power_of_two()) {
        return Err(MdError::Usage(format!("invalid chunk/rounding value: {}", chunk)));
    }
    Ok(())
}

fn print_report<T: serde::Serialize + Printable>(report: &T, format: ExportFormat) -> Result<()> {
    match format {
        ExportFormat::Text => report.print_text(),
        ExportFormat::Json => println!("{}", serde_json::to_string_pretty(report)?),
    }
    Ok(())
}

trait Printable {
    fn print_text(&self);
}

impl Printable for mdctl::detail::ArrayDetail {
    fn print_text(&self) {
        mdctl::detail::ArrayDetail::print_text(self)
    }
}

impl Printable for mdctl::examine::SuperblockReport {
    fn print_text(&self) {
        mdctl::examine::SuperblockReport::print_text(self)
    }
}

fn plural(n: u32) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}

/// One y/n question on the controlling terminal.
fn ask(prompt: &str) -> bool {
    use std::io::{BufRead, Write};

    for _ in 0..5 {
        print!("{}", prompt);
        let _ = std::io::stdout().flush();
        let mut line = String::new();
        if std::io::stdin().lock().read_line(&mut line).is_err() {
            return false;
        }
        match line.trim().chars().next() {
            Some('y') | Some('Y') => return true,
            Some('n') | Some('N') | None => return false,
            _ => eprintln!("Please answer y or n."),
        }
    }
    false
}
