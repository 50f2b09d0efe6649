//! Create, check and delete lab router VMs.
//!
//! ```text
//! sudo labvm create --name xr1 --type cisco --mgmt-ip 10.0.0.1/20 --mgmt-gw 10.0.15.254 \
//!     --interfaces br:br1 br:br2 net:someNetwork
//! sudo labvm delete --name xr1
//! ```

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use labvm::{
    DeviceFamily, GroupRegistry, ManagementAddress, Provisioner, PtyOpener, Settings, SystemExecutor,
    TrafficInterface, VmSpec,
};

#[derive(Parser)]
#[command(name = "labvm")]
#[command(about = "Provision and tear down Cisco IOS-XRv and Juniper vMX router VMs")]
struct Cli {
    /// TOML settings file (image catalog, credentials, timings)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print the result as JSON instead of step lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a router VM and apply its base configuration
    Create {
        /// Name of the router VM (max 6 characters for juniper)
        #[arg(long)]
        name: String,

        /// Router type
        #[arg(long = "type", default_value = "cisco")]
        family: DeviceFamily,

        /// Management bridge or host interface
        #[arg(long, default_value = "br0")]
        mgmt_br: String,

        /// Management address, e.g. 10.0.0.1/20
        #[arg(long)]
        mgmt_ip: Option<ManagementAddress>,

        /// Default gateway of the management network
        #[arg(long)]
        mgmt_gw: Option<Ipv4Addr>,

        /// Traffic interfaces as type:value, e.g. br:br5 net:someNetwork
        #[arg(long, num_args = 1..)]
        interfaces: Vec<TrafficInterface>,

        /// File with CLI configuration pasted after the base configuration
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Show the CPUs, disk and memory a VM would get, without creating it
    Check {
        #[arg(long)]
        name: String,

        #[arg(long = "type", default_value = "cisco")]
        family: DeviceFamily,
    },

    /// Delete every VM whose name contains NAME, with its storage
    Delete {
        #[arg(long)]
        name: String,
    },

    /// List the VMs whose name contains NAME
    Members {
        #[arg(long)]
        name: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let started = Instant::now();
    match run(cli) {
        Ok(()) => {
            println!("done in {:.1}s", started.elapsed().as_secs_f64());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}", format!("error: {}", describe(&e)).red().bold());
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();
}

/// The error chain on one line, without repeating causes a message
/// already includes.
fn describe(err: &anyhow::Error) -> String {
    let mut out = err.to_string();
    for cause in err.chain().skip(1) {
        let msg = cause.to_string();
        if !out.contains(&msg) {
            out.push_str(": ");
            out.push_str(&msg);
        }
    }
    out
}

fn run(cli: Cli) -> Result<()> {
    // SAFETY: geteuid has no preconditions and cannot fail.
    if unsafe { libc::geteuid() } != 0 {
        bail!("this tool requires root privileges");
    }

    let settings = Settings::load_or_default(cli.settings.as_deref()).context("loading settings")?;
    let exec = SystemExecutor;
    let opener = PtyOpener;

    match cli.command {
        Commands::Create {
            name,
            family,
            mgmt_br,
            mgmt_ip,
            mgmt_gw,
            interfaces,
            config,
        } => {
            let cli_config = config.as_deref().map(read_config).transpose()?;
            let spec = VmSpec::new(&name, family, &mgmt_br)?
                .with_interfaces(interfaces)
                .with_management(mgmt_ip, mgmt_gw)
                .with_cli_config(cli_config);

            let mut provisioner = Provisioner::new(&exec, &opener, &settings);
            if cli.json {
                provisioner = provisioner.quiet();
            } else {
                println!("{}", format!("Creating {} VM '{}'", family, name).bold());
                println!();
            }

            let report = provisioner.provision(&spec)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!();
                println!(
                    "{} '{}' is {} (cpus {:?}, management bridge {})",
                    "✓".green().bold(),
                    report.name,
                    report.state,
                    report.cpus.cpus(),
                    report.mgmt_bridge
                );
            }
            Ok(())
        }

        Commands::Check { name, family } => {
            let spec = VmSpec::new(&name, family, "br0")?;
            let report = Provisioner::new(&exec, &opener, &settings).check(&spec)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                let cpus: Vec<String> = report.cpus.cpus().iter().map(|c| c.to_string()).collect();
                println!("name: {}", report.name);
                println!("type: {}", report.family);
                println!("cpus: {}", cpus.join(","));
                println!("disk-space: {:.0}G", report.disk_gb);
                println!("memory: {:.0}G", report.ram_gb);
            }
            Ok(())
        }

        Commands::Delete { name } => {
            let registry = GroupRegistry::new(&exec, &settings.timings);
            let report = registry
                .teardown(&name)
                .with_context(|| format!("deleting group '{}'", name))?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                for outcome in &report.outcomes {
                    match &outcome.error {
                        None => println!("  {} {}", "✓".green(), outcome.command),
                        Some(e) => println!("  {} {}\n      {}", "✗".red(), outcome.command, e),
                    }
                }
            }
            report.into_result()?;
            if !cli.json {
                println!("group '{}' successfully deleted", name);
            }
            Ok(())
        }

        Commands::Members { name } => {
            let members = GroupRegistry::new(&exec, &settings.timings).members_of(&name)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&members)?);
            } else if members.is_empty() {
                println!("no VMs found in group '{}'", name);
            } else {
                for member in members {
                    println!("{}", member);
                }
            }
            Ok(())
        }
    }
}

fn read_config(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading config file {}", path.display()))
}
