mod bitmap;
mod bpf;
mod chain;
mod compiler;
mod config;
mod counters;
mod error;
mod extract;
mod firewall;
mod helpers;
mod info;
mod logging;
mod module;
mod options;
mod prog;
mod protocols;
mod registry;
mod rule;
mod rules;
mod runvars;
mod sim;
mod stats;

use anyhow::Context;
use bpf::AyaDataplane;
use clap::{Parser, Subcommand};
use config::ConfigFile;
use firewall::Firewall;
use log::{info, warn, LevelFilter};
use prog::Prog;
use rule::Direction;
use rules::RuleOp;
use sim::{Packet, SimDataplane};
use std::{path::PathBuf, time::Duration};
use tokio::{signal, time};

#[derive(Debug, Parser)]
#[clap(version, about = "XDP firewall with per direction rule chains")]
struct Opt {
    /// Overrides the log level set by RUST_LOG
    #[clap(long)]
    log_level: Option<LevelFilter>,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Compiles the rules from a config file against the in-memory data plane
    /// and optionally classifies a test packet.
    Check {
        /// Rules config file
        #[clap(short, long)]
        config: String,

        /// Test packet description as key=value pairs, e.g. `src=10.0.0.1 dport=22`
        #[clap(short, long, num_args = 1..)]
        packet: Vec<String>,

        /// The chain the test packet is sent to
        #[clap(short, long, value_enum, default_value_t = Direction::Ingress)]
        direction: Direction,

        /// Writes the compiled rules back to this file
        #[clap(long)]
        save: Option<String>,
    },

    /// Changes the rules of a config file. The rules are compiled before
    /// the file is written back.
    Rules {
        /// Rules config file
        #[clap(short, long)]
        config: String,

        /// The chain to change
        #[clap(short, long, value_enum, default_value_t = Direction::Ingress)]
        direction: Direction,

        #[clap(subcommand)]
        op: RuleOp,
    },

    /// Loads the firewall on an interface and applies the rules config.
    Run {
        /// Rules config file
        #[clap(short, long)]
        config: String,

        /// The compiled eBPF object with the firewall modules
        #[clap(short, long)]
        object: PathBuf,

        /// The target network interface name
        #[clap(short, long, default_value = "lo")]
        ifname: String,

        /// Seconds between counters printouts, 0 disables them
        #[clap(long, default_value_t = 0)]
        interval: u64,

        /// Zero the counters after each printout
        #[clap(long)]
        reset_counters: bool,

        /// Try attach the program in driver mode. The network interface driver
        /// must support XDP.
        #[clap(long, conflicts_with = "xdp_skb_mode")]
        xdp_driver_mode: bool,

        /// Try attach the program in skb mode, supported by any interface.
        #[clap(long)]
        xdp_skb_mode: bool,
    },

    /// Tears down both the attached program and the pinned maps for the
    /// input interface.
    Teardown {
        /// The target network interface name
        #[clap(short, long)]
        ifname: String,
    },
}

fn check(
    config: &str,
    packet: &[String],
    direction: Direction,
    save: Option<String>,
) -> Result<(), anyhow::Error> {
    let sim = SimDataplane::new();
    let fw = Firewall::new("check", Box::new(sim.clone()), true)?;
    ConfigFile::new(&config).load(&fw)?;
    info::print_layout(&fw)?;

    if !packet.is_empty() {
        let packet = Packet::from_option_args(packet)?;
        let verdict = sim
            .classify(direction, &packet)
            .context("Failed to classify packet")?;
        match verdict.rule {
            Some(id) => println!("{} [{}] => {} by rule {}", direction, packet, verdict.action, id),
            None => println!("{} [{}] => {} by default policy", direction, packet, verdict.action),
        }
        println!();
    }

    stats::print_all(&fw);

    if let Some(path) = save {
        ConfigFile::new(&path).save(&fw)?;
    }
    Ok(())
}

async fn run(
    config: &str,
    object: PathBuf,
    ifname: &str,
    interval: u64,
    reset_counters: bool,
    flags: aya::programs::XdpFlags,
) -> Result<(), anyhow::Error> {
    if let Err(e) = helpers::increase_memlocked() {
        warn!("{}", e);
    }

    let dataplane = AyaDataplane::new(ifname, &object, flags)?;
    let fw = Firewall::new(ifname, Box::new(dataplane), true)?;
    ConfigFile::new(&config).load(&fw)?;
    info::print_layout(&fw)?;

    info!("[{}] Firewall running, press Ctrl-C to exit", ifname);
    if interval == 0 {
        signal::ctrl_c().await?;
    } else {
        let mut ticker = time::interval(Duration::from_secs(interval));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    stats::print_all(&fw);
                    if reset_counters && !stats::reset_all(&fw) {
                        warn!("[{}] Not all counters were reset", ifname);
                    }
                }
                r = signal::ctrl_c() => {
                    r?;
                    break;
                }
            }
        }
    }

    stats::print_all(&fw);
    info!("[{}] Exiting, the XDP link stays pinned until teardown", ifname);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let opt = Opt::parse();
    logging::init(opt.log_level);

    match opt.cmd {
        Command::Check {
            config,
            packet,
            direction,
            save,
        } => check(&config, &packet, direction, save),
        Command::Run {
            config,
            object,
            ifname,
            interval,
            reset_counters,
            xdp_driver_mode,
            xdp_skb_mode,
        } => {
            let flags = prog::xdp_flags(xdp_driver_mode, xdp_skb_mode)?;
            run(&config, object, &ifname, interval, reset_counters, flags).await
        }
        Command::Rules {
            config,
            direction,
            op,
        } => rules::edit(&config, direction, &op),
        Command::Teardown { ifname } => Prog::new(&ifname)?.teardown(),
    }
}
