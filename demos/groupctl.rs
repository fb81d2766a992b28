use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use matc_groups::{config, error, groups};

const DEFAULT_BASE: &str = "./groupctl";

#[derive(Parser, Debug)]
#[command()]
struct Cli {
    #[clap(long)]
    #[arg(global = true, default_value_t = false)]
    verbose: bool,

    #[clap(long)]
    #[arg(global = true, default_value_t = DEFAULT_BASE.to_string())]
    base: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create config for fabric
    Init {
        #[clap(long)]
        #[arg(default_value_t = 1)]
        fabric_index: u8,

        #[clap(long, value_parser = parse_u64)]
        #[arg(default_value = "0x110")]
        fabric_id: u64,

        /// Hex of uncompressed root CA public key. Random key when missing.
        #[clap(long)]
        ca_public_key: Option<String>,
    },
    ShowGroups {},
    AddGroup {
        name: String,
        #[clap(value_parser = parse_u16)]
        group_id: u16,
    },
    RemoveGroup {
        #[clap(value_parser = parse_u16)]
        group_id: u16,
    },
    ShowKeysets {},
    BindKeyset {
        #[clap(value_parser = parse_u16)]
        group_id: u16,
        #[clap(value_parser = parse_u16)]
        keyset_id: u16,
    },
    UnbindKeyset {
        #[clap(value_parser = parse_u16)]
        group_id: u16,
        #[clap(value_parser = parse_u16)]
        keyset_id: u16,
    },
    /// Add keyset with single epoch key. Policy 0 = trust first, 1 = cache and sync
    AddKeyset {
        #[clap(value_parser = parse_u16)]
        keyset_id: u16,
        policy: u8,
        validity_time: u64,
        /// 16 byte key as hex, optionally prefixed with "hex:"
        epoch_key: String,
    },
    RemoveKeyset {
        #[clap(value_parser = parse_u16)]
        keyset_id: u16,
    },
}

fn parse_u64(s: &str) -> Result<u64, String> {
    match s.strip_prefix("0x") {
        Some(h) => u64::from_str_radix(h, 16),
        None => s.parse(),
    }
    .map_err(|e| format!("{}: {}", s, e))
}

fn parse_u16(s: &str) -> Result<u16, String> {
    let v = parse_u64(s)?;
    u16::try_from(v).map_err(|_| format!("{} does not fit 16 bits", s))
}

fn settings(base: &str) -> Result<groups::GroupSettings> {
    let cfg = config::load_config(base).context("run init first")?;
    let provider = groups::StoreGroupDataProvider::load(&cfg.group_store)?;
    groups::GroupSettings::new(provider, &cfg.fabric()?)
}

fn init(base: &str, fabric_index: u8, fabric_id: u64, ca_public_key: Option<String>) -> Result<()> {
    let ca = match ca_public_key {
        Some(h) => hex::decode(h).context("ca public key is not hex")?,
        None => {
            let mut k = vec![4u8; 65];
            rand::Rng::fill(&mut rand::thread_rng(), &mut k[1..]);
            k
        }
    };
    let cfg = config::ControllerConfig::new(base, fabric_index, fabric_id, &ca);
    config::save_config(base, &cfg)?;
    let fabric = cfg.fabric()?;
    println!(
        "fabric index:{} id:0x{:x} compressed:{}",
        fabric.index,
        fabric.id,
        hex::encode(fabric.compressed()?)
    );
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    let base = cli.base;
    match cli.command {
        Commands::Init {
            fabric_index,
            fabric_id,
            ca_public_key,
        } => return init(&base, fabric_index, fabric_id, ca_public_key),
        Commands::ShowGroups {} => {
            let s = settings(&base)?;
            println!("fabric index {}", s.fabric_index());
            println!("{}", s.show_groups());
        }
        Commands::AddGroup { name, group_id } => settings(&base)?.add_group(&name, group_id)?,
        Commands::RemoveGroup { group_id } => settings(&base)?.remove_group(group_id)?,
        Commands::ShowKeysets {} => {
            let s = settings(&base)?;
            println!("fabric index {}", s.fabric_index());
            println!("{}", s.show_keysets());
        }
        Commands::BindKeyset { group_id, keyset_id } => settings(&base)?.bind_keyset(group_id, keyset_id)?,
        Commands::UnbindKeyset { group_id, keyset_id } => {
            match settings(&base)?.unbind_keyset(group_id, keyset_id) {
                Err(error::Error::NotFound) => {
                    println!("group 0x{:04x} is not bound to keyset 0x{:04x}", group_id, keyset_id)
                }
                r => r?,
            }
        }
        Commands::AddKeyset {
            keyset_id,
            policy,
            validity_time,
            epoch_key,
        } => {
            let s = settings(&base)?;
            s.add_keyset(keyset_id, policy, validity_time, &epoch_key)?;
            for id in s.keyset_group_session_ids(keyset_id)? {
                println!("group session id 0x{:04x}", id);
            }
        }
        Commands::RemoveKeyset { keyset_id } => settings(&base)?.remove_keyset(keyset_id)?,
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let log_level = {
        if cli.verbose {
            log::LevelFilter::Trace
        } else {
            log::LevelFilter::Error
        }
    };
    env_logger::Builder::new()
        .parse_default_env()
        .target(env_logger::Target::Stdout)
        .filter_level(log_level)
        .format_timestamp(Some(env_logger::TimestampPrecision::Millis))
        .init();

    if let Err(e) = run(cli) {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}
