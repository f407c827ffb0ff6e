//! gaveld is the gavel server: one node of a Raft-replicated auction store.
//! It takes configuration via a configuration file and environment variables,
//! then serves clients (port 9605) and Raft peers (port 9705).

#![warn(clippy::all)]

use gavel::errinput;
use gavel::error::Result;
use gavel::{auction, raft, storage, Server};

use serde::Deserialize;
use std::collections::HashMap;

fn main() -> Result<()> {
    let args = clap::command!()
        .name("gaveld")
        .about("Starts a gavel auction store node.")
        .arg(
            clap::Arg::new("config")
                .short('c')
                .long("config")
                .help("Configuration file path")
                .default_value("config/gavel.yaml"),
        )
        .get_matches();
    let cfg = Config::new(args.get_one::<String>("config").unwrap())?;

    let loglevel = cfg.log_level.parse::<simplelog::LevelFilter>()?;
    let mut logconfig = simplelog::ConfigBuilder::new();
    if loglevel != simplelog::LevelFilter::Debug {
        logconfig.add_filter_allow_str("gavel");
    }
    simplelog::SimpleLogger::init(loglevel, logconfig.build())?;

    // Peers are configured as address → node ID (the transport's view); the
    // server wants them keyed by node ID.
    let mut peers = HashMap::new();
    for (addr, id) in cfg.peers {
        if id == cfg.id {
            return errinput!("peer {addr} uses this node's own id {id}");
        }
        if peers.insert(id.clone(), addr).is_some() {
            return errinput!("duplicate peer id {id}");
        }
    }

    let store: Box<dyn storage::Store> = match cfg.storage.as_str() {
        "file" | "" => {
            let path = std::path::Path::new(&cfg.data_dir).join("raft");
            Box::new(storage::File::new(&path)?)
        }
        "memory" => Box::new(storage::Memory::new()),
        name => return errinput!("invalid storage engine {name}"),
    };
    let log = raft::Log::new(store)?;
    let state = Box::new(auction::State::new(cfg.executor));

    let opts = raft::Options {
        leader_timeout: cfg.min_leader_timeout..cfg.max_leader_timeout,
        election_timeout: cfg.min_election_timeout..cfg.max_election_timeout,
        heartbeat_interval: cfg.heartbeat_timeout,
        min_election_delay: cfg.min_election_delay,
        ..raft::Options::default()
    };

    Server::new(cfg.id, peers, log, state, opts)?.serve(&cfg.listen_raft, &cfg.listen_client)
}

#[derive(Debug, Deserialize)]
struct Config {
    /// This node's ID.
    id: raft::NodeID,
    /// Raft RPC addresses of the other cluster members, as address → node ID.
    #[serde(default)]
    peers: HashMap<String, raft::NodeID>,
    /// The address to listen on for Raft peer RPCs.
    listen_raft: String,
    /// The address to listen on for client command submission.
    listen_client: String,
    log_level: String,
    data_dir: String,
    /// The Raft log storage engine: file (default) or memory.
    storage: String,
    /// Timing options, in milliseconds.
    min_leader_timeout: u64,
    max_leader_timeout: u64,
    min_election_timeout: u64,
    max_election_timeout: u64,
    heartbeat_timeout: u64,
    min_election_delay: u64,
    /// Auction store options, handed through opaquely.
    #[serde(default)]
    executor: auction::Config,
}

impl Config {
    fn new(file: &str) -> Result<Self> {
        let cfg: Config = config::Config::builder()
            .set_default("id", "gavel")?
            .set_default("listen_raft", "0.0.0.0:9705")?
            .set_default("listen_client", "0.0.0.0:9605")?
            .set_default("log_level", "info")?
            .set_default("data_dir", "data")?
            .set_default("storage", "file")?
            .set_default("min_leader_timeout", 150)?
            .set_default("max_leader_timeout", 300)?
            .set_default("min_election_timeout", 150)?
            .set_default("max_election_timeout", 300)?
            .set_default("heartbeat_timeout", 50)?
            .set_default("min_election_delay", 50)?
            .add_source(config::File::with_name(file))
            .add_source(config::Environment::with_prefix("GAVEL"))
            .build()?
            .try_deserialize()?;

        if cfg.min_leader_timeout >= cfg.max_leader_timeout {
            return errinput!("min_leader_timeout must be below max_leader_timeout");
        }
        if cfg.min_election_timeout >= cfg.max_election_timeout {
            return errinput!("min_election_timeout must be below max_election_timeout");
        }
        if cfg.heartbeat_timeout >= cfg.min_leader_timeout {
            return errinput!("heartbeat_timeout must be below min_leader_timeout");
        }
        if cfg.heartbeat_timeout == 0 {
            return errinput!("heartbeat_timeout must be positive");
        }
        Ok(cfg)
    }
}
