//! Runs an in-process raftkv cluster, with one server per configured listen
//! address, serving clients over TCP.

#![warn(clippy::all)]

use raftkv::raft::Cluster;
use raftkv::{Result, Server};

use serde_derive::Deserialize;
use std::sync::Arc;

fn main() -> Result<()> {
    let args = clap::command!()
        .about("Runs an in-process raftkv cluster, serving clients over TCP.")
        .arg(
            clap::Arg::new("config")
                .short('c')
                .long("config")
                .help("Configuration file path")
                .default_value("raftkv.yaml"),
        )
        .get_matches();
    let config = Config::load(args.get_one::<String>("config").expect("defaulted"))?;

    let loglevel = config.log_level.parse::<simplelog::LevelFilter>()?;
    let mut logconfig = simplelog::ConfigBuilder::new();
    if loglevel != simplelog::LevelFilter::Debug {
        logconfig.add_filter_allow_str("raftkv");
    }
    simplelog::SimpleLogger::init(loglevel, logconfig.build())?;

    let addrs: Vec<String> =
        config.listen.split(',').map(|addr| addr.trim().to_string()).collect();
    let compact_threshold =
        (config.compact_threshold > 0).then_some(config.compact_threshold as u64);

    let cluster = Cluster::new(addrs.len());
    let mut servers = Vec::new();
    for (id, addr) in addrs.into_iter().enumerate() {
        let (node, commits) = cluster.connect(id)?;
        let server = Arc::new(Server::new(Arc::new(node), commits, compact_threshold)?);
        let listener = std::net::TcpListener::bind(addr)?;
        servers.push((server, listener));
    }
    std::thread::scope(move |s| {
        for (server, listener) in servers {
            s.spawn(move || server.serve(listener).expect("server failed"));
        }
    });
    Ok(())
}

/// The server configuration. Values can be given in the config file, or as
/// environment variables prefixed with RAFTKV_.
#[derive(Debug, Deserialize)]
struct Config {
    /// Comma-separated listen addresses, one cluster node per address.
    listen: String,
    /// The log level: error, warn, info, debug, or trace.
    log_level: String,
    /// The consensus log size in bytes above which a snapshot is taken.
    /// 0 or negative disables snapshotting.
    compact_threshold: i64,
}

impl Config {
    fn load(file: &str) -> Result<Self> {
        Ok(config::Config::builder()
            .set_default("listen", "127.0.0.1:9605,127.0.0.1:9606,127.0.0.1:9607")?
            .set_default("log_level", "info")?
            .set_default("compact_threshold", 1024 * 1024_i64)?
            .add_source(config::File::with_name(file).required(false))
            .add_source(config::Environment::with_prefix("RAFTKV"))
            .build()?
            .try_deserialize()?)
    }
}
