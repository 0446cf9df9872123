use std::path::PathBuf;

use clap::{App, Arg};
use log::error;

use porto::config::{Config, CONFIG_PATH};
use porto::daemon::Daemon;

fn main() {
    let matches = App::new("portod")
        .about("Linux container management daemon")
        .arg(
            Arg::with_name("config")
                .long("config")
                .short("c")
                .takes_value(true)
                .help("Path to the configuration file"),
        )
        .arg(
            Arg::with_name("socket")
                .long("socket")
                .takes_value(true)
                .help("Override the RPC socket path"),
        )
        .arg(
            Arg::with_name("verbose")
                .long("verbose")
                .short("v")
                .multiple(true)
                .help("More logging; repeat for debug"),
        )
        .get_matches();

    let level = match matches.occurrences_of("verbose") {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();

    if !nix::unistd::geteuid().is_root() {
        error!("portod must run as root");
        std::process::exit(1);
    }

    let config_path = matches
        .value_of("config")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(CONFIG_PATH));
    let mut config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("cannot load config: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(socket) = matches.value_of("socket") {
        config.daemon.rpc_socket = PathBuf::from(socket);
    }

    let daemon = match Daemon::new(config) {
        Ok(daemon) => daemon,
        Err(e) => {
            error!("cannot initialize daemon: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = daemon.run() {
        error!("daemon failed: {}", e);
        std::process::exit(1);
    }
}
