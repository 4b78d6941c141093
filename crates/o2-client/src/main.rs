mod config;
mod session;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};
use o2_core::notify::NotificationBus;
use o2_link::DriverRegistry;

use config::ClientConfig;
use session::Session;

/// Keeps A Link to the Past save state in sync across players.
#[derive(Parser)]
#[command(name = "o2", version)]
struct Args {
    /// Configuration file to load instead of the default location
    #[arg(long)]
    config: Option<PathBuf>,

    /// Relay host name or address
    #[arg(long)]
    host: Option<String>,

    /// Relay UDP port
    #[arg(long)]
    port: Option<u16>,

    /// Group to join on the relay
    #[arg(long)]
    group: Option<String>,

    /// Player name shown to the group
    #[arg(long)]
    name: Option<String>,

    /// Team number; only teammates share state
    #[arg(long)]
    team: Option<u8>,

    /// Device driver to open
    #[arg(long)]
    driver: Option<String>,

    /// Driver-specific device target
    #[arg(long)]
    device: Option<String>,

    /// Relay protocol version
    #[arg(long, value_parser = clap::value_parser!(u8).range(2..=3))]
    protocol: Option<u8>,

    /// Announce merges of fields that have no display names
    #[arg(long)]
    notify_unnamed: bool,

    /// Print the available device drivers and exit
    #[arg(long)]
    list_drivers: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn apply(&self, cfg: &mut ClientConfig) {
        if let Some(host) = &self.host {
            cfg.host = host.clone();
        }
        if let Some(port) = self.port {
            cfg.port = port;
        }
        if let Some(group) = &self.group {
            cfg.group = group.clone();
        }
        if let Some(name) = &self.name {
            cfg.name = name.clone();
        }
        if let Some(team) = self.team {
            cfg.team = team;
        }
        if let Some(driver) = &self.driver {
            cfg.driver = driver.clone();
        }
        if let Some(device) = &self.device {
            cfg.device = device.clone();
        }
        if let Some(protocol) = self.protocol {
            cfg.protocol = protocol;
        }
        if self.notify_unnamed {
            cfg.notify_unnamed = true;
        }
    }
}

fn main() {
    let args = Args::parse();
    let default_filter = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let registry = DriverRegistry::default();
    if args.list_drivers {
        for name in registry.names() {
            println!("{name}");
        }
        return;
    }

    let path = args.config.clone().unwrap_or_else(config::default_config_path);
    let mut cfg = config::load_from_file(&path);
    args.apply(&mut cfg);
    info!(
        "o2: {} in group '{}' via {}:{} (device '{}')",
        if cfg.name.is_empty() { "unnamed player" } else { cfg.name.as_str() },
        cfg.group,
        cfg.host,
        cfg.port,
        cfg.driver
    );

    let bus = Arc::new(NotificationBus::new());
    bus.subscribe(|text| println!("{text}"));

    let session = match Session::open(cfg, &registry, bus) {
        Ok(s) => s,
        Err(e) => {
            error!("o2: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = session.run() {
        error!("o2: session ended: {e}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_the_file() {
        let args = Args::parse_from(["o2", "--group", "race", "--team", "3", "--protocol", "2"]);
        let mut cfg = ClientConfig::default();
        args.apply(&mut cfg);
        assert_eq!(cfg.group, "race");
        assert_eq!(cfg.team, 3);
        assert_eq!(cfg.protocol, 2);
        assert_eq!(cfg.host, ClientConfig::default().host);
    }

    #[test]
    fn protocol_is_range_checked() {
        assert!(Args::try_parse_from(["o2", "--protocol", "4"]).is_err());
    }
}
