use log::warn;
use o2_core::alttp::RomRegion;
use o2_core::game::GameOptions;
use o2_core::sync::SyncFlags;
use o2_link::RelaySettings;
use o2_link::protocol::{DEFAULT_PORT, ProtocolVersion};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Region {
    #[default]
    NorthAmerica,
    Japan,
}

impl From<Region> for RomRegion {
    fn from(r: Region) -> Self {
        match r {
            Region::NorthAmerica => RomRegion::NorthAmerica,
            Region::Japan => RomRegion::Japan,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub items: bool,
    pub small_keys: bool,
    pub underworld: bool,
    pub overworld: bool,
    pub progress: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let f = SyncFlags::default();
        Self {
            items: f.items,
            small_keys: f.small_keys,
            underworld: f.underworld,
            overworld: f.overworld,
            progress: f.progress,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub group: String,
    pub name: String,
    pub team: u8,
    /// Device driver name, see `--list-drivers`.
    pub driver: String,
    /// Driver-specific device target, e.g. a serial port.
    pub device: String,
    /// Relay protocol version, 2 or 3.
    pub protocol: u8,
    pub region: Region,
    /// BGR555 tunic color applied to the local player.
    pub tunic_color: Option<u16>,
    /// Announce merges of fields that have no display names.
    pub notify_unnamed: bool,
    pub sync: SyncConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "alttp.online".to_string(),
            port: DEFAULT_PORT,
            group: "lttp".to_string(),
            name: String::new(),
            team: 0,
            driver: "mock".to_string(),
            device: String::new(),
            protocol: ProtocolVersion::default().id(),
            region: Region::default(),
            tunic_color: None,
            notify_unnamed: false,
            sync: SyncConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn protocol_version(&self) -> ProtocolVersion {
        ProtocolVersion::from_id(self.protocol).unwrap_or_else(|| {
            warn!(
                "config: unknown protocol {}; using {}",
                self.protocol,
                ProtocolVersion::default().id()
            );
            ProtocolVersion::default()
        })
    }

    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            host: self.host.clone(),
            port: self.port,
            group: self.group.clone(),
            version: self.protocol_version(),
        }
    }

    pub fn game_options(&self) -> GameOptions {
        let s = &self.sync;
        GameOptions {
            sync: SyncFlags {
                items: s.items,
                small_keys: s.small_keys,
                underworld: s.underworld,
                overworld: s.overworld,
                progress: s.progress,
            },
            notify_unnamed: self.notify_unnamed,
            region: self.region.into(),
            tunic_color: self.tunic_color,
        }
    }
}

pub fn default_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        if let Some(appdata) = std::env::var_os("APPDATA") {
            return PathBuf::from(appdata).join("o2").join("o2.toml");
        }
    }

    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("o2").join("o2.toml");
    }

    if let Some(home) = std::env::var_os("HOME") {
        return PathBuf::from(home).join(".config").join("o2").join("o2.toml");
    }

    PathBuf::from("o2.toml")
}

pub fn load_from_file(path: &Path) -> ClientConfig {
    let text = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(_) => return ClientConfig::default(),
    };

    match toml::from_str::<ClientConfig>(&text) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!(
                "config: failed to parse {}: {e}; using defaults",
                path.display()
            );
            ClientConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_from_file(&dir.path().join("absent.toml"));
        assert_eq!(cfg, ClientConfig::default());
        assert_eq!(cfg.port, 4590);
        assert!(!cfg.notify_unnamed);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
group = "speedrun"
team = 2
protocol = 2
region = "japan"
tunic_color = 0x7fff

[sync]
small_keys = false
"#
        )
        .unwrap();
        let cfg = load_from_file(file.path());
        assert_eq!(cfg.group, "speedrun");
        assert_eq!(cfg.team, 2);
        assert_eq!(cfg.host, "alttp.online");
        assert_eq!(cfg.protocol_version(), ProtocolVersion::V02);
        assert_eq!(cfg.region, Region::Japan);
        assert!(!cfg.sync.small_keys);
        assert!(cfg.sync.items);
        assert_eq!(cfg.tunic_color, Some(0x7FFF));

        let opts = cfg.game_options();
        assert!(!opts.sync.small_keys);
        assert_eq!(opts.region, RomRegion::Japan);
    }

    #[test]
    fn malformed_file_yields_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "port = \"not a number\"").unwrap();
        assert_eq!(load_from_file(file.path()), ClientConfig::default());
    }

    #[test]
    fn unknown_protocol_falls_back() {
        let cfg = ClientConfig {
            protocol: 9,
            ..ClientConfig::default()
        };
        assert_eq!(cfg.relay_settings().version, ProtocolVersion::V03);
    }
}
