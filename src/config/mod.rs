use lazy_static::lazy_static;
use log::info;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::prelude::*;
use std::sync::RwLock;

fn radio_chip_default() -> String { return "cc1101".to_string() }
fn radio_polling_interval_default() -> u64 { return 2 }
fn radio_frequency_default() -> f32 { return 868.95 }

#[derive(Deserialize, Serialize, Clone)]
pub struct RadioConfig {
    #[serde(default="radio_chip_default")]
    pub chip: String,
    #[serde(default="radio_polling_interval_default")]
    pub polling_interval_ms: u64,
    #[serde(default="radio_frequency_default")]
    pub frequency_mhz: f32,
}

fn meter_key_default() -> String { return "NOKEY".to_string() }
fn meter_fields_default() -> Vec<String> { return Vec::new() }

#[derive(Deserialize, Serialize, Clone)]
pub struct MeterConfig {
    pub name: String,
    pub driver: String,
    /// id[.M=xxx][.T=xx][.V=xx], `*` wildcards allowed in the id.
    pub address: String,
    #[serde(default="meter_key_default")]
    pub key: String,
    #[serde(default="meter_key_default")]
    pub auth_key: String,
    #[serde(default="meter_fields_default")]
    pub selected_fields: Vec<String>,
    #[serde(default="meter_fields_default")]
    pub extra_constant_fields: Vec<String>,
    #[serde(default="meter_fields_default")]
    pub calculated_fields: Vec<String>,
}

fn output_separator_default() -> char { return ';' }
fn output_pretty_default() -> bool { return false }

#[derive(Deserialize, Serialize, Clone)]
pub struct OutputConfig {
    #[serde(default="output_separator_default")]
    pub separator: char,
    #[serde(default="output_pretty_default")]
    pub pretty_json: bool,
}

fn radio_default() -> RadioConfig {
    return RadioConfig {
        chip: radio_chip_default(),
        polling_interval_ms: radio_polling_interval_default(),
        frequency_mhz: radio_frequency_default(),
    }
}
fn meters_default() -> Vec<MeterConfig> { return Vec::new() }
fn output_default() -> OutputConfig {
    return OutputConfig { separator: output_separator_default(), pretty_json: output_pretty_default() }
}

#[derive(Deserialize, Serialize, Clone)]
pub struct Config {
    #[serde(default="radio_default")]
    pub radio: RadioConfig,
    #[serde(default="meters_default")]
    pub meters: Vec<MeterConfig>,
    #[serde(default="output_default")]
    pub output: OutputConfig,
}

pub struct ConfigHolder {
    pub config: Config,
    pub base_path: String,
}

impl ConfigHolder {
    pub fn load() -> Self {
        let mut bpath = "config/".to_string();
        /* Check for the two paths of the config file */
        let mut file = File::open("config/wmbus2json.yaml");
        if file.is_err() {
            file = Ok(File::open("wmbus2json.yaml")
                .expect("Unable to read the config on config/wmbus2json.yaml or wmbus2json.yaml"));
            bpath = "".to_string();
        }

        let mut file = file.unwrap();

        let mut contents = String::new();
        file.read_to_string(&mut contents).expect("Unable to read config file");
        let c = Self::parse(&contents).expect("Unable to parse config file");
        info!("Configuration loaded with {} meters", c.meters.len());
        return ConfigHolder { config: c, base_path: bpath }
    }

    pub fn parse(contents: &str) -> Result<Config, serde_yml::Error> {
        return serde_yml::from_str(contents);
    }

    pub fn get_complete_config(&self) -> Config {
        return self.config.clone();
    }
}

lazy_static! {
    pub static ref CONFIG: RwLock<Option<ConfigHolder>> = RwLock::new(None);
}

/// Load the configuration file into the global holder. Called once from
/// main before any task starts.
pub fn load_config() {
    let mut holder = CONFIG.write().unwrap();
    *holder = Some(ConfigHolder::load());
}

pub fn get_config() -> Config {
    CONFIG
        .read()
        .unwrap()
        .as_ref()
        .map(|h| h.get_complete_config())
        .expect("configuration not loaded yet")
}

#[cfg(test)]
mod config_tests {
    use super::*;

    #[test]
    fn parse_full_config() {
        let yaml = r#"
radio:
  chip: sx1262
  polling_interval_ms: 5
meters:
  - name: kitchen_water
    driver: iperl
    address: "1234****.M=ELS.T=07"
    key: "0102030405060708090A0B0C0D0E0F11"
    selected_fields: [ total_m3, max_flow_m3h ]
    calculated_fields: [ "approx_l = total_m3 * 1000" ]
  - name: hca
    driver: bfw240radio
    address: "00707788"
output:
  separator: ";"
"#;
        let c = ConfigHolder::parse(yaml).unwrap();
        assert_eq!(c.radio.chip, "sx1262");
        assert_eq!(c.radio.polling_interval_ms, 5);
        assert_eq!(c.radio.frequency_mhz, 868.95);
        assert_eq!(c.meters.len(), 2);
        assert_eq!(c.meters[0].driver, "iperl");
        assert_eq!(c.meters[0].key.len(), 32);
        assert_eq!(c.meters[1].key, "NOKEY");
        assert_eq!(c.output.separator, ';');
        assert!(!c.output.pretty_json);
    }

    #[test]
    fn defaults_kick_in() {
        let c = ConfigHolder::parse("meters: []").unwrap();
        assert_eq!(c.radio.chip, "cc1101");
        assert_eq!(c.radio.polling_interval_ms, 2);
        assert_eq!(c.output.separator, ';');
    }

    #[test]
    fn load_from_tempdir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wmbus2json.yaml");
        std::fs::write(&path, "meters: []\n").unwrap();
        let prev = std::env::current_dir().unwrap();
        std::env::set_current_dir(dir.path()).unwrap();
        let holder = ConfigHolder::load();
        std::env::set_current_dir(prev).unwrap();
        assert!(holder.config.meters.is_empty());
    }
}
