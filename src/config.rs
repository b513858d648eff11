use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub udp: UdpConfig,
    pub lorawan: LorawanConfig,
    pub testengine: TestEngineConfig,
    pub scheduler: SchedulerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct UdpConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize)]
pub struct LorawanConfig {
    pub decrypt_payload: bool,
}

/// Test-engine bootstrap knobs (spec §4.8/§6). The DUT's identity and keys
/// normally come from the operator at session start (out of scope per spec
/// §1's "no Web UI"); these are the headless defaults a CLI run falls back to.
#[derive(Debug, Deserialize)]
pub struct TestEngineConfig {
    pub dev_eui: String,
    pub app_key: String,
    /// Per-step timeout (seconds) before a `TimeOutError` fails the case.
    pub step_timeout_secs: u64,
    /// Ordered list of test-case names to run this session (spec §4.8's
    /// `requested_tests`, minus the always-prepended activate/deactivate pair
    /// which the coordinator adds itself).
    pub test_cases: Vec<String>,
}

/// Downlink scheduler bootstrap knobs (spec §10/C10).
#[derive(Debug, Deserialize)]
pub struct SchedulerConfig {
    /// Devices the scheduler accepts Join-Requests from, keyed by DevEUI hex.
    pub known_devices: Vec<KnownDevice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KnownDevice {
    pub dev_eui: String,
    pub app_key: String,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {:?}: {}", path, e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file: {}", e))?;
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            udp: UdpConfig { bind: "0.0.0.0:1680".to_string() },
            lorawan: LorawanConfig { decrypt_payload: false },
            testengine: TestEngineConfig {
                dev_eui: "0102030405060708".to_string(),
                app_key: "2b7e151628aed2a6abf7158809cf4f3c".to_string(),
                step_timeout_secs: 10,
                test_cases: vec![
                    "td_lorawan_act_01".to_string(),
                    "td_lorawan_fun_01".to_string(),
                    "td_lorawan_mac_01".to_string(),
                ],
            },
            scheduler: SchedulerConfig { known_devices: Vec::new() },
            logging: LoggingConfig { level: "info".to_string() },
        }
    }
}
