//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use crate::domain::types::{DetectionRoom, RoomId, Rule};
use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    #[serde(default = "default_site_id")]
    pub id: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { id: default_site_id() }
    }
}

fn default_site_id() -> String {
    "detection-line".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlcConfig {
    /// Travel time of simulated cylinders
    #[serde(default = "default_sim_travel_ms")]
    pub sim_travel_ms: u64,
}

impl Default for PlcConfig {
    fn default() -> Self {
        Self { sim_travel_ms: default_sim_travel_ms() }
    }
}

fn default_sim_travel_ms() -> u64 {
    800
}

/// Engine timing and policy knobs
#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    /// Feedback / sensor polling period
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Pause after the safety reset of both cylinder outputs
    #[serde(default = "default_reset_settle_ms")]
    pub reset_settle_ms: u64,
    /// Blocking retract dwell when a room runs in tolerance mode
    #[serde(default = "default_tolerance_dwell_ms")]
    pub tolerance_dwell_ms: u64,
    /// Undetected jobs a room may hold before admission rejects
    #[serde(default = "default_max_undetected_per_room")]
    pub max_undetected_per_room: usize,
    /// Extra actuation attempts before a safety-interlock alarm
    #[serde(default = "default_interlock_retries")]
    pub interlock_retries: u32,
    /// PLC / scanner connection sampling period
    #[serde(default = "default_status_poll_ms")]
    pub status_poll_ms: u64,
    #[serde(default = "default_scan_queue_capacity")]
    pub scan_queue_capacity: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            reset_settle_ms: default_reset_settle_ms(),
            tolerance_dwell_ms: default_tolerance_dwell_ms(),
            max_undetected_per_room: default_max_undetected_per_room(),
            interlock_retries: default_interlock_retries(),
            status_poll_ms: default_status_poll_ms(),
            scan_queue_capacity: default_scan_queue_capacity(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_reset_settle_ms() -> u64 {
    10
}

fn default_tolerance_dwell_ms() -> u64 {
    500
}

fn default_max_undetected_per_room() -> usize {
    3
}

fn default_interlock_retries() -> u32 {
    1
}

fn default_status_poll_ms() -> u64 {
    1000
}

fn default_scan_queue_capacity() -> usize {
    256
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScannerConfig {
    pub room_id: RoomId,
    pub device: String,
    #[serde(default = "default_scanner_baud")]
    pub baud: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_scanner_baud() -> u32 {
    9600
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlarmsConfig {
    /// File path for alarm records (JSONL format)
    #[serde(default = "default_alarm_file")]
    pub file: String,
    #[serde(default = "default_alarm_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for AlarmsConfig {
    fn default() -> Self {
        Self { file: default_alarm_file(), queue_capacity: default_alarm_queue_capacity() }
    }
}

fn default_alarm_file() -> String {
    "alarms.jsonl".to_string()
}

fn default_alarm_queue_capacity() -> usize {
    256
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeclareConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_declare_port")]
    pub port: u16,
}

impl Default for DeclareConfig {
    fn default() -> Self {
        Self { enabled: true, port: default_declare_port() }
    }
}

fn default_declare_port() -> u16 {
    25900
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval() }
    }
}

fn default_metrics_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CatalogConfig {
    /// Re-read rooms and rules from the config file (0 to disable)
    #[serde(default)]
    pub reload_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub plc: PlcConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub scanners: Vec<ScannerConfig>,
    #[serde(default)]
    pub rooms: Vec<DetectionRoom>,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub alarms: AlarmsConfig,
    #[serde(default)]
    pub declare: DeclareConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
}

/// Engine settings derived from `[control]`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlSettings {
    pub poll_interval: Duration,
    pub reset_settle: Duration,
    pub tolerance_dwell: Duration,
    pub max_undetected_per_room: usize,
    pub interlock_retries: u32,
}

impl Default for ControlSettings {
    fn default() -> Self {
        ControlConfig::default().settings()
    }
}

impl ControlConfig {
    pub fn settings(&self) -> ControlSettings {
        ControlSettings {
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            reset_settle: Duration::from_millis(self.reset_settle_ms),
            tolerance_dwell: Duration::from_millis(self.tolerance_dwell_ms),
            max_undetected_per_room: self.max_undetected_per_room,
            interlock_retries: self.interlock_retries,
        }
    }
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    sim_travel_ms: u64,
    control: ControlConfig,
    scanners: Vec<ScannerConfig>,
    rooms: Vec<DetectionRoom>,
    rules: Vec<Rule>,
    alarm_file: String,
    alarm_queue_capacity: usize,
    declare_enabled: bool,
    declare_port: u16,
    metrics_interval_secs: u64,
    catalog_reload_interval_secs: u64,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            site_id: default_site_id(),
            sim_travel_ms: default_sim_travel_ms(),
            control: ControlConfig::default(),
            scanners: Vec::new(),
            rooms: Vec::new(),
            rules: Vec::new(),
            alarm_file: default_alarm_file(),
            alarm_queue_capacity: default_alarm_queue_capacity(),
            declare_enabled: true,
            declare_port: default_declare_port(),
            metrics_interval_secs: default_metrics_interval(),
            catalog_reload_interval_secs: 0,
            config_file: "default".to_string(),
        }
    }
}

impl Config {
    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(Self::from_toml(toml_config, &path.display().to_string()))
    }

    fn from_toml(toml_config: TomlConfig, config_file: &str) -> Self {
        Self {
            site_id: toml_config.site.id,
            sim_travel_ms: toml_config.plc.sim_travel_ms,
            control: toml_config.control,
            scanners: toml_config.scanners,
            rooms: toml_config.rooms,
            rules: toml_config.rules,
            alarm_file: toml_config.alarms.file,
            alarm_queue_capacity: toml_config.alarms.queue_capacity,
            declare_enabled: toml_config.declare.enabled,
            declare_port: toml_config.declare.port,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            catalog_reload_interval_secs: toml_config.catalog.reload_interval_secs,
            config_file: config_file.to_string(),
        }
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {:#}. Using defaults.", e);
                Self::default()
            }
        }
    }

    /// Room by id
    pub fn room(&self, room_id: RoomId) -> Option<&DetectionRoom> {
        self.rooms.iter().find(|r| r.id == room_id)
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn sim_travel_ms(&self) -> u64 {
        self.sim_travel_ms
    }

    pub fn control(&self) -> ControlSettings {
        self.control.settings()
    }

    pub fn status_poll_ms(&self) -> u64 {
        self.control.status_poll_ms
    }

    pub fn scan_queue_capacity(&self) -> usize {
        self.control.scan_queue_capacity
    }

    pub fn scanners(&self) -> &[ScannerConfig] {
        &self.scanners
    }

    pub fn rooms(&self) -> &[DetectionRoom] {
        &self.rooms
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn alarm_file(&self) -> &str {
        &self.alarm_file
    }

    pub fn alarm_queue_capacity(&self) -> usize {
        self.alarm_queue_capacity
    }

    pub fn declare_enabled(&self) -> bool {
        self.declare_enabled
    }

    pub fn declare_port(&self) -> u16 {
        self.declare_port
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn catalog_reload_interval_secs(&self) -> u64 {
        self.catalog_reload_interval_secs
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to set rooms and rules
    pub fn with_catalog(mut self, rooms: Vec<DetectionRoom>, rules: Vec<Rule>) -> Self {
        self.rooms = rooms;
        self.rules = rules;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.site_id(), "detection-line");
        assert_eq!(config.alarm_file(), "alarms.jsonl");
        assert_eq!(config.declare_port(), 25900);
        assert_eq!(config.status_poll_ms(), 1000);
        assert!(config.rooms().is_empty());

        let control = config.control();
        assert_eq!(control.poll_interval, Duration::from_millis(100));
        assert_eq!(control.reset_settle, Duration::from_millis(10));
        assert_eq!(control.tolerance_dwell, Duration::from_millis(500));
        assert_eq!(control.max_undetected_per_room, 3);
        assert_eq!(control.interlock_retries, 1);
    }

    #[test]
    fn test_zero_poll_interval_is_clamped() {
        let control = ControlConfig { poll_interval_ms: 0, ..Default::default() };
        assert_eq!(control.settings().poll_interval, Duration::from_millis(1));
    }

    #[test]
    fn test_resolve_config_path_default() {
        let args: Vec<String> = vec!["detection-gateway".to_string()];
        if env::var("CONFIG_FILE").is_err() {
            assert_eq!(Config::resolve_config_path(&args), "config/dev.toml");
        }
    }

    #[test]
    fn test_resolve_config_path_from_arg() {
        let args: Vec<String> = vec![
            "detection-gateway".to_string(),
            "--config".to_string(),
            "config/line2.toml".to_string(),
        ];
        assert_eq!(Config::resolve_config_path(&args), "config/line2.toml");
    }

    #[test]
    fn test_resolve_config_path_from_arg_equals() {
        let args: Vec<String> =
            vec!["detection-gateway".to_string(), "--config=config/line3.toml".to_string()];
        assert_eq!(Config::resolve_config_path(&args), "config/line3.toml");
    }

    #[test]
    fn test_room_lookup() {
        let config = Config::default()
            .with_catalog(vec![DetectionRoom::new(1, "A"), DetectionRoom::new(2, "B")], vec![]);
        assert_eq!(config.room(RoomId(2)).map(|r| r.name.as_str()), Some("B"));
        assert!(config.room(RoomId(3)).is_none());
    }
}
