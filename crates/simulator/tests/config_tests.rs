//! Integration tests for simulator configuration
//!
//! Tests configuration parsing and persistence, including:
//! - Minimal and full configuration files
//! - Engine tunables passed through to the driver
//! - Invalid configuration handling
//! - Save/load round trips on disk
//!
//! Run with: `cargo test -p simulator --test config_tests`

use simulator::SimulatorConfig;
use std::fs;
use std::path::PathBuf;

mod parsing {
    use super::*;

    const MINIMAL_CONFIG: &str = r#"
[logging]
level = "warn"
"#;

    const FULL_CONFIG: &str = r#"
[logging]
level = "debug"

[engine]
strict_fifo = true
callback_wait_ms = 250
worker_name = "receipt"

[printer]
sessions = 3
receipts = 5
lines_per_receipt = 10
line_delay_ms = 5
failure_rate = 0.05
output_file = "/tmp/receipts.txt"
"#;

    #[test]
    fn test_parse_empty_config_uses_defaults() {
        let config = SimulatorConfig::parse("").unwrap();
        assert_eq!(config, SimulatorConfig::default());
    }

    #[test]
    fn test_parse_minimal_config() {
        let config = SimulatorConfig::parse(MINIMAL_CONFIG).unwrap();
        assert_eq!(config.logging.level, "warn");
        assert_eq!(config.printer.sessions, 2);
        assert_eq!(config.printer.receipts, 3);
        assert!(config.printer.output_file.is_none());
        assert!(!config.engine.strict_fifo);
        assert!(config.engine.callback_wait_ms.is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let config = SimulatorConfig::parse(FULL_CONFIG).unwrap();
        assert_eq!(config.logging.level, "debug");

        assert!(config.engine.strict_fifo);
        assert_eq!(config.engine.callback_wait_ms, Some(250));
        assert_eq!(config.engine.worker_name.as_deref(), Some("receipt"));
        assert!(!config.engine.callback_wait().is_infinite());

        assert_eq!(config.printer.sessions, 3);
        assert_eq!(config.printer.receipts, 5);
        assert_eq!(config.printer.lines_per_receipt, 10);
        assert_eq!(config.printer.line_delay().as_millis(), 5);
        assert!((config.printer.failure_rate - 0.05).abs() < f64::EPSILON);
        assert_eq!(
            config.printer.output_path(),
            Some(PathBuf::from("/tmp/receipts.txt"))
        );
    }

    #[test]
    fn test_partial_printer_section() {
        let config = SimulatorConfig::parse("[printer]\nreceipts = 1\n").unwrap();
        assert_eq!(config.printer.receipts, 1);
        assert_eq!(config.printer.sessions, 2);
        assert_eq!(config.printer.lines_per_receipt, 4);
        assert_eq!(config.printer.line_delay_ms, 25);
    }

    #[test]
    fn test_output_path_expands_home() {
        let config = SimulatorConfig::parse("[printer]\noutput_file = \"~/receipts.txt\"\n").unwrap();
        let path = config.printer.output_path().unwrap();
        assert!(!path.to_string_lossy().starts_with('~'));
        assert!(path.ends_with("receipts.txt"));
    }
}

mod validation {
    use super::*;

    #[test]
    fn test_invalid_log_level() {
        let result = SimulatorConfig::parse("[logging]\nlevel = \"verbose\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_sessions() {
        let result = SimulatorConfig::parse("[printer]\nsessions = 0\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_failure_rate_bounds() {
        assert!(SimulatorConfig::parse("[printer]\nfailure_rate = 1.0\n").is_err());
        assert!(SimulatorConfig::parse("[printer]\nfailure_rate = -0.1\n").is_err());
        assert!(SimulatorConfig::parse("[printer]\nfailure_rate = 0.0\n").is_ok());
        assert!(SimulatorConfig::parse("[printer]\nfailure_rate = 0.99\n").is_ok());
    }

    #[test]
    fn test_zero_callback_wait() {
        let result = SimulatorConfig::parse("[engine]\ncallback_wait_ms = 0\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_malformed_toml() {
        let result = SimulatorConfig::parse("[printer\nsessions = 2\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_wrong_type() {
        let result = SimulatorConfig::parse("[printer]\nsessions = \"two\"\n");
        assert!(result.is_err());
    }
}

mod persistence {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("simulator.toml");

        let mut config = SimulatorConfig::default();
        config.logging.level = "trace".to_string();
        config.engine.strict_fifo = true;
        config.engine.callback_wait_ms = Some(100);
        config.printer.sessions = 4;
        config.printer.failure_rate = 0.5;
        config.printer.output_file = Some("/tmp/out.txt".to_string());

        config.save(&path).unwrap();
        assert!(path.exists());

        let loaded = SimulatorConfig::load(Some(path)).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        let result = SimulatorConfig::load(Some(dir.path().join("absent.toml")));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "[printer]\nsessions = 0\n").unwrap();

        let err = SimulatorConfig::load(Some(path)).unwrap_err();
        assert!(format!("{:#}", err).contains("sessions"));
    }

    #[test]
    fn test_default_path_location() {
        let path = SimulatorConfig::default_path();
        assert!(path.ends_with("pos-runtime/simulator.toml"));
    }
}
