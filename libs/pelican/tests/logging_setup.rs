//! Host logging installed from a device configuration file
//!
//! Kept in its own test binary: the subscriber is process-global.

use pelican::{CanError, DeviceConfig};
use tempfile::TempDir;

#[test]
fn test_config_file_drives_logging() {
    let temp_dir = TempDir::new().unwrap();
    let log_dir = temp_dir.path().join("logs");
    let config_path = temp_dir.path().join("device.yaml");
    std::fs::write(
        &config_path,
        format!(
            "bitrate_kbps: 500\nlog:\n  level: debug\n  console: false\n  file: {}\n",
            log_dir.join("pelican.log").display()
        ),
    )
    .unwrap();

    let config = DeviceConfig::from_file(&config_path).unwrap();
    let guard = config.init_logging().unwrap();
    assert!(guard.is_some());

    tracing::info!("bus up at {} kbit/s", config.bitrate_kbps);
    drop(guard);

    let written: Vec<_> = std::fs::read_dir(&log_dir)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with("pelican.log"))
        .collect();
    assert_eq!(written.len(), 1);
    let contents = std::fs::read_to_string(written[0].path()).unwrap();
    assert!(contents.contains("bus up at 500 kbit/s"));

    // A second subscriber is refused rather than silently replacing the first
    let again = config.init_logging();
    assert!(matches!(
        again,
        Err(CanError::Config(pelican_common::Error::Logging(_)))
    ));
}
