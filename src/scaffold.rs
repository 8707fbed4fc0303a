//! `ydev2db configure`: write a starter configuration file.

use std::path::Path;

use anyhow::{bail, Context, Result};

/// Commented configuration template. Every value is a placeholder that
/// passes validation, so `ydev2db check` works on a fresh file.
pub const CONFIG_TEMPLATE: &str = r#"# ydev2db configuration.

[tunnel]
# Host running the MQTT broker, reached over SSH.
host = "broker.example.com"
port = 22
username = "pi"
# Private key used to log in. Defaults to ~/.ssh/id_rsa.
# key_file = "/home/pi/.ssh/id_ed25519"
# Host keys are trusted on first use and recorded here.
# known_hosts = "/home/pi/.ssh/known_hosts"

[device]
# Topics are <location>/<name>/#.
location = "lab"
name = "meter"

[store]
host = "127.0.0.1"
port = 3306
username = "ydev2db"
password = ""
database = "ydev2db"

[schema]
# Space separated name:TYPE pairs. A TIMESTAMP column is required and is
# filled by the database when a message doesn't carry one.
columns = "TIMESTAMP:TIMESTAMP UNIT_NAME:VARCHAR(64) LOCATION:VARCHAR(64)"

[ingest]
# retry_delay_secs = 10
# poll_interval_ms = 100
# broker_host = "127.0.0.1"
# broker_port = 1883
# Largest MQTT message accepted, in bytes.
# max_packet_size = 1048576
# client_id = "ydev2db-lab"
"#;

/// Write [`CONFIG_TEMPLATE`] to `path`, creating parent directories.
/// Never overwrites an existing file.
pub fn write_config_template(path: &Path) -> Result<()> {
    if path.exists() {
        bail!("Config file already exists: {}", path.display());
    }
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    }
    std::fs::write(path, CONFIG_TEMPLATE)
        .with_context(|| format!("Failed to write config file: {}", path.display()))?;

    println!("Created {}", path.display());
    println!("Edit it, then run: ydev2db --config {} check", path.display());
    Ok(())
}
