//! Start the collector at boot through systemd.
//!
//! Without `--user` a user unit is installed under
//! `~/.config/systemd/user`. With `--user <name>` a system unit running as
//! that account is installed under `/etc/systemd/system`, which needs root.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};

pub const UNIT_NAME: &str = "ydev2db.service";

const SYSTEM_UNIT_DIR: &str = "/etc/systemd/system";

/// Where a unit lives and which `systemctl` instance manages it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitLocation {
    pub path: PathBuf,
    pub user_manager: bool,
}

impl UnitLocation {
    pub fn user() -> Result<Self> {
        let dir = dirs::config_dir().context("Cannot determine the user config directory")?;
        Ok(Self {
            path: dir.join("systemd").join("user").join(UNIT_NAME),
            user_manager: true,
        })
    }

    pub fn system() -> Self {
        Self {
            path: Path::new(SYSTEM_UNIT_DIR).join(UNIT_NAME),
            user_manager: false,
        }
    }
}

/// Render the unit file that runs `exe collect` with the given config and
/// optional log file.
pub fn unit_file(exe: &Path, config: &Path, log: Option<&Path>, run_as: Option<&str>) -> String {
    let mut exec = format!("{} --config {}", exec_arg(exe), exec_arg(config));
    if let Some(log) = log {
        exec.push_str(&format!(" --log {}", exec_arg(log)));
    }
    exec.push_str(" collect --progress off");

    let mut unit = String::new();
    unit.push_str("[Unit]\n");
    unit.push_str("Description=ydev2db device data collector\n");
    unit.push_str("After=network-online.target\n");
    unit.push_str("Wants=network-online.target\n\n");
    unit.push_str("[Service]\n");
    if let Some(user) = run_as {
        unit.push_str(&format!("User={}\n", user));
    }
    unit.push_str(&format!("ExecStart={}\n", exec));
    unit.push_str("Restart=on-failure\n");
    unit.push_str("RestartSec=10\n\n");
    unit.push_str("[Install]\n");
    let target = if run_as.is_some() {
        "multi-user.target"
    } else {
        "default.target"
    };
    unit.push_str(&format!("WantedBy={}\n", target));
    unit
}

/// Quote one `ExecStart` argument. systemd expands `%` specifiers and `$`
/// variables, and splits on whitespace outside double quotes.
fn exec_arg(path: &Path) -> String {
    let raw = path.display().to_string();
    let escaped = raw.replace('%', "%%").replace('$', "$$");
    if escaped.chars().any(|c| c.is_whitespace() || c == '"' || c == '\\' || c == '\'') {
        format!("\"{}\"", escaped.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        escaped
    }
}

/// Make a log file path absolute; the service does not run in the
/// current directory. The file itself need not exist yet.
pub fn absolute_log_path(log: &Path) -> Result<PathBuf> {
    let file_name = log
        .file_name()
        .with_context(|| format!("Invalid log file path: {}", log.display()))?;
    let dir = log
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let dir = std::fs::canonicalize(dir)
        .with_context(|| format!("Log directory not found: {}", dir.display()))?;
    Ok(dir.join(file_name))
}

pub fn enable(config: &Path, log: Option<&Path>, run_as: Option<&str>) -> Result<()> {
    let exe = std::env::current_exe().context("Cannot determine the ydev2db executable path")?;
    let config = std::fs::canonicalize(config)
        .with_context(|| format!("Config file not found: {}", config.display()))?;
    let log = log.map(absolute_log_path).transpose()?;
    let location = match run_as {
        Some(_) => UnitLocation::system(),
        None => UnitLocation::user()?,
    };

    if let Some(dir) = location.path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    }
    std::fs::write(&location.path, unit_file(&exe, &config, log.as_deref(), run_as))
        .with_context(|| format!("Failed to write unit file: {}", location.path.display()))?;

    systemctl(location.user_manager, &["daemon-reload"])?;
    systemctl(location.user_manager, &["enable", UNIT_NAME])?;
    println!("Enabled {} ({})", UNIT_NAME, location.path.display());
    Ok(())
}

pub fn disable() -> Result<()> {
    let mut locations = vec![UnitLocation::system()];
    if let Ok(user) = UnitLocation::user() {
        locations.insert(0, user);
    }

    let mut removed = false;
    for location in locations.into_iter().filter(|l| l.path.exists()) {
        systemctl(location.user_manager, &["disable", UNIT_NAME])?;
        std::fs::remove_file(&location.path)
            .with_context(|| format!("Failed to remove unit file: {}", location.path.display()))?;
        systemctl(location.user_manager, &["daemon-reload"])?;
        println!("Disabled {} ({})", UNIT_NAME, location.path.display());
        removed = true;
    }

    if !removed {
        bail!("Autostart is not enabled");
    }
    Ok(())
}

fn systemctl(user_manager: bool, args: &[&str]) -> Result<()> {
    let mut cmd = Command::new("systemctl");
    if user_manager {
        cmd.arg("--user");
    }
    cmd.args(args);

    let output = cmd
        .output()
        .with_context(|| "Failed to execute 'systemctl'. Is systemd available?")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("systemctl {} failed: {}", args.join(" "), stderr.trim());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_unit() {
        let unit = unit_file(
            Path::new("/usr/local/bin/ydev2db"),
            Path::new("/home/pi/ydev2db.toml"),
            None,
            None,
        );
        assert!(unit.contains(
            "ExecStart=/usr/local/bin/ydev2db --config /home/pi/ydev2db.toml collect --progress off\n"
        ));
        assert!(!unit.contains("User="));
        assert!(unit.contains("WantedBy=default.target"));
    }

    #[test]
    fn test_system_unit_runs_as_user_and_logs() {
        let unit = unit_file(
            Path::new("/usr/local/bin/ydev2db"),
            Path::new("/etc/ydev2db.toml"),
            Some(Path::new("/var/log/ydev2db.log")),
            Some("pi"),
        );
        assert!(unit.contains("User=pi\n"));
        assert!(unit.contains("--log /var/log/ydev2db.log collect"));
        assert!(unit.contains("WantedBy=multi-user.target"));
    }

    #[test]
    fn test_paths_with_spaces_are_quoted() {
        let unit = unit_file(
            Path::new("/opt/my tools/ydev2db"),
            Path::new("/home/pi/My Config/ydev2db.toml"),
            Some(Path::new("/var/log/ydev 2db.log")),
            None,
        );
        assert!(unit.contains(
            "ExecStart=\"/opt/my tools/ydev2db\" --config \"/home/pi/My Config/ydev2db.toml\" \
             --log \"/var/log/ydev 2db.log\" collect --progress off\n"
        ));
    }

    #[test]
    fn test_exec_arg_escapes_specifiers_and_quotes() {
        assert_eq!(exec_arg(Path::new("/data/50%/x")), "/data/50%%/x");
        assert_eq!(exec_arg(Path::new("/data/$HOME")), "/data/$$HOME");
        assert_eq!(exec_arg(Path::new("/a b/\"c\"")), "\"/a b/\\\"c\\\"\"");
    }

    #[test]
    fn test_relative_log_path_made_absolute() {
        let tmp = tempfile::TempDir::new().unwrap();
        let log = tmp.path().join("logs");
        std::fs::create_dir_all(&log).unwrap();
        let relative = log.join("..").join("logs").join("ydev2db.log");

        let resolved = absolute_log_path(&relative).unwrap();
        assert!(resolved.is_absolute());
        assert_eq!(
            resolved,
            std::fs::canonicalize(&log).unwrap().join("ydev2db.log")
        );

        let bare = absolute_log_path(Path::new("ydev2db.log")).unwrap();
        assert_eq!(
            bare,
            std::fs::canonicalize(".").unwrap().join("ydev2db.log")
        );
    }

    #[test]
    fn test_system_location() {
        let location = UnitLocation::system();
        assert_eq!(
            location.path,
            PathBuf::from("/etc/systemd/system/ydev2db.service")
        );
        assert!(!location.user_manager);
    }
}
