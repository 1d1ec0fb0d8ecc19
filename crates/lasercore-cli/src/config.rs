//! Startup configuration file – `~/.lasercore/config.toml`.
//!
//! The file holds a serialised [`StartupConfig`]. A missing file is written
//! with defaults on first run. `LASERCORE_*` variables then override
//! individual fields, and the result is validated once. Nothing reads the
//! environment after this.

use std::fs;
use std::path::{Path, PathBuf};

use lasercore_types::{ConfigError, StartupConfig};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigFileError {
    #[error("cannot access {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("cannot serialise configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error(transparent)]
    Invalid(#[from] ConfigError),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ConfigFileError + '_ {
    move |source| ConfigFileError::Io {
        path: path.display().to_string(),
        source,
    }
}

pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".lasercore").join("config.toml")
}

/// How the configuration was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Loaded,
    /// No file existed; defaults were written.
    Created,
}

/// Load (or create) the file, apply environment overrides, validate.
pub fn load_startup() -> Result<(StartupConfig, Origin), ConfigFileError> {
    load_or_create(&config_path(), |key| std::env::var(key).ok())
}

pub(crate) fn load_or_create(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> Result<(StartupConfig, Origin), ConfigFileError> {
    let (mut config, origin) = match load_from(path)? {
        Some(config) => (config, Origin::Loaded),
        None => {
            let config = StartupConfig::default();
            save_to(&config, path)?;
            (config, Origin::Created)
        }
    };
    apply_overrides(&mut config, env);
    config.validate()?;
    Ok((config, origin))
}

pub(crate) fn load_from(path: &Path) -> Result<Option<StartupConfig>, ConfigFileError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(io_error(path))?;
    toml::from_str(&raw)
        .map(Some)
        .map_err(|source| ConfigFileError::Parse {
            path: path.display().to_string(),
            source,
        })
}

/// Apply `LASERCORE_*` overrides looked up through `env`.
///
/// | Variable | Field |
/// |---|---|
/// | `LASERCORE_SIMULATE` | `simulate` (`1`/`true`/`yes`) |
/// | `LASERCORE_LASER_PORT` | `laser.channel` |
/// | `LASERCORE_THERMAL_PORT` | `thermal.channel` |
/// | `LASERCORE_ACTUATOR_PORT` | `actuator.channel` |
/// | `LASERCORE_INTERLOCK_PORT` | `interlock.channel` |
/// | `LASERCORE_AUDIT_LOG` | `audit_log` |
///
/// Enabling simulation without explicit ports points every device at its
/// simulated channel.
pub fn apply_overrides(config: &mut StartupConfig, env: impl Fn(&str) -> Option<String>) {
    if let Some(v) = env("LASERCORE_SIMULATE") {
        let on = matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on");
        if on && !config.simulate {
            let sim = StartupConfig::simulated();
            config.laser.channel = sim.laser.channel;
            config.thermal.channel = sim.thermal.channel;
            config.actuator.channel = sim.actuator.channel;
            config.interlock.channel = sim.interlock.channel;
        }
        config.simulate = on;
    }
    for (key, channel) in [
        ("LASERCORE_LASER_PORT", &mut config.laser.channel),
        ("LASERCORE_THERMAL_PORT", &mut config.thermal.channel),
        ("LASERCORE_ACTUATOR_PORT", &mut config.actuator.channel),
        ("LASERCORE_INTERLOCK_PORT", &mut config.interlock.channel),
    ] {
        if let Some(v) = env(key).filter(|v| !v.trim().is_empty()) {
            *channel = v;
        }
    }
    if let Some(v) = env("LASERCORE_AUDIT_LOG").filter(|v| !v.trim().is_empty()) {
        config.audit_log = Some(PathBuf::from(v));
    }
}

pub(crate) fn save_to(config: &StartupConfig, path: &Path) -> Result<(), ConfigFileError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_error(parent))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(io_error(parent))?;
        }
    }
    let raw = toml::to_string_pretty(config)?;
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(io_error(path))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(io_error(path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn first_run_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = config_path_for_home(&dir.path().to_string_lossy());
        let (config, origin) = load_or_create(&path, env_of(&[])).unwrap();
        assert_eq!(origin, Origin::Created);
        assert_eq!(config, StartupConfig::default());
        assert!(path.exists());

        let (_, origin) = load_or_create(&path, env_of(&[])).unwrap();
        assert_eq!(origin, Origin::Loaded);
    }

    #[cfg(unix)]
    #[test]
    fn config_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = config_path_for_home(&dir.path().to_string_lossy());
        save_to(&StartupConfig::default(), &path).unwrap();
        let file_mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        let dir_mode = fs::metadata(path.parent().unwrap()).unwrap().permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn partial_files_fill_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "simulate = true\n[engine]\nmax_retries = 5\n").unwrap();
        let config = load_from(&path).unwrap().unwrap();
        assert!(config.simulate);
        assert_eq!(config.engine.max_retries, 5);
        assert_eq!(config.engine.ramp_step_ms, 100);
        assert_eq!(config.watchdog.timeout_ms, 1000);
    }

    #[test]
    fn unparsable_file_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "simulate = maybe").unwrap();
        let err = load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigFileError::Parse { .. }));
        assert!(err.to_string().contains("config.toml"));
    }

    #[test]
    fn simulate_override_switches_channels() {
        let mut config = StartupConfig::default();
        apply_overrides(&mut config, env_of(&[("LASERCORE_SIMULATE", "1")]));
        assert!(config.simulate);
        assert_eq!(config.laser.channel, "sim:laser");
        assert_eq!(config.interlock.channel, "sim:interlock");
    }

    #[test]
    fn port_overrides_win() {
        let mut config = StartupConfig::default();
        apply_overrides(
            &mut config,
            env_of(&[
                ("LASERCORE_LASER_PORT", "/dev/ttyUSB7"),
                ("LASERCORE_INTERLOCK_PORT", "/dev/ttyACM3"),
                ("LASERCORE_AUDIT_LOG", "/var/log/lasercore/audit.jsonl"),
            ]),
        );
        assert_eq!(config.laser.channel, "/dev/ttyUSB7");
        assert_eq!(config.interlock.channel, "/dev/ttyACM3");
        assert_eq!(config.actuator.channel, StartupConfig::default().actuator.channel);
        assert_eq!(
            config.audit_log.as_deref(),
            Some(Path::new("/var/log/lasercore/audit.jsonl"))
        );
    }

    #[test]
    fn invalid_values_are_refused_at_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[watchdog]\nheartbeat_period_ms = 500\ntimeout_ms = 400\n").unwrap();
        let err = load_or_create(&path, env_of(&[])).unwrap_err();
        assert!(matches!(err, ConfigFileError::Invalid(_)));
    }

    #[test]
    fn path_lives_under_dot_lasercore() {
        let p = config_path_for_home("/home/operator");
        assert_eq!(p, PathBuf::from("/home/operator/.lasercore/config.toml"));
    }
}
