//! Job options from the config file and the command line.
use anyhow::{Context, Result};
use imprint_core::JobOptions;
use std::fs;
use std::path::{Path, PathBuf};

/// `~/.config/imprint/config.toml` or the platform equivalent.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("imprint").join("config.toml"))
}

/// Where resumable transfer records are kept between runs.
pub fn default_state_dir() -> PathBuf {
    dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join("imprint")
        .join("transfers")
}

/// Parses a TOML document of job options. Missing keys keep their defaults.
pub fn parse_options(text: &str) -> Result<JobOptions> {
    let options: JobOptions = toml::from_str(text)?;
    Ok(options)
}

/// Loads options from `explicit` if given, else from the default config file
/// if it exists, else the built-in defaults.
pub fn load_options(explicit: Option<&Path>) -> Result<JobOptions> {
    let path = match explicit {
        Some(p) => p.to_path_buf(),
        None => match default_config_path() {
            Some(p) if p.is_file() => p,
            _ => return Ok(JobOptions::default()),
        },
    };
    let text = fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let options =
        parse_options(&text).with_context(|| format!("failed to parse {}", path.display()))?;
    log::debug!("loaded job options from {}", path.display());
    Ok(options)
}

/// Command-line switches that take precedence over the config file.
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub no_verify: bool,
    pub chunk_size: Option<u64>,
    pub no_resume: bool,
    pub cancel_all: bool,
    pub pause_all: bool,
    pub max_concurrent: Option<usize>,
    pub allow_fixed: bool,
}

impl Overrides {
    pub fn apply(&self, options: &mut JobOptions) {
        if self.no_verify {
            options.verify = false;
        }
        if let Some(size) = self.chunk_size {
            options.chunk_size_bytes = size;
        }
        if self.no_resume {
            options.resume_if_possible = false;
        }
        if self.cancel_all {
            options.cancel_all_on_first_failure = true;
        }
        if self.pause_all {
            options.pause_all_on_overheat = true;
        }
        if self.max_concurrent.is_some() {
            options.max_concurrent_devices = self.max_concurrent;
        }
        if self.allow_fixed {
            options.require_removable = false;
        }
    }
}

/// Parses sizes such as `4M`, `512K` or `8388608`.
pub fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(i) => s.split_at(i),
        None => (s, ""),
    };
    let value: u64 = digits.parse().map_err(|_| format!("invalid size '{s}'"))?;
    let factor: u64 = match unit.to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1 << 10,
        "M" | "MB" | "MIB" => 1 << 20,
        "G" | "GB" | "GIB" => 1 << 30,
        _ => return Err(format!("unknown size unit '{unit}'")),
    };
    value
        .checked_mul(factor)
        .ok_or_else(|| format!("size '{s}' is too large"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_keeps_defaults() {
        let opts = parse_options("verify = false\nthermal_threshold_warning = 70.0\n").unwrap();
        assert!(!opts.verify);
        assert_eq!(opts.thermal_threshold_warning, 70.0);
        assert_eq!(opts.chunk_size_bytes, JobOptions::default().chunk_size_bytes);
    }

    #[test]
    fn unknown_values_are_errors() {
        assert!(parse_options("verify = \"sometimes\"").is_err());
    }

    #[test]
    fn config_file_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("imprint.toml");
        fs::write(&path, "max_retries = 7\n").unwrap();
        assert_eq!(load_options(Some(&path)).unwrap().max_retries, 7);
        assert!(load_options(Some(&dir.path().join("missing.toml"))).is_err());
    }

    #[test]
    fn command_line_wins() {
        let mut opts = JobOptions::default();
        Overrides {
            no_verify: true,
            chunk_size: Some(8 << 20),
            allow_fixed: true,
            ..Overrides::default()
        }
        .apply(&mut opts);
        assert!(!opts.verify);
        assert_eq!(opts.chunk_size_bytes, 8 << 20);
        assert!(!opts.require_removable);
        assert!(opts.resume_if_possible);
    }

    #[test]
    fn sizes() {
        assert_eq!(parse_size("4M"), Ok(4 << 20));
        assert_eq!(parse_size("512k"), Ok(512 << 10));
        assert_eq!(parse_size("1000"), Ok(1000));
        assert!(parse_size("4X").is_err());
        assert!(parse_size("").is_err());
    }
}
