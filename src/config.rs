use crate::error::{Result, TsError};
use crate::format::ts::{PacketLength, DEFAULT_SEARCH_WINDOW};
use std::env;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Config files looked up by [`DemuxConfig::load`], in order.
pub const CONFIG_PATHS: [&str; 2] = ["./tsprobe.toml", "./config.toml"];

/// Inputs that change how a stream is demultiplexed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemuxConfig {
    /// Skip detection and frame the source at this length.
    pub packet_length: Option<PacketLength>,
    /// Re-derive AVCHD arrival stamps written in the packed 300-tick format.
    pub avchd_time_correction: bool,
    /// Hand sections on PIDs unknown to the PAT/PMT to the sink.
    pub capture_generic_psi: bool,
    /// Continuity errors kept per PID for diagnostics.
    pub continuity_history_limit: usize,
    /// Bytes scanned for the first sync run.
    pub search_window: usize,
}

impl Default for DemuxConfig {
    fn default() -> Self {
        Self {
            packet_length: None,
            avchd_time_correction: false,
            capture_generic_psi: true,
            continuity_history_limit: 100,
            search_window: DEFAULT_SEARCH_WINDOW,
        }
    }
}

impl DemuxConfig {
    /// Defaults overridden by the first config file found, then by the
    /// environment.
    pub fn load() -> Self {
        let mut config = Self::default();
        for path in &CONFIG_PATHS {
            match Self::from_file(path) {
                Ok(loaded) => {
                    log::debug!("configuration loaded from {}", path);
                    config = loaded;
                    break;
                }
                Err(TsError::Io(_)) => continue,
                Err(e) => log::warn!("ignoring {}: {}", path, e),
            }
        }
        config.apply_env();
        config
    }

    /// Defaults overridden by `TSPROBE_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Reads `key = value` lines; `#` starts a comment.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut content = String::new();
        File::open(path)?.read_to_string(&mut content)?;
        Self::parse(&content)
    }

    /// Parses `key = value` lines; unknown keys are ignored with a warning.
    pub fn parse(content: &str) -> Result<Self> {
        let mut config = Self::default();
        for line in content.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(TsError::Parser(format!("expected key = value, got {:?}", line)));
            };
            let value = value.trim().trim_matches('"').trim_matches('\'');
            config.set(key.trim(), value)?;
        }
        Ok(config)
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "packet_length" => self.packet_length = parse_packet_length(value)?,
            "avchd_time_correction" => self.avchd_time_correction = parse_bool(key, value)?,
            "capture_generic_psi" => self.capture_generic_psi = parse_bool(key, value)?,
            "continuity_history_limit" => self.continuity_history_limit = parse_number(key, value)?,
            "search_window" => self.search_window = parse_number(key, value)?,
            other => log::warn!("unknown configuration key {:?}", other),
        }
        Ok(())
    }

    fn apply_env(&mut self) {
        let vars = [
            ("TSPROBE_PACKET_LENGTH", "packet_length"),
            ("TSPROBE_AVCHD_FIX", "avchd_time_correction"),
            ("TSPROBE_GENERIC_PSI", "capture_generic_psi"),
        ];
        for (var, key) in vars {
            if let Ok(value) = env::var(var) {
                if let Err(e) = self.set(key, value.trim()) {
                    log::warn!("ignoring {}: {}", var, e);
                }
            }
        }
    }
}

fn parse_packet_length(value: &str) -> Result<Option<PacketLength>> {
    if value.is_empty() || value.eq_ignore_ascii_case("auto") {
        return Ok(None);
    }
    let bytes: usize = parse_number("packet_length", value)?;
    Ok(Some(PacketLength::try_from(bytes)?))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(TsError::Parser(format!("{}: expected a boolean, got {:?}", key, value))),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| TsError::Parser(format!("{}: expected a number, got {:?}", key, value)))
}

/// Creates a default config template file if it doesn't exist
pub fn create_default_config_template<P: AsRef<Path>>(path: P) -> std::io::Result<()> {
    if !path.as_ref().exists() {
        let template = r#"# tsprobe configuration

# 188, 192, 204, 208 or auto
packet_length = auto

# re-derive packed AVCHD arrival time stamps
avchd_time_correction = false

# deliver sections found on PIDs not announced by the PAT/PMT
capture_generic_psi = true

continuity_history_limit = 100
search_window = 5000
"#;
        std::fs::write(path, template)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_overrides() {
        let config = DemuxConfig::parse(
            "packet_length = 192\n# comment\navchd_time_correction = yes\ncapture_generic_psi = \"false\"\n",
        )
        .unwrap();
        assert_eq!(config.packet_length, Some(PacketLength::Avchd192));
        assert!(config.avchd_time_correction);
        assert!(!config.capture_generic_psi);
        assert_eq!(config.search_window, DEFAULT_SEARCH_WINDOW);
    }

    #[test]
    fn test_parse_rejects_bad_values() {
        assert!(matches!(
            DemuxConfig::parse("packet_length = 190"),
            Err(TsError::Framing(_))
        ));
        assert!(DemuxConfig::parse("capture_generic_psi = maybe").is_err());
        assert!(DemuxConfig::parse("search_window").is_err());
    }

    #[test]
    fn test_template_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tsprobe.toml");
        create_default_config_template(&path).unwrap();
        assert_eq!(DemuxConfig::from_file(&path).unwrap(), DemuxConfig::default());
    }
}
