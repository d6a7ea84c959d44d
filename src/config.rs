//! Settings of a master session, loadable from a TOML file.

use core::time::Duration;
use std::path::{Path, PathBuf};
use serde::Deserialize;

use crate::{
    cyclic::CycleSettings,
    error::Error,
    };


/**
    master session settings

    every field but `interface` has a default, so a minimal file is

    ```toml
    interface = "eno1"
    descriptions = "/etc/ecmaster/devices"
    period = "1ms"
    exchange_timeout = "500us"
    ```
*/
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    /// network interface the segment is connected to
    pub interface: String,
    /// directory of device description files, see [crate::DescriptionCache::load_dir]
    pub descriptions: Option<PathBuf>,
    /// nominal cycle period
    #[serde(with = "humantime_serde")]
    pub period: Duration,
    /// maximum wait for the reply of one exchange, must not exceed the period
    #[serde(with = "humantime_serde")]
    pub exchange_timeout: Duration,
    /// maximum wait for a device to acknowledge a state change
    #[serde(with = "humantime_serde")]
    pub lifecycle_timeout: Duration,
    /// consecutive failed exchanges before the bus is reported degraded, 0 disables
    pub degraded_threshold: u32,
    /// station address given to the first device, the following ones get the next addresses in bus order
    pub first_address: u16,
    /// run the cyclic engine with realtime scheduling priority
    pub realtime: bool,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            interface: String::new(),
            descriptions: None,
            period: Duration::from_millis(100),
            exchange_timeout: Duration::from_millis(50),
            lifecycle_timeout: Duration::from_secs(5),
            degraded_threshold: 10,
            first_address: 0x1001,
            realtime: false,
        }
    }
}

impl MasterConfig {
    /// default settings on the given interface
    pub fn new(interface: impl Into<String>) -> Self {
        Self {interface: interface.into(), .. Self::default()}
    }
    pub fn from_toml_str(text: &str) -> Result<Self, Error> {
        let config: Self = toml::from_str(text)
            .map_err(|e|  Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_toml_str(&text)
            .map_err(|e|  Error::Config(format!("{}: {}", path.as_ref().display(), e)))?;
        log::debug!("configuration loaded from {}", path.as_ref().display());
        Ok(config)
    }

    /// check the settings are consistent
    pub fn validate(&self) -> Result<(), Error> {
        if self.interface.is_empty()
            {return Err(Error::Config("no network interface given".into()))}
        self.validate_period(self.period)?;
        if self.lifecycle_timeout.is_zero()
            {return Err(Error::Config("lifecycle timeout must not be zero".into()))}
        if self.first_address == 0
            {return Err(Error::Config("station address 0 is reserved".into()))}
        Ok(())
    }
    /// check a cycle period is usable with these settings
    pub fn validate_period(&self, period: Duration) -> Result<(), Error> {
        if period.is_zero()
            {return Err(Error::Config("cycle period must not be zero".into()))}
        if self.exchange_timeout.is_zero() || self.exchange_timeout > period
            {return Err(Error::Config(format!(
                "exchange timeout {:?} must be positive and not exceed the period {:?}",
                self.exchange_timeout, period)))}
        Ok(())
    }

    /// settings of the cyclic engine running at the given period
    pub fn cycle(&self, period: Duration) -> CycleSettings {
        CycleSettings {
            period,
            exchange_timeout: self.exchange_timeout,
            degraded_threshold: self.degraded_threshold,
            realtime: self.realtime,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = MasterConfig::from_toml_str(r#"interface = "eno1""#).unwrap();
        assert_eq!(config, MasterConfig::new("eno1"));
        assert_eq!(config.period, Duration::from_millis(100));
        assert_eq!(config.first_address, 0x1001);
    }

    #[test]
    fn human_durations() {
        let config = MasterConfig::from_toml_str(r#"
            interface = "eno1"
            descriptions = "/tmp/devices"
            period = "1ms"
            exchange_timeout = "500us"
            lifecycle_timeout = "2s"
            realtime = true
            "#).unwrap();
        assert_eq!(config.period, Duration::from_millis(1));
        assert_eq!(config.exchange_timeout, Duration::from_micros(500));
        assert_eq!(config.lifecycle_timeout, Duration::from_secs(2));
        assert_eq!(config.descriptions, Some(PathBuf::from("/tmp/devices")));
        assert!(config.realtime);
    }

    #[test]
    fn inconsistent() {
        assert!(MasterConfig::from_toml_str("").is_err());
        assert!(MasterConfig::from_toml_str(r#"
            interface = "eno1"
            period = "10ms"
            exchange_timeout = "20ms"
            "#).is_err());
        assert!(MasterConfig::from_toml_str(r#"interface = 3"#).is_err());
    }

    #[test]
    fn load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.toml");
        std::fs::write(&path, "interface = \"eno1\"\nperiod = \"2ms\"\nfirst_address = 0x2001\n").unwrap();
        let config = MasterConfig::load(&path).unwrap();
        assert_eq!(config.period, Duration::from_millis(2));
        assert_eq!(config.first_address, 0x2001);

        std::fs::write(&path, "interface = \"eno1\"\nfirst_address = 0\n").unwrap();
        match MasterConfig::load(&path) {
            Err(Error::Config(message)) => assert!(message.contains("master.toml"), "{}", message),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(MasterConfig::load(dir.path().join("missing.toml")), Err(Error::Io(_))));
    }
}
