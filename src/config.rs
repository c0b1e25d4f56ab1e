//! Static process configuration.
//!
//! Loaded once at start up from the command line, with every option also settable via an `RTCACHE_*` environment
//! variable.
use clap::Parser;
use fieldx::fxstruct;
use garde::Validate;
use std::ffi::OsString;
use std::fmt::Display;
use std::time::Duration;

use crate::error::Result;
use crate::lifecycle::InstanceSpec;
use crate::lifecycle::Schedule;
use crate::lifecycle::Tier;
use crate::types::FillMode;
use crate::types::WriteMode;

#[derive(Debug, Clone, clap::Parser, Validate)]
#[fxstruct(no_new, get(copy))]
#[clap(about, version, name = "rt-cache")]
pub struct Config {
    /// Address of the cache instance.
    #[clap(long, env = "RTCACHE_CACHE_HOST", default_value = "10.0.0.3")]
    #[fieldx(get(clone))]
    #[garde(length(min = 1))]
    cache_host: String,

    #[clap(long, env = "RTCACHE_CACHE_PORT", default_value_t = 6379)]
    #[garde(range(min = 1))]
    cache_port: u16,

    /// Name of the cache instance the lifecycle scheduler creates and deletes.
    #[clap(long, env = "RTCACHE_INSTANCE_NAME", default_value = "edis-zero-to-prod")]
    #[fieldx(get(clone))]
    #[garde(length(min = 1))]
    instance_name: String,

    #[clap(long, env = "RTCACHE_TIER", value_enum, default_value_t = Tier::Basic)]
    #[garde(skip)]
    tier: Tier,

    #[clap(long, env = "RTCACHE_MEMORY_SIZE_GB", default_value_t = 1)]
    #[garde(range(min = 1))]
    memory_size_gb: u32,

    /// Document store collection holding the records.
    #[clap(long, env = "RTCACHE_COLLECTION", default_value = "orders")]
    #[fieldx(get(clone))]
    #[garde(length(min = 1))]
    collection: String,

    #[clap(long, env = "RTCACHE_WRITE_MODE", value_enum, default_value_t = WriteMode::Versioned)]
    #[garde(skip)]
    write_mode: WriteMode,

    #[clap(long, env = "RTCACHE_FILL_MODE", value_enum, default_value_t = FillMode::Background)]
    #[garde(skip)]
    fill_mode: FillMode,

    /// Upper bound for a single cache operation, in milliseconds.
    #[clap(long, env = "RTCACHE_CACHE_TIMEOUT_MS", default_value_t = 250)]
    #[garde(range(min = 1))]
    cache_timeout_ms: u64,

    /// Upper bound for a record store lookup, in milliseconds.
    #[clap(long, env = "RTCACHE_STORE_TIMEOUT_MS", default_value_t = 5_000)]
    #[garde(range(min = 1))]
    store_timeout_ms: u64,

    /// How often the cache liveness is probed, in milliseconds.
    #[clap(long, env = "RTCACHE_PROBE_INTERVAL_MS", default_value_t = 1_000)]
    #[garde(range(min = 1))]
    probe_interval_ms: u64,

    /// Hour of the day the cache instance gets created on weekdays.
    #[clap(long, env = "RTCACHE_PROVISION_HOUR", default_value_t = 7)]
    #[garde(range(max = 23))]
    provision_hour: u32,

    /// Hour of the day the cache instance gets deleted on weekdays.
    #[clap(long, env = "RTCACHE_DEPROVISION_HOUR", default_value_t = 19)]
    #[garde(range(max = 23), custom(Self::greater_than("provision-hour", &self.provision_hour)))]
    deprovision_hour: u32,
}

impl Config {
    fn greater_than<'a, T: PartialOrd + Display>(
        min_name: &'static str,
        min: &'a T,
    ) -> impl FnOnce(&'a T, &()) -> garde::Result {
        move |value, _| {
            if value <= min {
                Err(garde::Error::new(format!(
                    "{} is not past {min_name} ({})",
                    *value, *min
                )))
            }
            else {
                Ok(())
            }
        }
    }

    /// Parse and validate the process arguments and environment.
    pub fn load() -> Result<Self> {
        Self::from_args(std::env::args_os())
    }

    pub fn from_args<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let config = Self::try_parse_from(args)?;
        config.validate()?;
        Ok(config)
    }

    pub fn cache_url(&self) -> String {
        format!("redis://{}:{}", self.cache_host, self.cache_port)
    }

    pub fn cache_timeout(&self) -> Duration {
        Duration::from_millis(self.cache_timeout_ms)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn instance_spec(&self) -> Result<InstanceSpec> {
        Ok(InstanceSpec::builder()
            .name(self.instance_name.clone())
            .tier(self.tier)
            .memory_size_gb(self.memory_size_gb)
            .build()?)
    }

    pub fn schedule(&self) -> Result<Schedule> {
        Schedule::at_hours(self.provision_hour, self.deprovision_hour)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn defaults() {
        let config = Config::from_args(["rt-cache"]).unwrap();

        assert_eq!(config.cache_url(), "redis://10.0.0.3:6379");
        assert_eq!(config.instance_name(), "edis-zero-to-prod");
        assert_eq!(config.collection(), "orders");
        assert_eq!(config.write_mode(), WriteMode::Versioned);
        assert_eq!(config.fill_mode(), FillMode::Background);
        assert_eq!(config.cache_timeout(), Duration::from_millis(250));
        assert_eq!(config.store_timeout(), Duration::from_secs(5));

        let spec = config.instance_spec().unwrap();
        assert_eq!(spec.tier(), Tier::Basic);
        assert_eq!(spec.memory_size_gb(), 1);
        assert_eq!(config.schedule().unwrap(), Schedule::default());
    }

    #[test]
    fn overrides() {
        let config = Config::from_args([
            "rt-cache",
            "--cache-host",
            "cache.internal",
            "--cache-port",
            "6380",
            "--write-mode",
            "last-arrival",
            "--fill-mode",
            "inline",
            "--tier",
            "standard-ha",
        ])
        .unwrap();

        assert_eq!(config.cache_url(), "redis://cache.internal:6380");
        assert_eq!(config.write_mode(), WriteMode::LastArrival);
        assert_eq!(config.fill_mode(), FillMode::Inline);
        assert_eq!(config.tier(), Tier::StandardHa);
    }

    #[test]
    fn schedule_hours_are_checked() {
        let err = Config::from_args(["rt-cache", "--provision-hour", "20"]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        assert!(matches!(
            Config::from_args(["rt-cache", "--deprovision-hour", "24"]),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Config::from_args(["rt-cache", "--cache-port", "not-a-port"]),
            Err(Error::Cli(_))
        ));
    }
}
