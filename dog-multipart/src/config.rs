use std::ffi::OsString;
use std::time::Duration;

use crate::{MultipartError, MultipartResult};

/// Limits and timing for multipart uploads
#[derive(Debug, Clone)]
pub struct MultipartConfig {
    /// Upper bound on the number of parts; valid indices are `0..max_parts`
    pub max_parts: u32,

    /// Every part except the last must be at least this many bytes
    pub min_part_size: u64,

    /// Parts must be strictly smaller than this (exclusive bound)
    pub max_part_size: u64,

    /// How often the reaper sweeps expired uploads
    pub reaper_interval: Duration,
}

impl Default for MultipartConfig {
    fn default() -> Self {
        Self {
            max_parts: 400,
            min_part_size: 5 * 1024 * 1024, // 5MB
            max_part_size: (1 << 32) - 1,   // sizes are indexed as u32
            reaper_interval: Duration::from_secs(60),
        }
    }
}

impl MultipartConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set max parts
    pub fn with_max_parts(mut self, max: u32) -> Self {
        self.max_parts = max;
        self
    }

    /// Set the minimum size of non-final parts
    pub fn with_min_part_size(mut self, bytes: u64) -> Self {
        self.min_part_size = bytes;
        self
    }

    /// Set the exclusive maximum part size
    pub fn with_max_part_size(mut self, bytes: u64) -> Self {
        self.max_part_size = bytes;
        self
    }

    /// Set the reaper interval
    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }

    /// Load overrides from environment variables with the given prefix.
    ///
    /// `DOG_MULTIPART_MAX_PARTS=1000` with prefix `"DOG_MULTIPART_"` sets
    /// `max_parts`. Recognised keys: `MAX_PARTS`, `MIN_PART_SIZE`,
    /// `MAX_PART_SIZE`, `REAPER_INTERVAL_SECS`. Variables whose name or value
    /// is not valid UTF-8 are ignored.
    pub fn from_env(prefix: &str) -> MultipartResult<Self> {
        Self::from_vars(prefix, utf8_vars(std::env::vars_os()))
    }

    fn from_vars<I>(prefix: &str, vars: I) -> MultipartResult<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut config = Self::default();
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(prefix) else {
                continue;
            };
            match name {
                "MAX_PARTS" => config.max_parts = parse_var(&key, &value)?,
                "MIN_PART_SIZE" => config.min_part_size = parse_var(&key, &value)?,
                "MAX_PART_SIZE" => config.max_part_size = parse_var(&key, &value)?,
                "REAPER_INTERVAL_SECS" => {
                    config.reaper_interval = Duration::from_secs(parse_var(&key, &value)?)
                }
                _ => {}
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Check that the limits are usable together
    pub fn validate(&self) -> MultipartResult<()> {
        if self.max_parts == 0 {
            return Err(MultipartError::invalid("max_parts must be positive"));
        }
        if self.max_part_size == 0 || self.max_part_size > (1 << 32) - 1 {
            return Err(MultipartError::invalid(format!(
                "max_part_size must be in 1..={}",
                (1u64 << 32) - 1
            )));
        }
        if self.min_part_size >= self.max_part_size {
            return Err(MultipartError::invalid(format!(
                "min_part_size {} must be below max_part_size {}",
                self.min_part_size, self.max_part_size
            )));
        }
        if self.reaper_interval.is_zero() {
            return Err(MultipartError::invalid("reaper_interval must be positive"));
        }
        Ok(())
    }
}

fn utf8_vars<I>(vars: I) -> impl Iterator<Item = (String, String)>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    vars.into_iter()
        .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> MultipartResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| MultipartError::invalid(format!("{} has invalid value {:?}", key, value)))
}
