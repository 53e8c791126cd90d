//! Pump configuration.
//!
//! Defaults can be overridden from the environment:
//! - `SPAWNKIT_PUMP`: `reactor` or `threads`
//! - `SPAWNKIT_CHUNK_SIZE`: read chunk size in bytes

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Environment variable selecting the pump strategy.
pub const PUMP_ENV: &str = "SPAWNKIT_PUMP";

/// Environment variable setting the read chunk size.
pub const CHUNK_SIZE_ENV: &str = "SPAWNKIT_CHUNK_SIZE";

/// Default read chunk size.
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;

/// How the parent services the child's pipes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpStrategy {
    /// One thread multiplexing readiness of all streams.
    Reactor,
    /// One thread per active stream.
    Threads,
}

impl Default for PumpStrategy {
    fn default() -> Self {
        if cfg!(unix) {
            Self::Reactor
        } else {
            Self::Threads
        }
    }
}

impl FromStr for PumpStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reactor" | "poll" => Ok(Self::Reactor),
            "threads" | "thread" => Ok(Self::Threads),
            other => Err(Error::Config(format!(
                "unknown pump strategy '{other}' (expected reactor or threads)"
            ))),
        }
    }
}

impl fmt::Display for PumpStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reactor => f.write_str("reactor"),
            Self::Threads => f.write_str("threads"),
        }
    }
}

/// Settings for the stdio pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpSettings {
    /// Strategy used to service pipes.
    pub strategy: PumpStrategy,
    /// Maximum bytes read per call.
    pub chunk_size: usize,
}

impl Default for PumpSettings {
    fn default() -> Self {
        Self {
            strategy: PumpStrategy::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl PumpSettings {
    /// Defaults overridden by `SPAWNKIT_PUMP` / `SPAWNKIT_CHUNK_SIZE`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut settings = Self::default();
        if let Some(value) = lookup(PUMP_ENV) {
            settings.strategy = value.parse()?;
        }
        if let Some(value) = lookup(CHUNK_SIZE_ENV) {
            settings = settings.chunk_size(parse_chunk_size(&value)?);
        }
        Ok(settings)
    }

    /// Use `strategy`.
    pub const fn strategy(mut self, strategy: PumpStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Read at most `size` bytes per call (at least one).
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }
}

fn parse_chunk_size(value: &str) -> Result<usize> {
    match value.trim().parse::<usize>() {
        Ok(size) if size > 0 => Ok(size),
        _ => Err(Error::Config(format!(
            "{CHUNK_SIZE_ENV} must be a positive integer, got '{value}'"
        ))),
    }
}
