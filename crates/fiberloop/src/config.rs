//! Loop configuration
//!
//! # Configuration Precedence
//!
//! 1. **Programmatic**: values set through `with_*` setters
//! 2. **Environment variables**: `FIBERLOOP_*`, applied by [`LoopConfig::from_env`]
//! 3. **Defaults**: [`LoopConfig::default()`]
//!
//! | Variable | Type | Maps to |
//! |----------|------|---------|
//! | `FIBERLOOP_NAME` | `String` | `name` |
//! | `FIBERLOOP_STACK_SIZE` | `usize` | `default_stack_size` |
//! | `FIBERLOOP_POOL_CAPACITY` | `usize` | `pool_capacity` (`0` = unbounded) |

use crate::clock::{Clock, MonotonicClock};
use std::sync::Arc;

/// Environment variable name for the loop (and thread) name.
pub const ENV_NAME: &str = "FIBERLOOP_NAME";
/// Environment variable name for the default task stack size.
pub const ENV_STACK_SIZE: &str = "FIBERLOOP_STACK_SIZE";
/// Environment variable name for the pool capacity.
pub const ENV_POOL_CAPACITY: &str = "FIBERLOOP_POOL_CAPACITY";

/// Default stack size for tasks that do not ask for one
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A variable was set but could not be parsed
    #[error("Invalid value {value:?} for {var}")]
    InvalidValue {
        /// Variable name
        var: &'static str,
        /// Raw value found in the environment
        value: String,
    },
}

/// Settings for one event loop
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Name used for the loop thread and in log records
    pub name: String,

    /// Stack size for tasks spawned with a stack size of `0`
    pub default_stack_size: usize,

    /// Maximum live pool allocations (timers + tasks); `None` = unbounded
    pub pool_capacity: Option<usize>,

    /// Time source
    pub clock: Arc<dyn Clock>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            name: "fiberloop".to_string(),
            default_stack_size: DEFAULT_STACK_SIZE,
            pool_capacity: None,
            clock: Arc::new(MonotonicClock::new()),
        }
    }
}

impl LoopConfig {
    /// Defaults with environment overrides applied
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        apply_env_overrides(&mut config)?;
        Ok(config)
    }

    /// Set the loop name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the default task stack size
    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.default_stack_size = bytes;
        self
    }

    /// Bound the pool
    pub fn with_pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = Some(capacity);
        self
    }

    /// Replace the time source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// Apply environment variable overrides to a [`LoopConfig`].
///
/// Only variables that are set are applied. A set but unparseable variable
/// is an error.
pub fn apply_env_overrides(config: &mut LoopConfig) -> Result<(), ConfigError> {
    apply_overrides(config, |var| std::env::var(var).ok())
}

fn apply_overrides(
    config: &mut LoopConfig,
    read: impl Fn(&'static str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(val) = read(ENV_NAME) {
        config.name = val;
    }
    if let Some(val) = read(ENV_STACK_SIZE) {
        config.default_stack_size = parse_usize(ENV_STACK_SIZE, &val)?;
    }
    if let Some(val) = read(ENV_POOL_CAPACITY) {
        config.pool_capacity = match parse_usize(ENV_POOL_CAPACITY, &val)? {
            0 => None,
            n => Some(n),
        };
    }
    Ok(())
}

fn parse_usize(var: &'static str, value: &str) -> Result<usize, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        var,
        value: value.to_string(),
    })
}
