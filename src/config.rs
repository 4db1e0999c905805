//! Runtime configuration
//!
//! Table capacities are fixed once per thread, when its scheduler is
//! created. They come from an explicit [`RuntimeConfig`] passed to
//! [`crate::init`], or from the environment on first use.

use serde::{Deserialize, Serialize};

use crate::coroutines::{DEFAULT_STACK_SIZE, MIN_STACK_SIZE};

pub const ENV_MAX_COROUTINES: &str = "SPINDLE_MAX_COROUTINES";
pub const ENV_MAX_SEMAPHORES: &str = "SPINDLE_MAX_SEMAPHORES";
pub const ENV_MAX_MAILBOXES: &str = "SPINDLE_MAX_MAILBOXES";
pub const ENV_STACK_SIZE: &str = "SPINDLE_STACK_SIZE";

/// Sizing of one thread's scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Coroutine table capacity, main coroutine included.
    pub max_coroutines: usize,
    /// Semaphore table capacity.
    pub max_semaphores: usize,
    /// Mailbox table capacity.
    pub max_mailboxes: usize,
    /// Stack size of stackful coroutines spawned without an explicit size,
    /// and of the stack shared by stackless coroutines.
    pub stack_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_coroutines: 64,
            max_semaphores: 64,
            max_mailboxes: 64,
            stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by the `SPINDLE_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    ///
    /// Unparsable values are ignored with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let fields: [(&str, &mut usize); 4] = [
            (ENV_MAX_COROUTINES, &mut config.max_coroutines),
            (ENV_MAX_SEMAPHORES, &mut config.max_semaphores),
            (ENV_MAX_MAILBOXES, &mut config.max_mailboxes),
            (ENV_STACK_SIZE, &mut config.stack_size),
        ];
        for (key, field) in fields {
            let Some(raw) = lookup(key) else { continue };
            match raw.trim().parse::<usize>() {
                Ok(value) => *field = value,
                Err(e) => {
                    tracing::warn!(key, value = %raw, error = %e, "ignoring malformed setting");
                }
            }
        }
        config.normalized()
    }

    /// Raise values that cannot work to their minimum.
    pub fn normalized(mut self) -> Self {
        if self.max_coroutines == 0 {
            tracing::warn!("max_coroutines raised to 1 for the main coroutine");
            self.max_coroutines = 1;
        }
        if self.stack_size < MIN_STACK_SIZE {
            tracing::warn!(
                requested = self.stack_size,
                minimum = MIN_STACK_SIZE,
                "stack size raised to the minimum"
            );
            self.stack_size = MIN_STACK_SIZE;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_environment() {
        assert_eq!(RuntimeConfig::from_lookup(|_| None), RuntimeConfig::default());
    }

    #[test]
    fn test_overrides() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            (ENV_MAX_COROUTINES, "10"),
            (ENV_MAX_SEMAPHORES, " 3 "),
            (ENV_MAX_MAILBOXES, "0"),
            (ENV_STACK_SIZE, "65536"),
        ]));
        assert_eq!(config.max_coroutines, 10);
        assert_eq!(config.max_semaphores, 3);
        assert_eq!(config.max_mailboxes, 0);
        assert_eq!(config.stack_size, 65536);
    }

    #[test]
    fn test_malformed_values_keep_defaults() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            (ENV_MAX_COROUTINES, "lots"),
            (ENV_STACK_SIZE, "-1"),
        ]));
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn test_normalization() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            (ENV_MAX_COROUTINES, "0"),
            (ENV_STACK_SIZE, "100"),
        ]));
        assert_eq!(config.max_coroutines, 1);
        assert_eq!(config.stack_size, MIN_STACK_SIZE);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: RuntimeConfig = serde_json::from_str(r#"{"max_mailboxes": 5}"#).unwrap();
        assert_eq!(config.max_mailboxes, 5);
        assert_eq!(config.max_coroutines, RuntimeConfig::default().max_coroutines);
    }
}
