//! Configuration loading helper functions
//! Provides utilities for resolving single settings with fallback logic

use std::fmt::Display;
use std::str::FromStr;
use tracing::{debug, warn};

/// Get configuration value with priority: explicit > ENV > Default
///
/// # Arguments
/// * `explicit` - Value given on the command line or by the caller
/// * `env_var` - Environment variable name to check
/// * `default` - Default value to use as fallback
pub fn get_config_value<T>(explicit: Option<T>, env_var: &str, default: T) -> T
where
    T: FromStr,
    T::Err: Display,
{
    // Priority 1: explicit value
    if let Some(val) = explicit {
        debug!("Using {} from arguments", env_var);
        return val;
    }

    // Priority 2: Environment variable
    if let Ok(env_str) = std::env::var(env_var) {
        match env_str.parse::<T>() {
            Ok(val) => {
                debug!("Using {} from environment: {}", env_var, env_str);
                return val;
            },
            Err(e) => {
                warn!("Failed to parse {} from environment: {}", env_var, e);
            },
        }
    }

    // Priority 3: Default value
    debug!("Using default value for {}", env_var);
    default
}

/// Get string configuration value with priority: explicit > ENV > Default
///
/// Empty strings are treated as unset at every level.
pub fn get_string_config(explicit: Option<String>, env_var: &str, default: &str) -> String {
    if let Some(val) = explicit {
        if !val.is_empty() {
            return val;
        }
    }

    if let Ok(env_val) = std::env::var(env_var) {
        if !env_val.is_empty() {
            debug!("Using {} from environment", env_var);
            return env_val;
        }
    }

    default.to_string()
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_get_config_value_priority() {
        let val = get_config_value(Some(8080u16), "DISCSRV_TEST_PORT_A", 3000);
        assert_eq!(val, 8080);

        let val = get_config_value(None, "DISCSRV_TEST_PORT_UNSET", 3000u16);
        assert_eq!(val, 3000);
    }

    #[test]
    fn test_get_config_value_bad_env_falls_back() {
        std::env::set_var("DISCSRV_TEST_PORT_BAD", "not-a-number");
        let val = get_config_value(None, "DISCSRV_TEST_PORT_BAD", 5007u16);
        assert_eq!(val, 5007);
        std::env::remove_var("DISCSRV_TEST_PORT_BAD");
    }

    #[test]
    fn test_get_string_config_skips_empty() {
        let val = get_string_config(Some(String::new()), "DISCSRV_TEST_STR_UNSET", "config.yaml");
        assert_eq!(val, "config.yaml");

        std::env::set_var("DISCSRV_TEST_STR_SET", "/etc/discsrv.yaml");
        let val = get_string_config(None, "DISCSRV_TEST_STR_SET", "config.yaml");
        assert_eq!(val, "/etc/discsrv.yaml");
        std::env::remove_var("DISCSRV_TEST_STR_SET");
    }
}
