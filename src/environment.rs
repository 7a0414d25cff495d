use std::env;
use std::str::FromStr;

/// Reads and parses an environment variable, falling back to `default` when it is
/// unset or does not parse.
pub fn get_env_var_or<T: FromStr>(var: &str, default: T) -> T {
    env::var(var)
        .ok()
        .and_then(|value| value.trim().parse::<T>().ok())
        .unwrap_or(default)
}

/// Reads a string environment variable with a default.
pub fn get_env_string_or(var: &str, default: &str) -> String {
    env::var(var)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_vars_fall_back() {
        assert_eq!(get_env_var_or("LORELINK_TEST_UNSET_NUMBER", 7usize), 7);
        assert_eq!(
            get_env_string_or("LORELINK_TEST_UNSET_STRING", "fallback"),
            "fallback"
        );
    }
}
