pub mod generate;
pub mod parse;
pub mod types;

use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

pub use parse::{load_config, parse_config, validate_config, ConfigError};
pub use types::{
    BatchConfig, Config, FailurePolicy, PipelineConfig, SchemaConfig, SnapshotMode, SourceConfig,
    SourceType, TargetConfig, WebConfig, WriterConfig,
};

pub(crate) fn env_var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$env\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env var pattern is valid")
    })
}

/// Expands `$env{VAR_NAME}` references. Unset variables are left unchanged.
pub fn expand_env_vars(text: &str) -> String {
    env_var_pattern()
        .replace_all(text, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}

/// Expands a leading `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if let Some(rest) = path_str.strip_prefix("~/") {
        if let Some(home_dir) = dirs::home_dir() {
            return home_dir.join(rest);
        }
    } else if path_str == "~" {
        if let Some(home_dir) = dirs::home_dir() {
            return home_dir;
        }
    }

    path.to_path_buf()
}

/// Resolves the config file path. Returns the first of:
/// 1. the explicit path (tilde expanded)
/// 2. ~/.config/cdcsink/config.yml
/// 3. /etc/cdcsink/config.yml
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(expand_tilde(path));
    }

    if let Some(home_dir) = dirs::home_dir() {
        let user_config = home_dir.join(".config/cdcsink/config.yml");
        if user_config.exists() {
            return Some(user_config);
        }
    }

    let system_config = PathBuf::from("/etc/cdcsink/config.yml");
    if system_config.exists() {
        return Some(system_config);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("CDCSINK_TEST_DATA", "/srv/data");
        let result = expand_env_vars("$env{CDCSINK_TEST_DATA}/changes.jsonl");
        assert_eq!(result, "/srv/data/changes.jsonl");
        std::env::remove_var("CDCSINK_TEST_DATA");
    }

    #[test]
    fn test_expand_env_vars_unset_left_alone() {
        let result = expand_env_vars("$env{CDCSINK_NOT_SET}/x");
        assert_eq!(result, "$env{CDCSINK_NOT_SET}/x");
    }

    #[test]
    fn test_expand_env_vars_ignores_shell_syntax() {
        assert_eq!(expand_env_vars("${HOME}/x"), "${HOME}/x");
    }

    #[test]
    fn test_expand_tilde() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde(Path::new("~/db/t.duckdb")), home.join("db/t.duckdb"));
            assert_eq!(expand_tilde(Path::new("~")), home);
        }
        assert_eq!(expand_tilde(Path::new("/abs/path")), Path::new("/abs/path"));
        assert_eq!(expand_tilde(Path::new("rel/~x")), Path::new("rel/~x"));
    }

    #[test]
    fn test_explicit_config_path_wins() {
        let resolved = resolve_config_path(Some(Path::new("/tmp/custom.yml")));
        assert_eq!(resolved, Some(PathBuf::from("/tmp/custom.yml")));
    }
}
