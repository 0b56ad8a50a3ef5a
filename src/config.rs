use crate::store::DEFAULT_PAGE_SIZE;
use crate::upload::UploadPolicy;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

/// Service configuration.
///
/// # Environment variables
///
/// | Variable | Default | Meaning |
/// |----------|---------|---------|
/// | RX_DB_PATH | ./rx-data/db | sled database directory |
/// | RX_BLOB_ROOT | ./rx-data/blobs | upload storage directory |
/// | RX_MAX_FILES | 4 | files per submission |
/// | RX_MAX_FILE_BYTES | 5242880 | bytes per file |
/// | RX_ALLOWED_TYPES | image/jpeg,image/png,application/pdf | accepted content types |
/// | RX_VERIFY_OWNERSHIP | true | check prescription owners on order requests |
/// | RX_PAGE_SIZE | 20 | default listing page size |
/// | RX_LOG_LEVEL | info | fallback when RUST_LOG is unset |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub db_path: PathBuf,
    pub blob_root: PathBuf,
    pub upload: UploadPolicy,
    pub verify_ownership: bool,
    pub page_size: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./rx-data/db"),
            blob_root: PathBuf::from("./rx-data/blobs"),
            upload: UploadPolicy::default(),
            verify_ownership: true,
            page_size: DEFAULT_PAGE_SIZE,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Reads overrides from the environment. Unset or unparsable values keep
    /// their defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let parse = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let allowed_types = parse("RX_ALLOWED_TYPES")
            .map(|raw| {
                raw.split(',')
                    .map(|t| t.trim().to_lowercase())
                    .filter(|t| !t.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|types| !types.is_empty())
            .unwrap_or(defaults.upload.allowed_types);

        Self {
            db_path: parse("RX_DB_PATH").map(PathBuf::from).unwrap_or(defaults.db_path),
            blob_root: parse("RX_BLOB_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.blob_root),
            upload: UploadPolicy {
                max_files: parse_or(parse("RX_MAX_FILES"), defaults.upload.max_files),
                max_file_bytes: parse_or(parse("RX_MAX_FILE_BYTES"), defaults.upload.max_file_bytes),
                allowed_types,
            },
            verify_ownership: parse_or(parse("RX_VERIFY_OWNERSHIP"), defaults.verify_ownership),
            page_size: parse_or(parse("RX_PAGE_SIZE"), defaults.page_size).max(1),
            log_level: parse("RX_LOG_LEVEL").unwrap_or(defaults.log_level),
        }
    }
}

fn parse_or<T: FromStr>(raw: Option<String>, default: T) -> T {
    raw.and_then(|v| v.parse().ok()).unwrap_or(default)
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
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let config = Config::from_lookup(|_| None);
        assert_eq!(config, Config::default());
        assert_eq!(config.upload.max_files, 4);
        assert_eq!(config.upload.max_file_bytes, 5 * 1024 * 1024);
    }

    #[test]
    fn overrides_are_applied() {
        let config = Config::from_lookup(lookup(&[
            ("RX_MAX_FILES", "2"),
            ("RX_ALLOWED_TYPES", "application/pdf, IMAGE/HEIC"),
            ("RX_VERIFY_OWNERSHIP", "false"),
            ("RX_DB_PATH", "/var/lib/rx"),
        ]));
        assert_eq!(config.upload.max_files, 2);
        assert_eq!(config.upload.allowed_types, vec!["application/pdf", "image/heic"]);
        assert!(!config.verify_ownership);
        assert_eq!(config.db_path, PathBuf::from("/var/lib/rx"));
    }

    #[test]
    fn garbage_falls_back() {
        let config = Config::from_lookup(lookup(&[
            ("RX_MAX_FILE_BYTES", "lots"),
            ("RX_PAGE_SIZE", "0"),
            ("RX_ALLOWED_TYPES", " , "),
        ]));
        assert_eq!(config.upload.max_file_bytes, 5 * 1024 * 1024);
        assert_eq!(config.page_size, 1);
        assert_eq!(config.upload.allowed_types.len(), 3);
    }
}
