use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration syntax: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("missing configuration key: {0}")]
    Missing(String),

    #[error("configuration key {path} is not {expected}")]
    WrongType {
        path: String,
        expected: &'static str,
    },

    #[error("invalid configuration value for {path}: {reason}")]
    Invalid { path: String, reason: String },
}

/// Hierarchical configuration tree handed to model constructors.
///
/// Keys are `/`-separated paths into a JSON object tree. Two wildcard segments are
/// understood: `*` matches exactly one level and `**` matches any number of levels
/// (including zero). An exact match of the first literal segment is authoritative: once a
/// direct child matches it, resolution does not backtrack into wildcard expansion of its
/// siblings.
#[derive(Debug, Clone)]
pub struct Config {
    root: Value,
}

impl Config {
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            root: serde_json::from_str(text)?,
        })
    }

    pub fn from_value(root: Value) -> Self {
        Self { root }
    }

    /// Resolves `path` against the tree. Returns the whole tree for an empty path.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        lookup_parts(&self.root, &parts)
    }

    pub fn get_int(&self, path: &str) -> Option<i64> {
        self.lookup(path)?.as_i64()
    }

    pub fn get_uint(&self, path: &str) -> Option<u64> {
        self.lookup(path)?.as_u64()
    }

    /// Booleans may be encoded as JSON booleans or as 0/1 integers.
    pub fn get_bool(&self, path: &str) -> Option<bool> {
        let value = self.lookup(path)?;
        value.as_bool().or_else(|| value.as_i64().map(|v| v != 0))
    }

    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.lookup(path)?.as_str()
    }

    pub fn get_int_or(&self, path: &str, default: i64) -> i64 {
        self.get_int(path).unwrap_or(default)
    }

    pub fn get_uint_or(&self, path: &str, default: u64) -> u64 {
        self.get_uint(path).unwrap_or(default)
    }

    pub fn get_bool_or(&self, path: &str, default: bool) -> bool {
        self.get_bool(path).unwrap_or(default)
    }

    pub fn require_int(&self, path: &str) -> Result<i64, ConfigError> {
        match self.lookup(path) {
            None => Err(ConfigError::Missing(path.to_string())),
            Some(value) => value.as_i64().ok_or_else(|| ConfigError::WrongType {
                path: path.to_string(),
                expected: "an integer",
            }),
        }
    }

    pub fn require_uint(&self, path: &str) -> Result<u64, ConfigError> {
        match self.lookup(path) {
            None => Err(ConfigError::Missing(path.to_string())),
            Some(value) => value.as_u64().ok_or_else(|| ConfigError::WrongType {
                path: path.to_string(),
                expected: "an unsigned integer",
            }),
        }
    }

    pub fn require_bool(&self, path: &str) -> Result<bool, ConfigError> {
        match self.lookup(path) {
            None => Err(ConfigError::Missing(path.to_string())),
            Some(value) => value
                .as_bool()
                .or_else(|| value.as_i64().map(|v| v != 0))
                .ok_or_else(|| ConfigError::WrongType {
                    path: path.to_string(),
                    expected: "a boolean",
                }),
        }
    }

    /// Clones the subtree at `path` into its own `Config`, for handing a component the
    /// parameter block that belongs to it.
    pub fn subtree(&self, path: &str) -> Option<Config> {
        Some(Self {
            root: self.lookup(path)?.clone(),
        })
    }
}

fn lookup_parts<'a>(value: &'a Value, parts: &[&str]) -> Option<&'a Value> {
    if parts.is_empty() {
        return Some(value);
    }
    let obj = value.as_object()?;

    // Position of the first literal segment; everything before it is wildcards that an
    // exact child match consumes in one step.
    let mut name = None;
    let mut name_pos = 0;
    for part in parts {
        if *part != "*" && *part != "**" {
            name = Some(*part);
            break;
        }
        name_pos += 1;
    }

    for (key, child) in obj {
        if name == Some(key.as_str()) {
            let found = lookup_parts(child, &parts[name_pos + 1..]);
            if name_pos == 0 || found.is_some() {
                return found;
            }
        } else if parts[0] == "*" {
            if let Some(found) = lookup_parts(child, &parts[1..]) {
                return Some(found);
            }
        } else if parts[0] == "**" {
            if let Some(found) = lookup_parts(child, parts) {
                return Some(found);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        Config::parse(
            r#"{
                "soc": {
                    "cluster": {
                        "dma": { "nb_channels": 4, "is_64": false },
                        "core0": { "boot_addr": 7340032 }
                    },
                    "periph": { "dma": { "nb_channels": 1 } }
                }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn literal_paths() {
        let cfg = sample();
        assert_eq!(cfg.get_int("soc/cluster/dma/nb_channels"), Some(4));
        assert_eq!(cfg.get_bool("soc/cluster/dma/is_64"), Some(false));
        assert_eq!(cfg.get_int("soc/cluster/dma/missing"), None);
        assert_eq!(cfg.get_int("soc/nope/dma/nb_channels"), None);
    }

    #[test]
    fn single_level_wildcard() {
        let cfg = sample();
        // "*" must consume exactly one level.
        assert_eq!(cfg.get_int("soc/*/dma/nb_channels"), Some(4));
        assert_eq!(cfg.get_int("*/cluster/dma/nb_channels"), Some(4));
        assert_eq!(cfg.get_int("*/dma/nb_channels"), None);
    }

    #[test]
    fn multi_level_wildcard() {
        let cfg = sample();
        assert_eq!(cfg.get_int("**/core0/boot_addr"), Some(7_340_032));
        // "**" also matches zero levels.
        assert_eq!(cfg.get_int("**/soc/cluster/dma/nb_channels"), Some(4));
    }

    #[test]
    fn exact_child_match_is_authoritative() {
        // A direct child matching the first literal segment wins over wildcard descent
        // into siblings, even when the direct branch then misses.
        let cfg = Config::parse(
            r#"{
                "dma": { "other": 1 },
                "nested": { "dma": { "nb_channels": 2 } }
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.get_int("dma/nb_channels"), None);
        assert_eq!(cfg.get_int("**/dma/nb_channels"), Some(2));
    }

    #[test]
    fn required_keys() {
        let cfg = sample();
        assert!(matches!(
            cfg.require_int("soc/cluster/dma/missing"),
            Err(ConfigError::Missing(_))
        ));
        assert!(matches!(
            cfg.require_int("soc/cluster"),
            Err(ConfigError::WrongType { .. })
        ));
        assert_eq!(cfg.require_int("soc/cluster/dma/nb_channels").unwrap(), 4);
    }

    #[test]
    fn bools_accept_integers() {
        let cfg = Config::parse(r#"{ "a": 1, "b": 0, "c": true }"#).unwrap();
        assert_eq!(cfg.get_bool("a"), Some(true));
        assert_eq!(cfg.get_bool("b"), Some(false));
        assert_eq!(cfg.get_bool("c"), Some(true));
        assert!(cfg.require_bool("a").unwrap());
        assert!(matches!(
            cfg.require_bool("d"),
            Err(ConfigError::Missing(_))
        ));
    }

    #[test]
    fn subtree_extracts_component_block() {
        let cfg = sample();
        let dma = cfg.subtree("soc/cluster/dma").unwrap();
        assert_eq!(dma.get_int("nb_channels"), Some(4));
        assert_eq!(dma.get_int("soc/cluster/dma/nb_channels"), None);
        assert!(cfg.subtree("soc/cluster/gpu").is_none());
    }
}
