//! Configuration: keyed strings under per-component sections.
//!
//! Lookup precedence is environment variable (`<COMPONENT>_<KEY>`, upper
//! case) then the config file. The file is a JSON object of sections
//! (`{"engine": {"compiler_cmd": "cc", ...}, ...}`) found through
//! `$SMELT_CONFIG`, then `~/.config/smelt/config.json`, then
//! `/etc/smelt/config.json`.

use crate::error::SmeltError;
use nanoserde::DeJson;
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Default)]
pub struct ConfigStore {
    sections: HashMap<String, HashMap<String, String>>,
    /// Where the config file was found, if anywhere.
    pub path: Option<PathBuf>,
}

impl ConfigStore {
    /// Empty store: every lookup falls back to its default (environment
    /// variables still take effect).
    #[must_use]
    pub fn empty() -> ConfigStore {
        ConfigStore::default()
    }

    pub fn parse(json: &str) -> Result<ConfigStore, SmeltError> {
        let sections: HashMap<String, HashMap<String, String>> = DeJson::deserialize_json(json)
            .map_err(|e| SmeltError::Config(format!("cannot parse config: {e}").into()))?;
        Ok(ConfigStore { sections, path: None })
    }

    /// Probe the search path for a config file. A `$SMELT_CONFIG` that
    /// points at a missing or unparsable file is an error; the fallback
    /// locations are optional.
    pub fn load() -> Result<ConfigStore, SmeltError> {
        if let Some(path) = std::env::var_os("SMELT_CONFIG") {
            let path = PathBuf::from(path);
            let text = std::fs::read_to_string(&path).map_err(|e| {
                SmeltError::Config(format!("cannot read {}: {e}", path.display()).into())
            })?;
            let mut store = ConfigStore::parse(&text)?;
            store.path = Some(path);
            return Ok(store);
        }
        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Some(config_home) = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .filter(|p| p.is_absolute())
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
        {
            candidates.push(config_home.join("smelt/config.json"));
        }
        candidates.push(PathBuf::from("/etc/smelt/config.json"));
        for path in candidates {
            if let Ok(text) = std::fs::read_to_string(&path) {
                let mut store = ConfigStore::parse(&text)?;
                store.path = Some(path);
                return Ok(store);
            }
        }
        Ok(ConfigStore::empty())
    }

    fn lookup(&self, component: &str, key: &str) -> Option<String> {
        let env_key =
            format!("{}_{}", component.to_uppercase(), key.to_uppercase()).replace('-', "_");
        if let Ok(v) = std::env::var(&env_key) {
            return Some(v);
        }
        self.sections.get(component)?.get(key).cloned()
    }

    #[must_use]
    pub fn string(&self, component: &str, key: &str, default: &str) -> String {
        self.lookup(component, key).unwrap_or_else(|| default.to_string())
    }

    pub fn boolean(&self, component: &str, key: &str, default: bool) -> Result<bool, SmeltError> {
        match self.lookup(component, key) {
            None => Ok(default),
            Some(v) => match v.as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                other => Err(SmeltError::Config(
                    format!("{component}.{key}: not a boolean: {other:?}").into(),
                )),
            },
        }
    }

    pub fn int(
        &self,
        component: &str,
        key: &str,
        default: i64,
        min: i64,
        max: i64,
    ) -> Result<i64, SmeltError> {
        let value = match self.lookup(component, key) {
            None => default,
            Some(v) => v.parse::<i64>().map_err(|_| {
                SmeltError::Config(format!("{component}.{key}: not an integer: {v:?}").into())
            })?,
        };
        if value < min || value > max {
            return Err(SmeltError::Config(
                format!("{component}.{key}: {value} outside [{min}, {max}]").into(),
            ));
        }
        Ok(value)
    }

    pub fn double(&self, component: &str, key: &str, default: f64) -> Result<f64, SmeltError> {
        match self.lookup(component, key) {
            None => Ok(default),
            Some(v) => v.parse::<f64>().map_err(|_| {
                SmeltError::Config(format!("{component}.{key}: not a number: {v:?}").into())
            }),
        }
    }

    /// A path-valued key; when set, the path must exist.
    pub fn existing_path(
        &self,
        component: &str,
        key: &str,
    ) -> Result<Option<PathBuf>, SmeltError> {
        match self.lookup(component, key) {
            None => Ok(None),
            Some(v) => {
                let path = PathBuf::from(v);
                if path.exists() {
                    Ok(Some(path))
                } else {
                    Err(SmeltError::Config(
                        format!("{component}.{key}: no such path: {}", path.display()).into(),
                    ))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_values_and_defaults() {
        let cfg = ConfigStore::parse(
            r#"{"engine": {"compiler_cmd": "clang", "fusion": "false", "thread_limit": "8"}}"#,
        )
        .unwrap();
        assert_eq!(cfg.string("engine", "compiler_cmd", "cc"), "clang");
        assert_eq!(cfg.string("engine", "object_ext", "so"), "so");
        assert!(!cfg.boolean("engine", "fusion", true).unwrap());
        assert_eq!(cfg.int("engine", "thread_limit", 0, 0, 1024).unwrap(), 8);
    }

    #[test]
    fn range_check() {
        let cfg =
            ConfigStore::parse(r#"{"engine": {"thread_limit": "100000"}}"#).unwrap();
        assert!(matches!(
            cfg.int("engine", "thread_limit", 0, 0, 1024),
            Err(SmeltError::Config(_))
        ));
    }

    #[test]
    fn env_wins_over_file() {
        let cfg = ConfigStore::parse(r#"{"probe": {"knob": "file"}}"#).unwrap();
        std::env::set_var("PROBE_KNOB", "env");
        assert_eq!(cfg.string("probe", "knob", "d"), "env");
        std::env::remove_var("PROBE_KNOB");
        assert_eq!(cfg.string("probe", "knob", "d"), "file");
    }
}
