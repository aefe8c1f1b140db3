//! Configuration loading from `~/.waypost/config.toml` with defaults.
//!
//! A config may list other TOML files under `include`. They are merged in
//! order, then the including file is merged on top, so the root always wins.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use tracing::{info, warn};
use waypost_types::config::NodeConfig;

/// Maximum include nesting depth.
const MAX_INCLUDE_DEPTH: u32 = 10;

/// Load node configuration, falling back to defaults on any failure.
pub fn load_config(path: Option<&Path>) -> NodeConfig {
    let config_path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(path = %config_path.display(), "Config file not found, using defaults");
        return NodeConfig::default();
    }

    match read_config(&config_path) {
        Ok(config) => {
            info!(path = %config_path.display(), "Loaded configuration");
            config
        }
        Err(e) => {
            warn!(error = %e, path = %config_path.display(), "Failed to load config, using defaults");
            NodeConfig::default()
        }
    }
}

/// Read and merge one config file and its includes.
///
/// A broken include is logged and skipped: the root file is used on its own.
pub fn read_config(config_path: &Path) -> Result<NodeConfig, String> {
    let contents = std::fs::read_to_string(config_path)
        .map_err(|e| format!("cannot read {}: {e}", config_path.display()))?;
    let mut root: toml::Value =
        toml::from_str(&contents).map_err(|e| format!("cannot parse {}: {e}", config_path.display()))?;

    let config_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
    let mut visited = HashSet::new();
    visited.insert(std::fs::canonicalize(config_path).unwrap_or_else(|_| config_path.to_path_buf()));

    let without_includes = strip_include(root.clone());
    match merge_includes(&root, config_dir, &mut visited, 0) {
        Ok(merged) => root = merged,
        Err(e) => {
            warn!(error = %e, "Config include resolution failed, using root config only");
            root = without_includes;
        }
    }

    root.try_into::<NodeConfig>()
        .map_err(|e| format!("invalid config {}: {e}", config_path.display()))
}

/// Return `value` with its includes merged underneath it and `include` removed.
fn merge_includes(
    value: &toml::Value,
    dir: &Path,
    visited: &mut HashSet<PathBuf>,
    depth: u32,
) -> Result<toml::Value, String> {
    if depth > MAX_INCLUDE_DEPTH {
        return Err(format!("include depth exceeds {MAX_INCLUDE_DEPTH}"));
    }

    let includes: Vec<String> = value
        .get("include")
        .and_then(toml::Value::as_array)
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default();

    let mut merged = toml::Value::Table(toml::map::Map::new());
    for include in &includes {
        let canonical = resolve_include(include, dir)?;
        if !visited.insert(canonical.clone()) {
            return Err(format!("circular include: {include}"));
        }
        info!(include = %include, "Loading config include");

        let contents = std::fs::read_to_string(&canonical)
            .map_err(|e| format!("cannot read include '{include}': {e}"))?;
        let included: toml::Value = toml::from_str(&contents)
            .map_err(|e| format!("cannot parse include '{include}': {e}"))?;
        let include_dir = canonical.parent().unwrap_or(dir);
        let included = merge_includes(&included, include_dir, visited, depth + 1)?;
        deep_merge_toml(&mut merged, &included);
    }

    deep_merge_toml(&mut merged, &strip_include(value.clone()));
    Ok(merged)
}

/// Resolve a relative include path, refusing anything outside `dir`.
fn resolve_include(include: &str, dir: &Path) -> Result<PathBuf, String> {
    let include_path = Path::new(include);
    if include_path.is_absolute() {
        return Err(format!("absolute include path: {include}"));
    }
    if include_path
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(format!("include path traversal: {include}"));
    }

    let canonical = std::fs::canonicalize(dir.join(include_path))
        .map_err(|e| format!("include '{include}' cannot be resolved: {e}"))?;
    let canonical_dir =
        std::fs::canonicalize(dir).map_err(|e| format!("config dir cannot be resolved: {e}"))?;
    if !canonical.starts_with(&canonical_dir) {
        return Err(format!("include '{include}' escapes the config directory"));
    }
    Ok(canonical)
}

fn strip_include(mut value: toml::Value) -> toml::Value {
    if let toml::Value::Table(tbl) = &mut value {
        tbl.remove("include");
    }
    value
}

/// Deep-merge two TOML values. Tables merge key by key, anything else is
/// replaced by `overlay`.
pub fn deep_merge_toml(base: &mut toml::Value, overlay: &toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_tbl), toml::Value::Table(overlay_tbl)) => {
            for (key, overlay_val) in overlay_tbl {
                match base_tbl.get_mut(key) {
                    Some(base_val) => deep_merge_toml(base_val, overlay_val),
                    None => {
                        base_tbl.insert(key.clone(), overlay_val.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// The Waypost home directory (`~/.waypost`).
pub fn waypost_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".waypost")
}

/// Get the default config file path.
pub fn default_config_path() -> PathBuf {
    waypost_home().join("config.toml")
}

/// Default location of the node identity key.
pub fn default_key_path() -> PathBuf {
    waypost_home().join("identity.key")
}
