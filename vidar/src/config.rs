use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use bevy::prelude::*;
use miette::{Context, IntoDiagnostic};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_with::{DurationMilliSeconds, serde_as};

/// A configuration file that can be loaded from the config roots.
///
/// Implementors are plain serde structs; [`Config::PATH`] is the file path relative
/// to the config root.
pub trait Config: DeserializeOwned + Resource {
    /// Path of the configuration file, relative to the config root.
    const PATH: &'static str;
}

/// Top-level application configuration.
#[serde_as]
#[derive(Resource, Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct VidarConfig {
    /// The control period (in milliseconds).
    #[serde_as(as = "DurationMilliSeconds")]
    pub control_period: Duration,

    /// Emit per-tick logs of the controller outputs.
    pub debug_logging: bool,
}

impl Config for VidarConfig {
    const PATH: &'static str = "vidar.toml";
}

/// Root directory containing the main configuration files.
#[derive(Resource, Debug, Clone)]
pub struct ConfigRoot(pub PathBuf);

impl Default for ConfigRoot {
    fn default() -> Self {
        Self(PathBuf::from("./config/"))
    }
}

/// Optional overlay root, e.g. per-robot; values found here override the main config.
#[derive(Resource, Debug, Clone, Default)]
pub struct OverlayConfigRoot(pub Option<PathBuf>);

fn read_table(path: &Path) -> Result<toml::Table, miette::Report> {
    let raw = std::fs::read_to_string(path)
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to read config file `{}`", path.display()))?;

    raw.parse::<toml::Table>()
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to parse config file `{}`", path.display()))
}

/// Merge `overlay` into `main`, recursing into subtables.
///
/// Keys that only exist in the overlay are ignored: `deny_unknown_fields` on the
/// config structs would reject them anyway, and a typo in an overlay should not
/// silently introduce new keys.
fn merge_tables(main: toml::Table, overlay: &toml::Table) -> toml::Table {
    let mut merged = toml::Table::new();

    for (key, value) in main {
        match (value, overlay.get(&key)) {
            (toml::Value::Table(main_sub), Some(toml::Value::Table(overlay_sub))) => {
                merged.insert(key, toml::Value::Table(merge_tables(main_sub, overlay_sub)));
            }
            (_, Some(overlay_value)) => {
                merged.insert(key, overlay_value.clone());
            }
            (value, None) => {
                merged.insert(key, value);
            }
        }
    }

    merged
}

/// Load a configuration from the main root, applying the overlay root when present.
pub fn load_config<T: Config>(root: &Path, overlay: Option<&Path>) -> Result<T, miette::Report> {
    let main = read_table(&root.join(T::PATH))?;

    let overlay_path = overlay.map(|overlay| overlay.join(T::PATH));
    let merged = match overlay_path {
        Some(path) if path.exists() => merge_tables(main, &read_table(&path)?),
        _ => main,
    };

    toml::Value::Table(merged)
        .try_into::<T>()
        .into_diagnostic()
        .wrap_err_with(|| format!("invalid configuration in `{}`", T::PATH))
}

/// App extension for registering [`Config`] resources.
pub trait ConfigExt {
    /// Load the configuration `T` and insert it as a resource.
    ///
    /// Configuration problems are wiring bugs: this fails fast during startup,
    /// before the control loop gets a chance to run.
    fn init_config<T: Config>(&mut self) -> &mut Self;
}

impl ConfigExt for App {
    fn init_config<T: Config>(&mut self) -> &mut Self {
        let root = self
            .world()
            .get_resource::<ConfigRoot>()
            .cloned()
            .unwrap_or_default()
            .0;
        let overlay = self
            .world()
            .get_resource::<OverlayConfigRoot>()
            .and_then(|overlay| overlay.0.clone());

        match load_config::<T>(&root, overlay.as_deref()) {
            Ok(config) => self.insert_resource(config),
            Err(report) => panic!("{report:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::merge_tables;

    fn table(raw: &str) -> toml::Table {
        raw.parse().unwrap()
    }

    #[test]
    fn overlay_overrides_scalars_and_recurses() {
        let main = table("a = 1\n[sub]\nb = 2\nc = 3\n");
        let overlay = table("a = 10\n[sub]\nc = 30\n");

        let merged = merge_tables(main, &overlay);

        assert_eq!(merged["a"].as_integer(), Some(10));
        assert_eq!(merged["sub"]["b"].as_integer(), Some(2));
        assert_eq!(merged["sub"]["c"].as_integer(), Some(30));
    }

    #[test]
    fn overlay_cannot_introduce_new_keys() {
        let main = table("a = 1\n");
        let overlay = table("a = 2\nextra = 3\n");

        let merged = merge_tables(main, &overlay);

        assert_eq!(merged["a"].as_integer(), Some(2));
        assert!(!merged.contains_key("extra"));
    }
}
