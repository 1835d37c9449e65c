pub mod background;
pub mod detect;
pub mod run;
pub mod validate;

use trigger_rs::TriggerConfig;

/// Configuration from `path`, or the defaults when no file is given.
pub fn load_config(path: Option<&str>) -> Result<TriggerConfig, String> {
    match path {
        Some(path) => TriggerConfig::load(path).map_err(|e| e.to_string()),
        None => Ok(TriggerConfig::default()),
    }
}
