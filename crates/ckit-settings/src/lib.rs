//! # ckit-settings
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`CkitSettings::default()`]
//! 2. **User file**: `~/.ckit/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `CKIT_*` overrides (highest priority)
//!
//! There is no global instance; load once at startup and pass the value down.
//!
//! ```no_run
//! use ckit_settings::load_settings;
//!
//! let settings = load_settings().unwrap_or_default();
//! println!("session ttl: {:?}", settings.session.ttl());
//! ```

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, deep_merge, load_settings, load_settings_from_path, settings_dir,
    settings_path,
};
pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn re_exports_work() {
        let _settings = CkitSettings::default();
        assert!(settings_path().ends_with(".ckit/settings.json"));
    }

    #[test]
    fn default_settings_are_valid() {
        let settings = CkitSettings::default();
        settings.validate().unwrap();
        assert_eq!(settings.session.ttl_secs, 86_400);
        assert_eq!(settings.session.max_sessions, 1000);
        assert_eq!(settings.retry.max_attempts, 2);
        assert_eq!(settings.retry.delays_ms, vec![500, 1000]);
        assert_eq!(settings.logging.level, "info");
        assert!(!settings.logging.json);
    }
}
