//! Illumination profile database.
//!
//! Maps a board name to the control node and the values that switch its
//! IR illumination on and off. Profile files are embedded at compile time
//! from `contrib/illumination/*.toml`.

use serde::Deserialize;
use std::sync::OnceLock;

const PROC_LED_LIGHT: &str = include_str!("../../../contrib/illumination/proc-led-light.toml");

static PROFILE_DB: OnceLock<Vec<ProfileFile>> = OnceLock::new();

/// One `contrib/illumination/*.toml` file.
#[derive(Debug, Clone, Deserialize)]
pub struct ProfileFile {
    pub profile: ProfileInfo,
    pub control: ControlInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProfileInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Control node from the `[control]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlInfo {
    pub path: String,
    /// Written to switch illumination on.
    pub on: String,
    /// Written to switch illumination off.
    pub off: String,
}

fn profile_db() -> &'static Vec<ProfileFile> {
    PROFILE_DB.get_or_init(|| parse_profiles(&[PROC_LED_LIGHT]))
}

fn parse_profiles(sources: &[&str]) -> Vec<ProfileFile> {
    let mut db = Vec::new();
    for src in sources {
        match toml::from_str::<ProfileFile>(src) {
            Ok(p) => db.push(p),
            Err(e) => tracing::warn!(error = %e, "bad illumination profile TOML"),
        }
    }
    db
}

/// Look up a profile by name.
pub fn lookup_profile(name: &str) -> Option<&'static ProfileFile> {
    profile_db().iter().find(|p| p.profile.name == name)
}

/// List all known profiles.
pub fn list_profiles() -> &'static [ProfileFile] {
    profile_db()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_profile_parses() {
        let p = lookup_profile("proc-led-light").expect("embedded profile");
        assert_eq!(p.control.path, "/proc/proc_led_light");
        assert_eq!(p.control.on, "200, 0");
        assert_eq!(p.control.off, "0, 0");
        assert!(!list_profiles().is_empty());
    }

    #[test]
    fn test_unknown_profile() {
        assert!(lookup_profile("no-such-board").is_none());
    }

    #[test]
    fn test_bad_toml_skipped() {
        let good = "[profile]\nname = \"x\"\n[control]\npath = \"/tmp/x\"\non = \"1\"\noff = \"0\"\n";
        let db = parse_profiles(&["not = [valid", good]);
        assert_eq!(db.len(), 1);
        assert_eq!(db[0].profile.name, "x");
        assert!(db[0].profile.description.is_empty());
    }
}
