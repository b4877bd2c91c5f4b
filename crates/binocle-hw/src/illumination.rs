//! IR illumination control.
//!
//! The secondary (IR) sensor is useless in the dark without its LED ring.
//! Boards expose the ring as a writable control node; an [`Illuminator`]
//! writes the profile's on/off values to it.

use crate::profiles::lookup_profile;
use std::io::Write;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IlluminationError {
    #[error("unknown illumination profile {0}")]
    UnknownProfile(String),
    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
}

/// Switches IR illumination through a control node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Illuminator {
    name: String,
    path: String,
    on: String,
    off: String,
}

impl Illuminator {
    /// Build an illuminator from the embedded profile database.
    pub fn for_profile(name: &str) -> Result<Self, IlluminationError> {
        let profile =
            lookup_profile(name).ok_or_else(|| IlluminationError::UnknownProfile(name.to_string()))?;
        Ok(Self {
            name: profile.profile.name.clone(),
            path: profile.control.path.clone(),
            on: profile.control.on.clone(),
            off: profile.control.off.clone(),
        })
    }

    /// An illuminator for a control node not in the database.
    pub fn custom(path: impl Into<String>, on: impl Into<String>, off: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            name: format!("custom:{path}"),
            path,
            on: on.into(),
            off: off.into(),
        }
    }

    pub fn switch_on(&self) -> Result<(), IlluminationError> {
        tracing::debug!(control = %self.path, "switching illumination on");
        self.write_control(&self.on)
    }

    pub fn switch_off(&self) -> Result<(), IlluminationError> {
        tracing::debug!(control = %self.path, "switching illumination off");
        self.write_control(&self.off)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn control_path(&self) -> &str {
        &self.path
    }

    fn write_control(&self, value: &str) -> Result<(), IlluminationError> {
        // Control nodes already exist; never create one.
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)
            .map_err(|source| IlluminationError::Open {
                path: self.path.clone(),
                source,
            })?;
        file.write_all(value.as_bytes())
            .map_err(|source| IlluminationError::Write {
                path: self.path.clone(),
                source,
            })
    }
}
