//! Artifact coordinates.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum length of any single coordinate component.
const MAX_COMPONENT_LEN: usize = 255;

/// A `(app, version, platform, filename)` tuple uniquely identifying a
/// stored artifact.
///
/// The adapter maps a coordinate to an opaque object key; callers never
/// parse keys back into coordinates.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactCoordinate {
    pub app: String,
    pub version: String,
    pub platform: String,
    pub filename: String,
}

impl ArtifactCoordinate {
    /// Build a coordinate, validating every component.
    pub fn new(
        app: impl Into<String>,
        version: impl Into<String>,
        platform: impl Into<String>,
        filename: impl Into<String>,
    ) -> crate::Result<Self> {
        let coordinate = Self {
            app: app.into(),
            version: version.into(),
            platform: platform.into(),
            filename: filename.into(),
        };
        coordinate.validate()?;
        Ok(coordinate)
    }

    /// Validate all components: non-empty, bounded, no path separators,
    /// no traversal sequences.
    pub fn validate(&self) -> crate::Result<()> {
        for (name, value) in [
            ("app", &self.app),
            ("version", &self.version),
            ("platform", &self.platform),
            ("filename", &self.filename),
        ] {
            if value.is_empty() {
                return Err(crate::Error::InvalidCoordinate(format!(
                    "{name} must not be empty"
                )));
            }
            if value.len() > MAX_COMPONENT_LEN {
                return Err(crate::Error::InvalidCoordinate(format!(
                    "{name} exceeds {MAX_COMPONENT_LEN} bytes"
                )));
            }
            if value.contains('/') || value.contains('\\') {
                return Err(crate::Error::InvalidCoordinate(format!(
                    "{name} must not contain path separators: {value}"
                )));
            }
            if value == "." || value == ".." {
                return Err(crate::Error::InvalidCoordinate(format!(
                    "{name} must not be a relative path component"
                )));
            }
            if value.chars().any(char::is_control) {
                return Err(crate::Error::InvalidCoordinate(format!(
                    "{name} contains control characters"
                )));
            }
        }
        Ok(())
    }

    /// Listing prefix covering all artifacts of an app, or of an
    /// app+version when `version` is given.
    pub fn prefix(app: &str, version: Option<&str>) -> String {
        match version {
            Some(v) => format!("{app}/{v}/"),
            None => format!("{app}/"),
        }
    }
}

impl fmt::Display for ArtifactCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.app, self.version, self.platform, self.filename
        )
    }
}

impl fmt::Debug for ArtifactCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArtifactCoordinate({self})")
    }
}
