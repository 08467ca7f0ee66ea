//! CouchDB version gate
//!
//! Compares the version reported by CouchDB's welcome document against the
//! oldest release we support, using semantic-version ordering.

use crate::error::StartupError;
use semver::Version;

/// Oldest CouchDB release we support
pub const MINIMUM_VERSION: &str = "1.2.0";

/// Parse a `major.minor.patch[-pre][+build]` version
pub fn parse(version: &str) -> Result<Version, StartupError> {
    let trimmed = version.trim();
    let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
    Version::parse(trimmed).map_err(|_| StartupError::InvalidVersion(version.to_string()))
}

/// Succeeds when `observed >= minimum`.
///
/// Build metadata does not take part in the comparison.
pub fn check(observed: &str, minimum: &str) -> Result<(), StartupError> {
    let found = parse(observed)?;
    let required = parse(minimum)?;

    if found.cmp_precedence(&required).is_ge() {
        Ok(())
    } else {
        Err(StartupError::IncompatibleVersion {
            found: observed.to_string(),
            minimum: minimum.to_string(),
        })
    }
}
