//! Version query surface, reported at startup and in status replies.

use serde::Serialize;

/// Decoder version information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionInfo {
    /// Major version.
    pub major: u32,
    /// Minor version.
    pub minor: u32,
    /// Patch version.
    pub patch: u32,
    /// `major.minor.patch`.
    pub short: String,
    /// Short version plus the implementing package.
    pub long: String,
}

fn parse_component(value: &str) -> u32 {
    value.parse().unwrap_or(0)
}

/// Version of this crate.
#[must_use]
pub fn version() -> VersionInfo {
    let short = env!("CARGO_PKG_VERSION").to_string();
    VersionInfo {
        major: parse_component(env!("CARGO_PKG_VERSION_MAJOR")),
        minor: parse_component(env!("CARGO_PKG_VERSION_MINOR")),
        patch: parse_component(env!("CARGO_PKG_VERSION_PATCH")),
        long: format!("{short} ({})", env!("CARGO_PKG_NAME")),
        short,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_components_match_short() {
        let v = version();
        assert_eq!(v.short, format!("{}.{}.{}", v.major, v.minor, v.patch));
        assert!(v.long.starts_with(&v.short));
        assert!(v.long.contains("fr-decoder"));
    }
}
