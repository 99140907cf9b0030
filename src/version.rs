//! Version information with embedded git metadata.

/// Package version from Cargo.toml.
pub const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Git commit SHA (short) at build time, or "unknown" if unavailable.
pub const GIT_SHA: &str = match option_env!("VERGEN_GIT_SHA") {
    Some(sha) => sha,
    None => "unknown",
};

/// Full version string: `{version}+{sha}`.
pub fn version_string() -> String {
    format!("{PKG_VERSION}+{}", &GIT_SHA[..7.min(GIT_SHA.len())])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_string_starts_with_pkg_version() {
        assert!(version_string().starts_with(PKG_VERSION));
    }
}
