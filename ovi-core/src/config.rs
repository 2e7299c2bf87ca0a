use std::path::PathBuf;

/// Which registry an operation talks to and where cached content lives.
///
/// The host may carry an explicit scheme (`http://127.0.0.1:5000` for a
/// local registry); without one, https is assumed.
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    pub host: String,
    pub organization: String,
    /// Root of the content-addressed cache (`<root>/ghcr/<org>/...`).
    pub cache_root: PathBuf,
    /// When false every cache read misses and writes are skipped; the
    /// transfer still completes through scratch directories.
    pub cache_enabled: bool,
}

impl RegistryConfig {
    pub fn new(host: impl Into<String>, organization: impl Into<String>, cache_root: PathBuf) -> Self {
        Self {
            host: host.into(),
            organization: organization.into(),
            cache_root,
            cache_enabled: true,
        }
    }
}
