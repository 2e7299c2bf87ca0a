use crate::error::{OviError, Result};

/// Parsed `name:tag` image reference. The registry host and organisation
/// come from `RegistryConfig`; the name may contain path segments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageReference {
    pub name: String,
    pub tag: String,
}

impl ImageReference {
    pub fn parse(raw: &str) -> Result<Self> {
        let (name, tag) = raw
            .rsplit_once(':')
            .ok_or_else(|| OviError::InvalidImageFormat(raw.to_string()))?;
        if name.is_empty() || tag.is_empty() {
            return Err(OviError::InvalidImageFormat(raw.to_string()));
        }
        Ok(Self {
            name: name.to_string(),
            tag: tag.to_string(),
        })
    }

    /// Repository path under the configured organisation.
    pub fn repository(&self, organization: &str) -> String {
        format!("{}/{}", organization, self.name)
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_name_and_tag() {
        let r = ImageReference::parse("macos-sequoia:15.2").unwrap();
        assert_eq!(r.name, "macos-sequoia");
        assert_eq!(r.tag, "15.2");
        assert_eq!(r.repository("acme"), "acme/macos-sequoia");
        assert_eq!(r.to_string(), "macos-sequoia:15.2");
    }

    #[test]
    fn last_colon_separates_the_tag() {
        let r = ImageReference::parse("nested/image:v1").unwrap();
        assert_eq!(r.name, "nested/image");
        assert_eq!(r.tag, "v1");
    }

    #[test]
    fn missing_tag_is_rejected() {
        assert!(matches!(
            ImageReference::parse("no-tag"),
            Err(OviError::InvalidImageFormat(_))
        ));
        assert!(matches!(
            ImageReference::parse("trailing:"),
            Err(OviError::InvalidImageFormat(_))
        ));
        assert!(matches!(
            ImageReference::parse(":latest"),
            Err(OviError::InvalidImageFormat(_))
        ));
    }
}
