//! Source locators accepted by the creation pipeline.

use std::fmt;

use serde::Serialize;

/// Literal locator asking the pipeline to wait for a user upload.
pub const UPLOAD_TOKEN: &str = "upload";

/// Where the image bytes come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "location", rename_all = "snake_case")]
pub enum SourceLocator {
    /// A concrete, fetchable location (http, https or file URL).
    Remote(String),
    /// The upload token; resolved later through an upload session.
    Upload,
}

impl SourceLocator {
    /// Classify raw input. The upload token matches case-insensitively.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.eq_ignore_ascii_case(UPLOAD_TOKEN) {
            Self::Upload
        } else {
            Self::Remote(trimmed.to_string())
        }
    }

    pub fn is_upload(&self) -> bool {
        matches!(self, SourceLocator::Upload)
    }

    pub fn as_str(&self) -> &str {
        match self {
            SourceLocator::Remote(location) => location.as_str(),
            SourceLocator::Upload => UPLOAD_TOKEN,
        }
    }
}

impl fmt::Display for SourceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_token_is_case_insensitive() {
        assert_eq!(SourceLocator::parse("UPLOAD"), SourceLocator::Upload);
        assert_eq!(SourceLocator::parse(" Upload "), SourceLocator::Upload);
        assert!(SourceLocator::parse("upload").is_upload());
    }

    #[test]
    fn other_input_is_remote() {
        let locator = SourceLocator::parse("https://example.com/upload");
        assert_eq!(
            locator,
            SourceLocator::Remote("https://example.com/upload".to_string())
        );
        assert_eq!(locator.as_str(), "https://example.com/upload");
    }
}
