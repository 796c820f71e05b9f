//! Content and package validators used by the site reconcilers.

use once_cell::sync::Lazy;
use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContentError {
    #[error("unexpected closing delimiter at byte {0}")]
    UnexpectedClose(usize),
    #[error("nested opening delimiter at byte {0}")]
    Nested(usize),
    #[error("unclosed delimiter opened at byte {0}")]
    Unclosed(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PackageError {
    #[error("empty package name")]
    Empty,
    #[error("invalid package name {0:?}")]
    Invalid(String),
}

/// Checks template content before it is published.
pub trait ContentValidator: Send + Sync {
    fn validate(&self, content: &str) -> Result<(), ContentError>;
}

/// Checks script bundle package names.
#[async_trait::async_trait]
pub trait RegistryValidator: Send + Sync {
    async fn validate(&self, package: &str) -> Result<(), PackageError>;
}

/// Requires `{{` and `}}` to pair up without nesting.
#[derive(Debug, Default, Clone, Copy)]
pub struct DelimiterValidator;

impl ContentValidator for DelimiterValidator {
    fn validate(&self, content: &str) -> Result<(), ContentError> {
        let bytes = content.as_bytes();
        let mut open: Option<usize> = None;
        let mut i = 0;
        while i + 1 < bytes.len() {
            match (bytes[i], bytes[i + 1]) {
                (b'{', b'{') => {
                    if open.is_some() {
                        return Err(ContentError::Nested(i));
                    }
                    open = Some(i);
                    i += 2;
                }
                (b'}', b'}') => {
                    if open.take().is_none() {
                        return Err(ContentError::UnexpectedClose(i));
                    }
                    i += 2;
                }
                _ => i += 1,
            }
        }
        match open {
            Some(at) => Err(ContentError::Unclosed(at)),
            None => Ok(()),
        }
    }
}

static PACKAGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(@[a-z0-9-~][a-z0-9-._~]*/)?[a-z0-9-~][a-z0-9-._~]*(@[^\s]+)?$").unwrap()
});

/// Offline package-name check (npm naming, optional `@scope/` and `@version`).
#[derive(Debug, Default, Clone, Copy)]
pub struct PackageNameValidator;

#[async_trait::async_trait]
impl RegistryValidator for PackageNameValidator {
    async fn validate(&self, package: &str) -> Result<(), PackageError> {
        if package.trim().is_empty() {
            return Err(PackageError::Empty);
        }
        if !PACKAGE_RE.is_match(package) {
            return Err(PackageError::Invalid(package.to_string()));
        }
        Ok(())
    }
}
