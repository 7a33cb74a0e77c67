// Artifact path normalization. The resulting key is shared by the cache store and the in-flight registry.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("empty artifact path")]
    Empty,
    #[error("path escapes the repository root")]
    EscapesRoot,
    #[error("invalid path segment {0:?}")]
    InvalidSegment(String),
}

/// A canonical, validated artifact path.
///
/// Built from an already percent-decoded request path. Empty and `.` segments
/// are dropped and `..` is resolved, so every spelling of the same artifact
/// yields the same key. Segments starting with `.` are refused: the cache
/// keeps its own bookkeeping under dot-prefixed names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NormalizedPath {
    segments: Vec<String>,
}

impl NormalizedPath {
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        let mut segments: Vec<String> = Vec::new();
        for segment in raw.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    if segments.pop().is_none() {
                        return Err(PathError::EscapesRoot);
                    }
                }
                s if s.starts_with('.') || s.contains('\\') || s.contains('\0') => {
                    return Err(PathError::InvalidSegment(s.to_string()));
                }
                s => segments.push(s.to_string()),
            }
        }
        if segments.is_empty() {
            return Err(PathError::Empty);
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().map(String::as_str)
    }

    /// Last path element, e.g. `a-1.0.jar`.
    pub fn file_name(&self) -> &str {
        // parse() guarantees at least one segment.
        self.segments.last().map(String::as_str).unwrap_or_default()
    }

    /// Extension of the file name without the dot, if any.
    pub fn extension(&self) -> Option<&str> {
        let name = self.file_name();
        name.rsplit_once('.').map(|(_, ext)| ext)
    }

    /// Relative filesystem path mirroring the artifact hierarchy.
    pub fn to_relative_path(&self) -> PathBuf {
        self.segments.iter().collect()
    }
}

impl fmt::Display for NormalizedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("/"))
    }
}
