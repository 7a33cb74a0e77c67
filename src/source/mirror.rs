// Ordered upstream mirror list, fixed at startup.

use std::fmt;

use reqwest::Url;
use thiserror::Error;

use crate::path::NormalizedPath;

#[derive(Debug, Error)]
#[error("invalid mirror location {location:?}: {reason}")]
pub struct InvalidMirror {
    pub location: String,
    pub reason: String,
}

impl InvalidMirror {
    fn new(location: &str, reason: impl Into<String>) -> Self {
        Self {
            location: location.to_string(),
            reason: reason.into(),
        }
    }
}

/// One upstream repository base. Lower rank is tried first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorEndpoint {
    rank: usize,
    base: Url,
}

impl MirrorEndpoint {
    pub fn parse(rank: usize, location: &str) -> Result<Self, InvalidMirror> {
        let trimmed = location.trim();
        let base = Url::parse(trimmed).map_err(|e| InvalidMirror::new(trimmed, e.to_string()))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(InvalidMirror::new(trimmed, "scheme must be http or https"));
        }
        if base.cannot_be_a_base() || base.host_str().is_none() {
            return Err(InvalidMirror::new(trimmed, "missing host"));
        }
        if base.query().is_some() || base.fragment().is_some() {
            return Err(InvalidMirror::new(trimmed, "query and fragment are not allowed"));
        }
        Ok(Self { rank, base })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Upstream location of `path` on this mirror: the base with the artifact
    /// path elements appended.
    pub fn artifact_url(&self, path: &NormalizedPath) -> Url {
        let mut url = self.base.clone();
        // Cannot fail: parse() rejects cannot-be-a-base URLs.
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(path.segments());
        }
        url
    }
}

impl fmt::Display for MirrorEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}", self.rank, self.base)
    }
}

#[derive(Debug, Clone)]
pub struct MirrorList {
    endpoints: Vec<MirrorEndpoint>,
}

impl MirrorList {
    /// Parse mirror locations in priority order.
    pub fn parse<I, S>(locations: I) -> Result<Self, InvalidMirror>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let endpoints = locations
            .into_iter()
            .enumerate()
            .map(|(rank, location)| MirrorEndpoint::parse(rank, location.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { endpoints })
    }

    pub fn iter(&self) -> impl Iterator<Item = &MirrorEndpoint> {
        self.endpoints.iter()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}
