//! Image descriptors and their ordering
//!
//! [`ImageDef`] describes a desired server image; [`ImageRef`] is the resolved
//! artifact handed to the container engine. Candidate definitions are ordered by
//! [`compare_image_defs`] so selection over a candidate set is deterministic.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A desired server image
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageDef {
    pub version: String,
    #[serde(default)]
    pub build_no: u32,
    #[serde(default)]
    pub use_community_edition: bool,
    #[serde(default)]
    pub use_serverless: bool,
    #[serde(default)]
    pub use_columnar: bool,
}

impl ImageDef {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            ..Default::default()
        }
    }

    pub fn with_build(mut self, build_no: u32) -> Self {
        self.build_no = build_no;
        self
    }

    pub fn community(mut self) -> Self {
        self.use_community_edition = true;
        self
    }

    pub fn serverless(mut self) -> Self {
        self.use_serverless = true;
        self
    }

    pub fn columnar(mut self) -> Self {
        self.use_columnar = true;
        self
    }

    /// Version string including the build number when one is set
    pub fn server_version(&self) -> String {
        if self.build_no > 0 {
            format!("{}-{}", self.version, self.build_no)
        } else {
            self.version.clone()
        }
    }
}

impl fmt::Display for ImageDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let edition = if self.use_community_edition {
            "community"
        } else {
            "enterprise"
        };
        write!(f, "{} {}", edition, self.server_version())?;
        if self.use_serverless {
            write!(f, " (serverless)")?;
        }
        if self.use_columnar {
            write!(f, " (columnar)")?;
        }
        Ok(())
    }
}

/// A resolved, concrete image artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub image_path: String,
}

impl ImageRef {
    pub fn new(image_path: impl Into<String>) -> Self {
        Self {
            image_path: image_path.into(),
        }
    }
}

/// Total order over image definitions.
///
/// Keys, most significant first: semantic version, build number, community
/// before enterprise, non-serverless before serverless, non-columnar before
/// columnar.
pub fn compare_image_defs(a: &ImageDef, b: &ImageDef) -> Ordering {
    compare_versions(&a.version, &b.version)
        .then_with(|| a.build_no.cmp(&b.build_no))
        .then_with(|| b.use_community_edition.cmp(&a.use_community_edition))
        .then_with(|| a.use_serverless.cmp(&b.use_serverless))
        .then_with(|| a.use_columnar.cmp(&b.use_columnar))
}

/// Semantic version precedence over dotted strings. Invalid versions sort
/// before valid ones and are equal to each other.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    match (SemVer::parse(a), SemVer::parse(b)) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
    }
}

#[derive(Debug, PartialEq, Eq)]
enum PreId {
    Numeric(u64),
    Alpha(String),
}

impl Ord for PreId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (PreId::Numeric(a), PreId::Numeric(b)) => a.cmp(b),
            (PreId::Numeric(_), PreId::Alpha(_)) => Ordering::Less,
            (PreId::Alpha(_), PreId::Numeric(_)) => Ordering::Greater,
            (PreId::Alpha(a), PreId::Alpha(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for PreId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, PartialEq, Eq)]
struct SemVer {
    core: [u64; 3],
    pre: Vec<PreId>,
}

impl SemVer {
    /// Accepts `MAJOR[.MINOR[.PATCH]][-PRE][+BUILD]` with an optional `v` prefix.
    fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        let input = input.strip_prefix('v').unwrap_or(input);

        // build metadata never participates in precedence
        let input = input.split_once('+').map_or(input, |(v, _)| v);
        let (core_str, pre_str) = match input.split_once('-') {
            Some((core, pre)) => (core, Some(pre)),
            None => (input, None),
        };

        let mut core = [0u64; 3];
        let mut parts = 0;
        for part in core_str.split('.') {
            if parts == 3 || !is_numeric_ident(part) {
                return None;
            }
            core[parts] = part.parse().ok()?;
            parts += 1;
        }

        // shorthand forms like "7.1" must not carry a pre-release suffix
        if parts < 3 && pre_str.is_some() {
            return None;
        }

        let mut pre = Vec::new();
        if let Some(pre_str) = pre_str {
            for ident in pre_str.split('.') {
                if ident.is_empty() || !ident.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
                {
                    return None;
                }
                if ident.chars().all(|c| c.is_ascii_digit()) {
                    if ident.len() > 1 && ident.starts_with('0') {
                        return None;
                    }
                    pre.push(PreId::Numeric(ident.parse().ok()?));
                } else {
                    pre.push(PreId::Alpha(ident.to_string()));
                }
            }
        }

        Some(SemVer { core, pre })
    }
}

impl Ord for SemVer {
    fn cmp(&self, other: &Self) -> Ordering {
        self.core.cmp(&other.core).then_with(|| {
            match (self.pre.is_empty(), other.pre.is_empty()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) => self.pre.cmp(&other.pre),
            }
        })
    }
}

impl PartialOrd for SemVer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn is_numeric_ident(s: &str) -> bool {
    !s.is_empty()
        && s.chars().all(|c| c.is_ascii_digit())
        && !(s.len() > 1 && s.starts_with('0'))
}
