//! Camera slot identities and the configured source list

use serde::Serialize;
use std::fmt;

/// Number of camera slots served by the relay
pub const CAMERA_COUNT: usize = 9;

/// Identity of a camera slot, always within `1..=CAMERA_COUNT`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct CameraId(u8);

impl CameraId {
    /// Create an id from its 1-based number
    pub fn new(id: u8) -> Option<Self> {
        if (1..=CAMERA_COUNT as u8).contains(&id) {
            Some(Self(id))
        } else {
            None
        }
    }

    /// Create an id from a 0-based slot index
    pub fn from_index(index: usize) -> Option<Self> {
        if index < CAMERA_COUNT {
            Some(Self(index as u8 + 1))
        } else {
            None
        }
    }

    /// Parse a `cam{N}` path segment
    pub fn from_slug(slug: &str) -> Option<Self> {
        let digits = slug.strip_prefix("cam")?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse::<u8>().ok().and_then(Self::new)
    }

    /// All camera ids in ascending order
    pub fn all() -> impl Iterator<Item = CameraId> {
        (1..=CAMERA_COUNT as u8).map(CameraId)
    }

    pub fn get(self) -> u8 {
        self.0
    }

    /// 0-based slot index
    pub fn index(self) -> usize {
        usize::from(self.0 - 1)
    }

    /// The `cam{N}` form used in paths and log lines
    pub fn slug(self) -> String {
        format!("cam{}", self.0)
    }
}

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cam{}", self.0)
    }
}

/// Source URL per camera slot. `None` means the slot is unconfigured.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CameraUrls([Option<String>; CAMERA_COUNT]);

impl CameraUrls {
    /// Build from an ordered list of entries, truncated or padded to
    /// `CAMERA_COUNT`. Blank entries count as unconfigured.
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = Option<S>>,
        S: AsRef<str>,
    {
        let mut urls = Self::default();
        for (slot, entry) in urls.0.iter_mut().zip(entries) {
            *slot = normalize_url(entry.as_ref().map(|s| s.as_ref()));
        }
        urls
    }

    pub fn get(&self, camera: CameraId) -> Option<&str> {
        self.0[camera.index()].as_deref()
    }

    pub fn set(&mut self, camera: CameraId, url: Option<String>) {
        self.0[camera.index()] = normalize_url(url.as_deref());
    }

    pub fn iter(&self) -> impl Iterator<Item = (CameraId, Option<&str>)> {
        CameraId::all().zip(self.0.iter().map(|url| url.as_deref()))
    }

    /// Number of configured slots
    pub fn configured(&self) -> usize {
        self.0.iter().filter(|url| url.is_some()).count()
    }

    /// Entries as written to the configuration file (`""` for unconfigured)
    pub fn to_file_entries(&self) -> Vec<String> {
        self.0
            .iter()
            .map(|url| url.clone().unwrap_or_default())
            .collect()
    }
}

/// Trim a raw URL entry; blank entries become `None`
pub fn normalize_url(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
}
