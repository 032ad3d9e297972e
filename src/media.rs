//! Media items: the unit of work consumed by the download engine.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::config::EngineConfig;
use crate::domain::DomainKey;
use crate::download::filename::{
    extension_of, filename_from_url, sanitize_filename, truncate_filename, truncate_folder_name,
};

const IMAGE_EXTENSIONS: &[&str] = &[
    ".jpg", ".jpeg", ".png", ".gif", ".gifv", ".webp", ".jpe", ".svg", ".jfif", ".tif", ".tiff",
    ".jif", ".bmp", ".avif", ".heic",
];
const VIDEO_EXTENSIONS: &[&str] = &[
    ".mpeg", ".avchd", ".webm", ".mpv", ".swf", ".avi", ".m4p", ".wmv", ".mp2", ".m4v", ".qt",
    ".mpe", ".mp4", ".flv", ".mov", ".mpg", ".ogg", ".mkv", ".mts", ".ts", ".f4v",
];
const AUDIO_EXTENSIONS: &[&str] = &[
    ".mp3", ".flac", ".wav", ".m4a", ".opus", ".aac", ".wma", ".alac", ".aiff", ".oga",
];

/// Coarse media category used by `excluded_types`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Images,
    Videos,
    Audio,
    Other,
}

impl MediaKind {
    /// Classifies a lowercased extension including the leading dot.
    #[must_use]
    pub fn from_extension(ext: &str) -> Self {
        let ext = ext.to_ascii_lowercase();
        if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            Self::Images
        } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            Self::Videos
        } else if AUDIO_EXTENSIONS.contains(&ext.as_str()) {
            Self::Audio
        } else {
            Self::Other
        }
    }
}

/// Errors building a [`MediaItem`] from untrusted input.
#[derive(Debug, Error)]
pub enum MediaItemError {
    #[error("invalid source URL `{url}`: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("cannot derive a filename from {url}")]
    NoFilename { url: String },

    #[error("invalid JSON media item: {0}")]
    Json(#[from] serde_json::Error),
}

/// One file to fetch.
///
/// Everything except `filename` is fixed at construction. `filename` is
/// rebound only by the owning download task while it resolves collisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaItem {
    source_url: Url,
    referer: Url,
    domain: DomainKey,
    album_id: Option<String>,
    download_folder: PathBuf,
    filename: String,
    original_filename: String,
    ext: String,
    expected_datetime: Option<i64>,
}

impl MediaItem {
    /// Creates an item whose names come from the URL's last path segment.
    ///
    /// # Errors
    ///
    /// Returns [`MediaItemError::NoFilename`] when the URL has no usable
    /// final segment.
    pub fn new(source_url: Url, download_folder: impl Into<PathBuf>) -> Result<Self, MediaItemError> {
        let original_filename =
            filename_from_url(&source_url).ok_or_else(|| MediaItemError::NoFilename {
                url: source_url.to_string(),
            })?;
        let filename = sanitize_filename(&original_filename);
        let ext = extension_of(&filename);
        Ok(Self {
            referer: source_url.clone(),
            domain: DomainKey::from_url(&source_url),
            source_url,
            album_id: None,
            download_folder: download_folder.into(),
            filename,
            original_filename,
            ext,
            expected_datetime: None,
        })
    }

    #[must_use]
    pub fn with_referer(mut self, referer: Url) -> Self {
        self.referer = referer;
        self
    }

    #[must_use]
    pub fn with_domain(mut self, domain: DomainKey) -> Self {
        self.domain = domain;
        self
    }

    #[must_use]
    pub fn with_album_id(mut self, album_id: impl Into<String>) -> Self {
        self.album_id = Some(album_id.into());
        self
    }

    /// Overrides the proposed and original filenames together.
    #[must_use]
    pub fn with_filename(mut self, original_filename: impl Into<String>) -> Self {
        self.original_filename = original_filename.into();
        self.filename = sanitize_filename(&self.original_filename);
        self.ext = extension_of(&self.filename);
        self
    }

    #[must_use]
    pub fn with_expected_datetime(mut self, unix_seconds: i64) -> Self {
        self.expected_datetime = Some(unix_seconds);
        self
    }

    /// Applies configured name length limits.
    #[must_use]
    pub fn with_name_limits(mut self, max_filename_length: usize, max_folder_name_length: usize) -> Self {
        self.filename = truncate_filename(&self.filename, max_filename_length);
        self.download_folder = truncate_folder_name(&self.download_folder, max_folder_name_length);
        self
    }

    /// Parses one JSON line of extractor output.
    ///
    /// Relative `download_folder` values are placed under the configured
    /// `download_root`.
    ///
    /// # Errors
    ///
    /// Returns an error when the JSON is malformed, the URL does not parse,
    /// or no filename can be derived.
    pub fn from_json_line(line: &str, config: &EngineConfig) -> Result<Self, MediaItemError> {
        let record: MediaItemRecord = serde_json::from_str(line)?;
        record.into_item(config)
    }

    #[must_use]
    pub fn source_url(&self) -> &Url {
        &self.source_url
    }

    #[must_use]
    pub fn referer(&self) -> &Url {
        &self.referer
    }

    #[must_use]
    pub fn domain(&self) -> &DomainKey {
        &self.domain
    }

    #[must_use]
    pub fn album_id(&self) -> Option<&str> {
        self.album_id.as_deref()
    }

    #[must_use]
    pub fn download_folder(&self) -> &Path {
        &self.download_folder
    }

    #[must_use]
    pub fn filename(&self) -> &str {
        &self.filename
    }

    #[must_use]
    pub fn original_filename(&self) -> &str {
        &self.original_filename
    }

    /// Lowercased extension including the dot, empty when absent.
    #[must_use]
    pub fn ext(&self) -> &str {
        &self.ext
    }

    #[must_use]
    pub fn expected_datetime(&self) -> Option<i64> {
        self.expected_datetime
    }

    #[must_use]
    pub fn kind(&self) -> MediaKind {
        MediaKind::from_extension(&self.ext)
    }

    /// Canonical history key path of the source URL.
    #[must_use]
    pub fn url_path(&self) -> String {
        self.domain.url_path(&self.source_url)
    }

    /// Final on-disk path for the current filename.
    #[must_use]
    pub fn final_path(&self) -> PathBuf {
        self.download_folder.join(&self.filename)
    }

    pub(crate) fn rebind_filename(&mut self, filename: String) {
        self.filename = filename;
    }
}

/// Serialized form of a [`MediaItem`], one per line of extractor output.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MediaItemRecord {
    pub source_url: String,
    #[serde(default)]
    pub referer: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub album_id: Option<String>,
    #[serde(default)]
    pub download_folder: Option<PathBuf>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub expected_datetime: Option<i64>,
}

impl MediaItemRecord {
    /// Builds the item, applying the configured root and name limits.
    ///
    /// # Errors
    ///
    /// See [`MediaItem::from_json_line`].
    pub fn into_item(self, config: &EngineConfig) -> Result<MediaItem, MediaItemError> {
        let source_url = parse_url(&self.source_url)?;
        let folder = match self.download_folder {
            Some(folder) if folder.is_absolute() => folder,
            Some(folder) => config.download_root.join(folder),
            None => config.download_root.clone(),
        };

        let mut item = MediaItem::new(source_url, folder)?;
        if let Some(filename) = self.filename.filter(|name| !name.trim().is_empty()) {
            item = item.with_filename(filename);
        }
        if let Some(referer) = self.referer {
            item = item.with_referer(parse_url(&referer)?);
        }
        if let Some(domain) = self.domain {
            item = item.with_domain(DomainKey::new(&domain));
        }
        if let Some(album_id) = self.album_id {
            item = item.with_album_id(album_id);
        }
        if let Some(timestamp) = self.expected_datetime {
            item = item.with_expected_datetime(timestamp);
        }
        Ok(item.with_name_limits(config.max_filename_length, config.max_folder_name_length))
    }
}

fn parse_url(raw: &str) -> Result<Url, MediaItemError> {
    Url::parse(raw).map_err(|source| MediaItemError::InvalidUrl {
        url: raw.to_string(),
        source,
    })
}
