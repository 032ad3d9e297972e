//! Filename derivation, sanitization, and collision candidates.
//!
//! These helpers are pure: they never touch the filesystem. Collision
//! resolution itself lives in the download task where the history store and
//! the file lock are available.

use std::path::{Component, Path, PathBuf};

use url::Url;

/// Suffix appended to the final path while bytes are still arriving.
pub const PART_SUFFIX: &str = ".part";

/// Last URL path segment, percent-decoded.
pub(crate) fn filename_from_url(url: &Url) -> Option<String> {
    let last = url.path_segments()?.next_back()?;
    if last.is_empty() {
        return None;
    }
    let decoded = urlencoding::decode(last).map_or_else(|_| last.to_string(), |d| d.into_owned());
    Some(decoded)
}

/// Lowercased extension including the dot, or an empty string.
pub(crate) fn extension_of(filename: &str) -> String {
    match filename.rfind('.') {
        Some(index) if index > 0 && index + 1 < filename.len() => {
            filename[index..].to_ascii_lowercase()
        }
        _ => String::new(),
    }
}

/// Splits `name` into stem and extension (with dot).
pub(crate) fn split_stem(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(index) if index > 0 => (&name[..index], &name[index..]),
        _ => (name, ""),
    }
}

/// Sanitizes a filename for filesystem safety.
///
/// Replaces characters that are invalid on common filesystems:
/// / \ : * ? " < > |
pub(crate) fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    if sanitized.is_empty() {
        return "_".to_string();
    }

    if is_safe_filename_segment(&sanitized) {
        sanitized
    } else {
        sanitized
            .chars()
            .map(|c| if c == '.' { '_' } else { c })
            .collect()
    }
}

fn is_safe_filename_segment(name: &str) -> bool {
    !Path::new(name).components().any(|component| {
        matches!(
            component,
            Component::CurDir | Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    })
}

/// Truncates a filename to `max_chars` characters, keeping its extension.
pub(crate) fn truncate_filename(name: &str, max_chars: usize) -> String {
    if name.chars().count() <= max_chars {
        return name.to_string();
    }
    let (stem, ext) = split_stem(name);
    let ext_chars = ext.chars().count();
    if ext_chars >= max_chars {
        return name.chars().take(max_chars).collect();
    }
    let kept: String = stem.chars().take(max_chars - ext_chars).collect();
    format!("{}{ext}", kept.trim_end())
}

/// Truncates the last component of `folder` to `max_chars` characters.
pub(crate) fn truncate_folder_name(folder: &Path, max_chars: usize) -> PathBuf {
    let Some(name) = folder.file_name().and_then(|n| n.to_str()) else {
        return folder.to_path_buf();
    };
    if name.chars().count() <= max_chars {
        return folder.to_path_buf();
    }
    let truncated: String = name.chars().take(max_chars).collect();
    folder.with_file_name(truncated.trim_end())
}

/// The `i`-th collision candidate for `name`: `"{stem} ({i}){ext}"`.
///
/// The stem is shortened so the candidate stays within `max_chars`.
///
/// ```text
/// collision_candidate("pic.jpg", 1, 95) == "pic (1).jpg"
/// ```
pub(crate) fn collision_candidate(name: &str, index: u32, max_chars: usize) -> String {
    let (stem, ext) = split_stem(name);
    let suffix = format!(" ({index}){ext}");
    let room = max_chars.saturating_sub(suffix.chars().count());
    let kept: String = stem.chars().take(room).collect();
    format!("{}{suffix}", kept.trim_end())
}

/// The `.part` sibling of `final_path`.
#[must_use]
pub fn part_path(final_path: &Path) -> PathBuf {
    let mut os = final_path.as_os_str().to_owned();
    os.push(PART_SUFFIX);
    PathBuf::from(os)
}
