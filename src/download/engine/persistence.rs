//! Append-only CSV log of failed items.
//!
//! One line per failed item: `url,referer,message`. Fields containing a
//! comma, quote, or line break are quoted with embedded quotes doubled.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::media::MediaItem;

const HEADER: &str = "url,referer,message\n";

/// Serialized writer for the failure log.
#[derive(Debug)]
pub struct ErrorLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl ErrorLog {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one line for `item`.
    ///
    /// The header is written when the file is new. Write failures are logged
    /// and swallowed; the log never decides an item's outcome.
    pub async fn record(&self, item: &MediaItem, message: &str) {
        let line = format_line(
            item.source_url().as_str(),
            item.referer().as_str(),
            message,
        );
        let _guard = self.write_lock.lock().await;
        if let Err(error) = self.append(&line).await {
            warn!(path = %self.path.display(), %error, "failed to write error log");
        } else {
            debug!(path = %self.path.display(), url = %item.source_url(), "error log line written");
        }
    }

    async fn append(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let is_new = tokio::fs::metadata(&self.path)
            .await
            .map(|meta| meta.len() == 0)
            .unwrap_or(true);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        if is_new {
            file.write_all(HEADER.as_bytes()).await?;
        }
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }
}

fn format_line(url: &str, referer: &str, message: &str) -> String {
    format!(
        "{},{},{}\n",
        csv_field(url),
        csv_field(referer),
        csv_field(message)
    )
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use url::Url;

    #[test]
    fn test_csv_field_quoting() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_field("two\nlines"), "\"two\nlines\"");
    }

    #[tokio::test]
    async fn test_record_writes_header_once() {
        let dir = TempDir::new().unwrap();
        let log = ErrorLog::new(dir.path().join("logs").join("errors.csv"));
        let item = MediaItem::new(Url::parse("https://cyberdrop.me/f/a.jpg").unwrap(), "/d")
            .unwrap()
            .with_referer(Url::parse("https://cyberdrop.me/a/xyz").unwrap());

        log.record(&item, "HTTP 404 fetching https://cyberdrop.me/f/a.jpg")
            .await;
        log.record(&item, "timeout, again").await;

        let contents = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "url,referer,message");
        assert_eq!(
            lines[1],
            "https://cyberdrop.me/f/a.jpg,https://cyberdrop.me/a/xyz,HTTP 404 fetching https://cyberdrop.me/f/a.jpg"
        );
        assert_eq!(
            lines[2],
            "https://cyberdrop.me/f/a.jpg,https://cyberdrop.me/a/xyz,\"timeout, again\""
        );
    }
}
