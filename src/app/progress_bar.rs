//! Terminal progress bar for download runs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use mediafetch_core::{FailureCategory, MediaItem, ProgressObserver, SkipReason};

/// Progress bar over the number of submitted items.
///
/// The message shows bytes written so far and the most recent item.
#[derive(Debug)]
pub(crate) struct ProgressBarObserver {
    bar: ProgressBar,
    bytes: AtomicU64,
}

impl ProgressBarObserver {
    pub(crate) fn new(total_items: u64) -> Self {
        let bar = ProgressBar::new(total_items);
        bar.set_style(
            ProgressStyle::with_template("{spinner} [{pos}/{len}] {wide_msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.enable_steady_tick(Duration::from_millis(120));
        Self {
            bar,
            bytes: AtomicU64::new(0),
        }
    }

    pub(crate) fn finish(&self) {
        self.bar.finish_and_clear();
    }

    fn show(&self, item: &MediaItem, status: &str) {
        let bytes = self.bytes.load(Ordering::Relaxed);
        self.bar.set_message(format!(
            "{} | {status} {}",
            HumanBytes(bytes),
            item.filename()
        ));
    }
}

impl ProgressObserver for ProgressBarObserver {
    fn task_added(&self, item: &MediaItem, _expected_bytes: Option<u64>) {
        self.show(item, "downloading");
    }

    fn bytes_advanced(&self, item: &MediaItem, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        self.show(item, "downloading");
    }

    fn task_completed(&self, item: &MediaItem) {
        self.bar.inc(1);
        self.show(item, "done");
    }

    fn task_skipped(&self, item: &MediaItem, reason: SkipReason) {
        self.bar.inc(1);
        self.show(item, &format!("skipped ({reason})"));
    }

    fn task_failed(&self, item: &MediaItem, category: FailureCategory) {
        self.bar.inc(1);
        self.show(item, &format!("failed ({category})"));
    }
}
