use indicatif::{HumanBytes, ProgressBar, ProgressDrawTarget, ProgressStyle};
use m3u8_dl_engine::DownloadEvent;
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

fn segment_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} {msg}\n[{elapsed_precise}] [{bar:40.green/white}] {pos}/{len} segments (eta {eta})")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

/// Renders batch progress events as a single segment counter bar.
#[derive(Clone)]
pub struct ProgressManager {
    bar: ProgressBar,
    bytes: Arc<AtomicU64>,
    disabled: bool,
}

impl ProgressManager {
    pub fn new() -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(segment_style());
        Self {
            bar,
            bytes: Arc::new(AtomicU64::new(0)),
            disabled: false,
        }
    }

    pub fn new_disabled() -> Self {
        Self {
            bar: ProgressBar::with_draw_target(Some(0), ProgressDrawTarget::hidden()),
            bytes: Arc::new(AtomicU64::new(0)),
            disabled: true,
        }
    }

    pub fn handle_event(&self, event: DownloadEvent) {
        if self.disabled {
            return;
        }

        match event {
            DownloadEvent::BatchStarted { total } => {
                self.bar.set_length(total as u64);
                self.bar.set_message("Downloading segments");
                self.bar.enable_steady_tick(Duration::from_millis(500));
            }
            DownloadEvent::KeyResolved => {
                self.bar.set_message("Downloading and decrypting segments");
            }
            DownloadEvent::SegmentCompleted { bytes, .. } => {
                let total = self.bytes.fetch_add(bytes, Ordering::Relaxed) + bytes;
                self.bar.inc(1);
                self.bar.set_message(format!("Downloaded {}", HumanBytes(total)));
            }
            DownloadEvent::SegmentFailed { index, error } => {
                self.bar.inc(1);
                self.bar.println(format!("Segment {index} failed: {error}"));
            }
            DownloadEvent::BatchFinished { stats } => {
                self.bar.finish_with_message(format!("Finished: {stats}"));
            }
        }
    }

    #[inline]
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use m3u8_dl_engine::BatchStats;

    #[test]
    fn test_disabled_manager_ignores_events() {
        let manager = ProgressManager::new_disabled();
        assert!(manager.is_disabled());
        manager.handle_event(DownloadEvent::BatchStarted { total: 3 });
        assert_eq!(manager.bar.position(), 0);
    }

    #[test]
    fn test_counts_completed_and_failed_segments() {
        let manager = ProgressManager::new();
        manager.handle_event(DownloadEvent::BatchStarted { total: 2 });
        manager.handle_event(DownloadEvent::SegmentCompleted { index: 1, bytes: 188 });
        manager.handle_event(DownloadEvent::SegmentFailed {
            index: 2,
            error: "HTTP error".to_string(),
        });
        assert_eq!(manager.bar.position(), 2);
        assert_eq!(manager.bar.length(), Some(2));

        manager.handle_event(DownloadEvent::BatchFinished {
            stats: BatchStats {
                total: 2,
                completed: 1,
                failed: 1,
                ..Default::default()
            },
        });
        assert!(manager.bar.is_finished());
    }
}
