//! Terminal presentation: progress bars driven by transfer events, file listings.

use anyhow::Result;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::Duration;

use crate::protocol::FileDescriptor;
use crate::reconnect::LinkStatus;
use crate::transfer::{Direction, EventStream, FileStatus, TransferEvent};

/// Human-readable size, e.g. `2.4 MB`
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["KB", "MB", "GB", "TB", "PB"];

    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

/// One line per file: kind label, size, name
pub fn format_listing(files: &[FileDescriptor]) -> String {
    if files.is_empty() {
        return "No files on server".to_string();
    }
    let mut out = String::new();
    for file in files {
        out.push_str(&format!(
            "{:<8} {:>10}  {}\n",
            file.kind().label(),
            format_size(file.size),
            file.name
        ));
    }
    let total: u64 = files.iter().map(|f| f.size).sum();
    out.push_str(&format!("{} files, {}", files.len(), format_size(total)));
    out
}

pub fn print_listing(files: &[FileDescriptor]) {
    println!("{}", format_listing(files));
}

pub fn print_listing_json(files: &[FileDescriptor]) -> Result<()> {
    #[derive(serde::Serialize)]
    struct Entry<'a> {
        name: &'a str,
        size: u64,
        kind: &'static str,
    }
    let entries: Vec<Entry> = files
        .iter()
        .map(|f| Entry {
            name: &f.name,
            size: f.size,
            kind: f.kind().label(),
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&entries)?);
    Ok(())
}

pub fn describe_link(status: LinkStatus) -> String {
    match status {
        LinkStatus::Disconnected => "disconnected".to_string(),
        LinkStatus::Connecting { attempt: 1 } => "connecting...".to_string(),
        LinkStatus::Connecting { attempt } => format!("reconnecting (attempt {})...", attempt),
        LinkStatus::Waiting { attempt, retry_in } => format!(
            "attempt {} failed, retrying in {}",
            attempt,
            humantime::format_duration(round_to_millis(retry_in))
        ),
        LinkStatus::Connected => "connected".to_string(),
        LinkStatus::Stopped => "stopped".to_string(),
    }
}

fn round_to_millis(d: Duration) -> Duration {
    Duration::from_millis(d.as_millis() as u64)
}

fn file_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{msg:24!} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
}

fn batch_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{prefix:>8} [{bar:40.green}] {pos}/{len} files")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-")
}

/// Renders [`TransferEvent`]s as a batch bar plus a bar for the current file.
/// With bars disabled only the per-file result lines are printed.
pub struct ProgressView {
    multi: MultiProgress,
    bars: bool,
    batch: Option<ProgressBar>,
    file: Option<ProgressBar>,
    succeeded: usize,
    failed: usize,
}

impl ProgressView {
    pub fn new(bars: bool) -> Self {
        let target = if bars {
            ProgressDrawTarget::stderr()
        } else {
            ProgressDrawTarget::hidden()
        };
        Self {
            multi: MultiProgress::with_draw_target(target),
            bars,
            batch: None,
            file: None,
            succeeded: 0,
            failed: 0,
        }
    }

    pub fn succeeded(&self) -> usize {
        self.succeeded
    }

    pub fn failed(&self) -> usize {
        self.failed
    }

    /// Consume events until every sender is gone
    pub async fn drain(&mut self, mut events: EventStream) {
        while let Some(event) = events.next().await {
            self.handle(event);
        }
    }

    pub fn handle(&mut self, event: TransferEvent) {
        match event {
            TransferEvent::BatchStarted { count } => {
                let bar = self.multi.add(ProgressBar::new(count as u64));
                bar.set_style(batch_style());
                bar.set_prefix("Upload");
                self.batch = Some(bar);
            }
            TransferEvent::Started {
                name, total_bytes, ..
            } => {
                let bar = self.multi.add(ProgressBar::new(total_bytes));
                bar.set_style(file_style());
                bar.set_message(name);
                self.file = Some(bar);
            }
            TransferEvent::Progress {
                bytes_transferred, ..
            } => {
                if let Some(bar) = &self.file {
                    bar.set_position(bytes_transferred);
                }
            }
            TransferEvent::Finished {
                name,
                direction,
                result,
            } => {
                if let Some(bar) = self.file.take() {
                    bar.finish_and_clear();
                }
                let verb = match direction {
                    Direction::Upload => "Uploaded",
                    Direction::Download => "Downloaded",
                };
                let line = match result {
                    Ok(bytes) => {
                        self.succeeded += 1;
                        format!("✓ {} {} ({})", verb, name, format_size(bytes))
                    }
                    Err(reason) => {
                        self.failed += 1;
                        format!("✗ {}: {}", name, reason)
                    }
                };
                self.println(&line);
                if let Some(bar) = &self.batch {
                    bar.inc(1);
                }
            }
            TransferEvent::BatchFinished { statuses } => {
                if let Some(bar) = self.batch.take() {
                    bar.finish_and_clear();
                }
                let ok = statuses.iter().filter(|s| **s == FileStatus::Ok).count();
                self.println(&format!(
                    "{} of {} files uploaded, {} failed",
                    ok,
                    statuses.len(),
                    statuses.len() - ok
                ));
            }
        }
    }

    fn println(&self, line: &str) {
        if self.bars {
            let _ = self.multi.println(line);
        } else {
            println!("{}", line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size_units() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(1023), "1023 B");
        assert_eq!(format_size(1024), "1.0 KB");
        assert_eq!(format_size(2_500_000), "2.4 MB");
        assert_eq!(format_size(5 * 1024 * 1024 * 1024), "5.0 GB");
    }

    #[test]
    fn test_listing_shows_kind_and_total() {
        let listing = format_listing(&[
            FileDescriptor::new("report.pdf", 2_500_000),
            FileDescriptor::new("notes.txt", 10),
        ]);
        let lines: Vec<&str> = listing.lines().collect();
        assert!(lines[0].starts_with("doc"));
        assert!(lines[0].ends_with("report.pdf"));
        assert!(lines[1].starts_with("text"));
        assert_eq!(lines[2], "2 files, 2.4 MB");
        assert_eq!(format_listing(&[]), "No files on server");
    }

    #[test]
    fn test_link_descriptions() {
        assert_eq!(describe_link(LinkStatus::Connecting { attempt: 1 }), "connecting...");
        assert_eq!(
            describe_link(LinkStatus::Waiting {
                attempt: 2,
                retry_in: Duration::from_micros(1_500_300),
            }),
            "attempt 2 failed, retrying in 1s 500ms"
        );
    }

    #[test]
    fn test_view_counts_outcomes() {
        let mut view = ProgressView::new(false);
        view.handle(TransferEvent::BatchStarted { count: 2 });
        view.handle(TransferEvent::Started {
            name: "a".into(),
            direction: Direction::Upload,
            total_bytes: 4,
        });
        view.handle(TransferEvent::Progress {
            name: "a".into(),
            direction: Direction::Upload,
            bytes_transferred: 4,
            total_bytes: 4,
        });
        view.handle(TransferEvent::Finished {
            name: "a".into(),
            direction: Direction::Upload,
            result: Ok(4),
        });
        view.handle(TransferEvent::Finished {
            name: "b".into(),
            direction: Direction::Upload,
            result: Err("disk full".into()),
        });
        view.handle(TransferEvent::BatchFinished {
            statuses: vec![FileStatus::Ok, FileStatus::Failed],
        });
        assert_eq!((view.succeeded(), view.failed()), (1, 1));
        assert!(view.batch.is_none() && view.file.is_none());
    }
}
