use std::sync::atomic::{AtomicBool, Ordering};

const KIB: f64 = 1024.0;
const MIB: f64 = KIB * 1024.0;
const GIB: f64 = MIB * 1024.0;

/// Check whether an optional cancellation flag has been raised.
#[must_use]
pub fn cancel_requested(cancel: Option<&AtomicBool>) -> bool {
    cancel
        .map(|flag| flag.load(Ordering::SeqCst))
        .unwrap_or(false)
}

/// Render a human-friendly transfer speed string.
#[must_use]
pub fn format_speed(bytes_per_sec: f64) -> String {
    format!("{}/s", format_size(bytes_per_sec.max(0.0) as u64))
}

/// Render a byte count as B/KB/MB/GB.
#[must_use]
pub fn format_size(bytes: u64) -> String {
    let value = bytes as f64;
    if value < KIB {
        format!("{bytes} B")
    } else if value < MIB {
        format!("{:.1} KB", value / KIB)
    } else if value < GIB {
        format!("{:.1} MB", value / MIB)
    } else {
        format!("{:.2} GB", value / GIB)
    }
}

/// Completion percentage for `count` blocks of `block_size` out of `total_size` bytes.
#[must_use]
pub fn progress_percent(count: u64, block_size: u64, total_size: u64) -> f64 {
    if total_size == 0 {
        return 0.0;
    }
    let done = count.saturating_mul(block_size) as f64 / total_size as f64;
    (done * 100.0).min(100.0)
}
