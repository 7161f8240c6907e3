//! Progress-bar rendering helpers.

/// Linear quantization of `done/total` into `segments` filled blocks.
pub fn render_progress(done: u64, total: u64, segments: usize) -> String {
    let segments = segments.max(1);
    if total == 0 {
        return format!("{} 100%", "█".repeat(segments));
    }
    let percent = (done.min(total) * 100) / total;
    let blocks = ((percent as usize) * segments / 100).min(segments);
    format!(
        "{}{} {percent}%",
        "█".repeat(blocks),
        "░".repeat(segments - blocks)
    )
}

/// Formats an elapsed-seconds value as `Nm Ss`.
pub fn format_elapsed(elapsed_secs: u64) -> String {
    format!("{}m {}s", elapsed_secs / 60, elapsed_secs % 60)
}
