//! Output formatting for the control commands

use crate::protocol::{LogEntry, StatsInfo, StatusInfo};
use chrono::{DateTime, Local};
use std::time::Duration;

/// Human readable status block
pub fn format_status(status: &StatusInfo) -> String {
    let mut out = format!("State:     {}", status.state);

    if let Some(pid) = status.pid {
        out.push_str(&format!("\nPID:       {}", pid));
    }
    if let Some(uptime) = status.uptime_secs {
        out.push_str(&format!(
            "\nUptime:    {}",
            format_duration(Duration::from_secs(uptime))
        ));
    }
    if status.run_id > 0 {
        out.push_str(&format!("\nRun:       #{}", status.run_id));
    }
    if let Some(exit) = &status.last_exit {
        out.push_str(&format!("\nLast exit: {}", exit));
    }
    if let Some(error) = &status.last_error {
        out.push_str(&format!("\nError:     {}", error));
    }

    out
}

pub fn format_stats(stats: &StatsInfo) -> String {
    let server = if stats.running {
        format!(
            "Server:  pid {}, {:.1}% CPU, {} RSS, up {}",
            stats.pid.map(|p| p.to_string()).unwrap_or_else(|| "?".into()),
            stats.cpu_percent,
            format_bytes(stats.memory_bytes),
            format_duration(Duration::from_secs(stats.uptime_secs)),
        )
    } else {
        "Server:  not running".to_string()
    };

    format!(
        "{}\nHost:    {:.1}% CPU, {} / {} memory",
        server,
        stats.host_cpu_percent,
        format_bytes(stats.host_memory_used),
        format_bytes(stats.host_memory_total),
    )
}

/// One log line as `HH:MM:SS [stream] text`
pub fn format_log_entry(entry: &LogEntry) -> String {
    let time = DateTime::from_timestamp_millis(entry.timestamp)
        .map(|t| t.with_timezone(&Local).format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "--:--:--".to_string());

    format!("{} [{}] {}", time, entry.stream, entry.text)
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Compact duration such as `1d 2h 3m` or `42s`
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (days, hours, mins, secs) = (
        secs / 86_400,
        (secs % 86_400) / 3600,
        (secs % 3600) / 60,
        secs % 60,
    );

    if days > 0 {
        format!("{}d {}h {}m", days, hours, mins)
    } else if hours > 0 {
        format!("{}h {}m {}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}
