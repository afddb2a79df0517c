use chrono::{DateTime, Utc};

use crate::adapters::telegram::{InlineKeyboardButton, InlineKeyboardMarkup};
use crate::app::commands::{FixOutcome, HistoryPage, StatusReport};
use crate::domain::duration::format_duration;
use crate::domain::models::{PowerEvent, PowerState};

pub const HELP_TEXT: &str = "*Power outage monitor*\n\
/status - current power state\n\
/history N - page N of recent outages, newest first\n\
/fix - probe the devices now and repair the recorded state\n\
/help - this message";

pub const WELCOME_TEXT: &str = "👋 *Power outage monitor*\n\
You will get a message whenever power goes out or comes back.\n\
Use the buttons below or /help for the command list.";

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

pub fn render_event(event: &PowerEvent) -> String {
    match event {
        PowerEvent::MonitoringStarted { at, state } => format!(
            "🔌 *Power monitor started*\nState: {state}\nAt: {}",
            format_timestamp(*at)
        ),
        PowerEvent::OutageStarted { started_at, .. } => format!(
            "⚠️ *Power outage detected*\nStarted: {}",
            format_timestamp(*started_at)
        ),
        PowerEvent::PowerRestored {
            started_at,
            ended_at,
            duration_seconds,
            ..
        } => format!(
            "✅ *Power restored*\nOutage started: {}\nRestored: {}\nDuration: {}",
            format_timestamp(*started_at),
            format_timestamp(*ended_at),
            format_duration(*duration_seconds)
        ),
    }
}

pub fn render_status(report: &StatusReport) -> String {
    let mut lines = vec![match report.state {
        PowerState::Up => "🟢 *Power is UP*".to_string(),
        PowerState::Down => "🔴 *Power is DOWN*".to_string(),
        PowerState::Unknown => "⚪ *Power state unknown*".to_string(),
    }];

    if let Some(outage) = &report.outage {
        lines.push(format!(
            "Outage since {} ({})",
            format_timestamp(outage.started_at),
            format_duration(outage.elapsed_seconds)
        ));
    }

    lines.push(match report.last_checked_at {
        Some(at) => format!("Last check: {}", format_timestamp(at)),
        None => "No check recorded yet".to_string(),
    });

    lines.join("\n")
}

pub fn render_history(page: &HistoryPage) -> String {
    let mut lines = vec![format!(
        "📜 *Outages, last {} days* (page {}/{})",
        page.window_days, page.page, page.page_count
    )];

    if page.outages.is_empty() {
        lines.push("No outages recorded.".to_string());
    }

    for outage in &page.outages {
        let ended = outage
            .ended_at
            .map_or_else(|| "ongoing".to_string(), format_timestamp);
        lines.push(format!(
            "#{} {} → {} ({})",
            outage.id,
            format_timestamp(outage.started_at),
            ended,
            format_duration(outage.duration_seconds.unwrap_or_default())
        ));
    }

    lines.push(String::new());
    lines.push(format!(
        "Outages: {} | Downtime: {} | Average: {}",
        page.stats.count,
        format_duration(page.stats.total_downtime_seconds),
        format_duration(page.stats.average_duration_seconds)
    ));

    lines.join("\n")
}

pub fn render_fix(outcome: &FixOutcome) -> String {
    format!("🛠 *Fix*: {}", outcome.describe())
}

pub fn main_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![
        vec![
            InlineKeyboardButton::callback("Status", "status"),
            InlineKeyboardButton::callback("History", "history:1"),
        ],
        vec![
            InlineKeyboardButton::callback("Fix", "fix"),
            InlineKeyboardButton::callback("Help", "help"),
        ],
    ])
}

/// Prev/next row for the history pager, plus the main row.
pub fn history_keyboard(page: u32, page_count: u32) -> InlineKeyboardMarkup {
    let mut pager = Vec::new();
    if page > 1 {
        pager.push(InlineKeyboardButton::callback(
            "◀ Newer",
            format!("history:{}", page - 1),
        ));
    }
    if page < page_count {
        pager.push(InlineKeyboardButton::callback(
            "Older ▶",
            format!("history:{}", page + 1),
        ));
    }

    let mut rows = Vec::new();
    if !pager.is_empty() {
        rows.push(pager);
    }
    rows.push(vec![
        InlineKeyboardButton::callback("Status", "status"),
        InlineKeyboardButton::callback("Help", "help"),
    ]);
    InlineKeyboardMarkup::new(rows)
}
