//! Status line shown on the last terminal row.
//!
//! [`render_status`] is a pure function from [`StatusState`] to one line of
//! styled text; [`StatusLine`] owns the state and knows how to place that
//! line on the real terminal without disturbing the shell's cursor.

use crossterm::style::{Attribute, Color, ContentStyle};
use crossterm::{cursor, queue, terminal};
use std::collections::HashSet;
use std::fmt::Write as _;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

pub const COLOR_ACTIVE: Color = Color::AnsiValue(255);
pub const COLOR_SECONDARY: Color = Color::AnsiValue(242);
pub const COLOR_COMPLETED: Color = Color::Rgb {
    r: 112,
    g: 138,
    b: 88,
};
pub const COLOR_FAILED: Color = Color::AnsiValue(160);
pub const COLOR_INTERACTIVE: Color = Color::AnsiValue(220);

/// Spinner animation frames (braille dots pattern)
pub const SPINNER_FRAMES: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];
pub const SPINNER_INTERVAL_MS: u64 = 80;

pub const CHECKMARK: &str = "✓";
pub const XMARK: &str = "✗";

/// What the status line currently displays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Building,
    Ready,
    Failed,
    Paused,
    Watching,
    Idle,
}

#[derive(Debug, Clone, Default)]
pub struct StatusState {
    /// Paths whose change triggered the current or last build.
    pub changed_paths: Vec<PathBuf>,
    pub building: bool,
    /// A new environment is waiting to be picked up by the shell.
    pub reload_ready: bool,
    pub error: Option<String>,
    pub paused: bool,
    pub watched_paths: Vec<PathBuf>,
    build_start: Option<Instant>,
    pub build_duration: Option<Duration>,
}

impl StatusState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_building(&mut self, changed_paths: Vec<PathBuf>) {
        self.building = true;
        self.reload_ready = false;
        self.changed_paths = changed_paths;
        self.error = None;
        self.build_start = Some(Instant::now());
        self.build_duration = None;
    }

    pub fn set_reload_ready(&mut self, changed_paths: Vec<PathBuf>) {
        if let Some(start) = self.build_start.take() {
            self.build_duration = Some(start.elapsed());
        }
        self.building = false;
        self.reload_ready = true;
        self.changed_paths = changed_paths;
        self.error = None;
    }

    pub fn set_build_failed(&mut self, changed_paths: Vec<PathBuf>, error: String) {
        if let Some(start) = self.build_start.take() {
            self.build_duration = Some(start.elapsed());
        }
        self.building = false;
        self.reload_ready = false;
        self.changed_paths = changed_paths;
        self.error = Some(error);
    }

    /// Back to plain watching after the shell applied the reload.
    pub fn clear(&mut self) {
        self.building = false;
        self.reload_ready = false;
        self.changed_paths.clear();
        self.error = None;
        self.build_duration = None;
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    pub fn set_watched_paths(&mut self, paths: Vec<PathBuf>) {
        self.watched_paths = paths;
    }

    pub fn kind(&self) -> StatusKind {
        if self.building {
            StatusKind::Building
        } else if self.reload_ready {
            StatusKind::Ready
        } else if self.error.is_some() {
            StatusKind::Failed
        } else if self.paused {
            StatusKind::Paused
        } else if !self.watched_paths.is_empty() {
            StatusKind::Watching
        } else {
            StatusKind::Idle
        }
    }
}

/// Format duration for display, returning (number, unit) for separate coloring.
fn format_duration_parts(duration: Duration) -> (String, &'static str) {
    let total_secs = duration.as_secs();
    if total_secs < 1 {
        (duration.as_millis().to_string(), "ms")
    } else if total_secs < 60 {
        (format!("{:.1}", duration.as_secs_f64()), "s")
    } else {
        (format!("{}m {}", total_secs / 60, total_secs % 60), "s")
    }
}

/// File names of the changed paths, deduplicated, shortened to fit `max_len`.
fn format_changed_paths(changed_paths: &[PathBuf], max_len: usize) -> String {
    let mut seen = HashSet::new();
    let names: Vec<String> = changed_paths
        .iter()
        .map(|p| {
            p.file_name()
                .unwrap_or(p.as_os_str())
                .to_string_lossy()
                .into_owned()
        })
        .filter(|name| seen.insert(name.clone()))
        .collect();

    if names.is_empty() {
        return String::new();
    }

    for limit in (1..=3.min(names.len())).rev() {
        let remaining = names.len() - limit;
        let shown = names[..limit].join(", ");
        let result = if remaining > 0 {
            format!("{shown} +{remaining}")
        } else {
            shown
        };
        if result.chars().count() <= max_len {
            return result;
        }
    }

    format!("{} files", names.len())
}

struct Segment {
    text: String,
    color: Option<Color>,
    bold: bool,
}

fn seg(text: impl Into<String>, color: Color) -> Segment {
    Segment {
        text: text.into(),
        color: Some(color),
        bold: false,
    }
}

fn plain(text: impl Into<String>) -> Segment {
    Segment {
        text: text.into(),
        color: None,
        bold: false,
    }
}

fn bold(text: impl Into<String>, color: Color) -> Segment {
    Segment {
        text: text.into(),
        color: Some(color),
        bold: true,
    }
}

/// Left and right aligned segments for the state.
fn layout(state: &StatusState, width: u16, spinner_frame: usize) -> (Vec<Segment>, Vec<Segment>) {
    let narrow = width < 60;
    let reload_key = if narrow { "^⌥r" } else { "Ctrl-Alt-R" };
    let pause_key = if narrow { "^⌥d" } else { "Ctrl-Alt-D" };
    let files_max_len = (width as usize).saturating_sub(50).max(12);
    let changed = format_changed_paths(&state.changed_paths, files_max_len);
    let count = vec![
        seg(" | ", COLOR_SECONDARY),
        seg(state.watched_paths.len().to_string(), COLOR_COMPLETED),
        seg(" files", COLOR_SECONDARY),
    ];

    match state.kind() {
        StatusKind::Building => {
            let frame = SPINNER_FRAMES[spinner_frame % SPINNER_FRAMES.len()];
            let mut left = vec![
                seg(format!("{frame} "), COLOR_ACTIVE),
                seg("reshell ", COLOR_SECONDARY),
                bold("building", COLOR_ACTIVE),
            ];
            if !changed.is_empty() {
                left.push(plain(format!(": {changed}")));
            }
            left.extend(count);
            (left, Vec::new())
        }
        StatusKind::Ready => {
            let mut left = vec![
                seg(format!("{CHECKMARK} "), COLOR_COMPLETED),
                seg("reshell ", COLOR_SECONDARY),
                bold("ready", COLOR_ACTIVE),
            ];
            if let Some(duration) = state.build_duration {
                let (num, unit) = format_duration_parts(duration);
                left.push(seg(" in ", COLOR_SECONDARY));
                left.push(seg(num, COLOR_COMPLETED));
                left.push(seg(format!(" {unit}"), COLOR_SECONDARY));
            }
            if !changed.is_empty() {
                left.push(seg(" | ", COLOR_SECONDARY));
                left.push(seg(changed, COLOR_COMPLETED));
                left.push(seg(" changed", COLOR_SECONDARY));
            }
            left.extend(count);
            (left, vec![seg(reload_key, COLOR_INTERACTIVE), plain(" reload")])
        }
        StatusKind::Failed => {
            let message = state
                .error
                .as_deref()
                .and_then(|e| e.lines().find(|l| !l.trim().is_empty()))
                .unwrap_or("")
                .trim()
                .to_string();
            let mut left = vec![
                seg(format!("{XMARK} "), COLOR_FAILED),
                seg("reshell ", COLOR_SECONDARY),
                bold("failed", COLOR_FAILED),
            ];
            if let Some(duration) = state.build_duration {
                let (num, unit) = format_duration_parts(duration);
                left.push(seg(format!(" {num}{unit}"), COLOR_COMPLETED));
            }
            left.push(seg(format!(": {message}"), COLOR_FAILED));
            left.extend(count);
            (left, Vec::new())
        }
        StatusKind::Paused => {
            let mut left = vec![
                seg("⏸ ", COLOR_SECONDARY),
                seg("reshell ", COLOR_SECONDARY),
                bold("paused", COLOR_ACTIVE),
            ];
            left.extend(count);
            (left, vec![seg(pause_key, COLOR_INTERACTIVE), plain(" resume")])
        }
        StatusKind::Watching => {
            let mut left = vec![
                seg("● ", COLOR_SECONDARY),
                seg("reshell ", COLOR_SECONDARY),
                bold("watching", COLOR_ACTIVE),
            ];
            left.extend(count);
            (left, vec![seg(pause_key, COLOR_INTERACTIVE), plain(" pause")])
        }
        StatusKind::Idle => (Vec::new(), Vec::new()),
    }
}

fn text_len(segments: &[Segment]) -> usize {
    segments.iter().map(|s| s.text.chars().count()).sum()
}

/// Cut the segments down to `max` characters, ending in an ellipsis when
/// anything was dropped.
fn truncate(segments: &mut Vec<Segment>, max: usize) {
    if text_len(segments) <= max {
        return;
    }
    let mut budget = max.saturating_sub(1);
    let mut kept = Vec::new();
    for mut segment in segments.drain(..) {
        let len = segment.text.chars().count();
        if len <= budget {
            budget -= len;
            kept.push(segment);
            continue;
        }
        segment.text = segment.text.chars().take(budget).collect();
        kept.push(segment);
        break;
    }
    if max > 0 {
        kept.push(plain("…"));
    }
    *segments = kept;
}

fn compose(state: &StatusState, width: u16, spinner_frame: usize, styled: bool) -> String {
    let (mut left, mut right) = layout(state, width, spinner_frame);
    // One column of padding on each side.
    let avail = (width as usize).saturating_sub(2);

    let mut right_len = text_len(&right);
    if right_len + 2 > avail {
        right.clear();
        right_len = 0;
    }
    let gap = if right.is_empty() { 0 } else { 2 };
    truncate(&mut left, avail - right_len - gap);
    let pad = avail - text_len(&left) - right_len;

    let mut line = String::new();
    if width > 0 {
        line.push(' ');
    }
    let mut push = |segment: &Segment| {
        if styled {
            let mut style = ContentStyle::new();
            style.foreground_color = segment.color;
            if segment.bold {
                style.attributes.set(Attribute::Bold);
            }
            let _ = write!(line, "{}", style.apply(&segment.text));
        } else {
            line.push_str(&segment.text);
        }
    };
    left.iter().for_each(&mut push);
    push(&plain(" ".repeat(pad)));
    right.iter().for_each(&mut push);
    if width > 1 {
        line.push(' ');
    }
    line
}

/// Render the status line for a terminal `width` columns wide.
pub fn render_status(state: &StatusState, width: u16, spinner_frame: usize) -> String {
    compose(state, width, spinner_frame, true)
}

/// [`render_status`] without colors or attributes.
pub fn render_status_plain(state: &StatusState, width: u16, spinner_frame: usize) -> String {
    compose(state, width, spinner_frame, false)
}

/// Status line placed on the last row of the real terminal, below a scroll
/// region that holds the shell.
pub struct StatusLine {
    state: StatusState,
    enabled: bool,
    /// Child is on the alternate screen; the row belongs to it.
    suspended: bool,
    spinner_frame: usize,
}

impl StatusLine {
    pub fn new(enabled: bool) -> Self {
        Self {
            state: StatusState::new(),
            enabled,
            suspended: false,
            spinner_frame: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_visible(&self) -> bool {
        self.enabled && !self.suspended
    }

    pub fn set_suspended(&mut self, suspended: bool) {
        self.suspended = suspended;
    }

    pub fn state(&self) -> &StatusState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut StatusState {
        &mut self.state
    }

    pub fn advance_spinner(&mut self) {
        self.spinner_frame = (self.spinner_frame + 1) % SPINNER_FRAMES.len();
    }

    /// Rows available to the shell for a terminal `rows` high.
    pub fn content_rows(&self, rows: u16) -> u16 {
        if self.enabled {
            rows.saturating_sub(1).max(1)
        } else {
            rows
        }
    }

    /// Draw on the last row, leaving the cursor where it was.
    pub fn draw(&self, out: &mut impl Write, cols: u16, rows: u16) -> io::Result<()> {
        if !self.is_visible() || rows < 2 {
            return Ok(());
        }
        let line = render_status(&self.state, cols, self.spinner_frame);
        queue!(out, cursor::SavePosition)?;
        // Absolute addressing even if the shell enabled origin mode.
        out.write_all(b"\x1b[?6l")?;
        queue!(
            out,
            cursor::MoveTo(0, rows - 1),
            terminal::Clear(terminal::ClearType::CurrentLine)
        )?;
        out.write_all(line.as_bytes())?;
        queue!(out, cursor::RestorePosition)?;
        out.flush()
    }

    /// Confine scrolling to the rows above the status line.
    pub fn install_scroll_region(&self, out: &mut impl Write, rows: u16) -> io::Result<()> {
        if !self.is_visible() || rows < 2 {
            return Ok(());
        }
        // Scroll once if the cursor sits on the row we are about to claim.
        out.write_all(b"\n\x1b[1A")?;
        queue!(out, cursor::SavePosition)?;
        write!(out, "\x1b[1;{}r", rows - 1)?;
        queue!(out, cursor::RestorePosition)?;
        out.flush()
    }

    /// Release the scroll region and blank the status row.
    pub fn teardown(&self, out: &mut impl Write, rows: u16) -> io::Result<()> {
        if !self.enabled || rows < 2 {
            return Ok(());
        }
        queue!(out, cursor::SavePosition)?;
        out.write_all(b"\x1b[r")?;
        queue!(
            out,
            cursor::MoveTo(0, rows - 1),
            terminal::Clear(terminal::ClearType::CurrentLine),
            cursor::RestorePosition
        )?;
        out.flush()
    }
}
