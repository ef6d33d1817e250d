//! Terminal sink.
//!
//! One line per event, wrapped in ANSI color on unix-like hosts. 256-color
//! terminals get a dedicated palette; `COLORFGBG` switches between the dark
//! and light variants.

use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::event::LogEvent;
use crate::level::Level;
use crate::sink::{LevelGate, Sink};

/// Escape prefix per level, indexed by `Level as usize`.
type Palette = [&'static str; 7];

/// 8/16-color terminals.
static BASIC: Palette = ["\x1b[37m", "\x1b[37m", "", "\x1b[32m", "\x1b[33m", "\x1b[31m", "\x1b[1;31m"];

/// 256-color terminal, dark background: the fine levels fade into grey.
static DARK_256: Palette = [
    "\x1b[38;5;240m",
    "\x1b[38;5;244m",
    "\x1b[38;5;248m",
    "\x1b[32m",
    "\x1b[33m",
    "\x1b[31m",
    "\x1b[1;31m",
];

/// 256-color terminal, light background: the grey ramp is inverted.
static LIGHT_256: Palette = [
    "\x1b[38;5;248m",
    "\x1b[38;5;244m",
    "\x1b[38;5;240m",
    "\x1b[32m",
    "\x1b[33m",
    "\x1b[31m",
    "\x1b[1;31m",
];

const RESET: &str = "\x1b[0m";

/// Pick a palette from the `TERM` and `COLORFGBG` environment values.
///
/// Only terminals whose `TERM` ends in `-256color` get the extended palettes.
/// `COLORFGBG` has the form `fg;bg`; a background of 7 or above 9 selects the
/// light palette. Anything malformed falls back to the dark palette.
fn select_palette(term: Option<&str>, colorfgbg: Option<&str>) -> &'static Palette {
    let Some(term) = term else { return &BASIC };
    if !term.ends_with("-256color") {
        return &BASIC;
    }

    let Some(fgbg) = colorfgbg else { return &DARK_256 };
    let Some((fg, bg)) = fgbg.split_once(';') else { return &DARK_256 };
    let all_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if !all_digits(fg) || !all_digits(bg) {
        return &DARK_256;
    }
    let Ok(bg) = bg.parse::<u32>() else { return &DARK_256 };
    if bg == 7 || bg > 9 {
        &LIGHT_256
    } else {
        &DARK_256
    }
}

fn palette_from_env() -> Option<&'static Palette> {
    if !cfg!(unix) {
        return None;
    }
    let term = std::env::var("TERM").ok();
    let colorfgbg = std::env::var("COLORFGBG").ok();
    Some(select_palette(term.as_deref(), colorfgbg.as_deref()))
}

/// Sink writing one formatted line per event to standard output.
pub struct StdoutSink {
    name: String,
    gate: LevelGate,
    palette: Option<&'static Palette>,
    writer: Mutex<Box<dyn Write + Send>>,
}

impl StdoutSink {
    /// Stdout with coloring probed from the environment. Registered as
    /// `"stdout"` by the default logger.
    pub fn new() -> Self {
        Self {
            name: "stdout".to_owned(),
            gate: LevelGate::default(),
            palette: palette_from_env(),
            writer: Mutex::new(Box::new(std::io::stdout())),
        }
    }

    /// Uncolored sink writing to an arbitrary target, mainly for tests and
    /// embedding.
    pub fn with_writer(name: &str, writer: Box<dyn Write + Send>) -> Self {
        Self {
            name: if name.is_empty() { "stdout".to_owned() } else { name.to_owned() },
            gate: LevelGate::default(),
            palette: None,
            writer: Mutex::new(writer),
        }
    }

    fn render(&self, event: &LogEvent) -> String {
        // the subsystem column is exactly eight characters wide
        let subsystem: String = event.subsystem_name.chars().take(8).collect();
        let line = format!(
            "{} [{:<7}] [{:<8}] {}",
            event.time_string,
            event.level.name(),
            subsystem,
            event.message
        );
        match self.palette {
            Some(palette) => format!("{}{}{}\n", palette[event.level as usize], line, RESET),
            None => format!("{line}\n"),
        }
    }
}

impl Default for StdoutSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sink for StdoutSink {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn retry_delay(&self) -> Duration {
        Duration::from_secs(10)
    }

    fn min_level(&self) -> Level {
        self.gate.get()
    }

    fn set_min_level(&self, level: Level) {
        self.gate.set(level);
    }

    async fn send(&self, event: &LogEvent) -> bool {
        let line = self.render(event);
        let mut writer = self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        writer.write_all(line.as_bytes()).and_then(|()| writer.flush()).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::SubsystemId;
    use chrono::Utc;
    use std::sync::Arc;

    #[test]
    fn plain_term_gets_the_basic_palette() {
        assert!(std::ptr::eq(select_palette(Some("xterm"), None), &BASIC));
        assert!(std::ptr::eq(select_palette(None, None), &BASIC));
        assert!(std::ptr::eq(select_palette(Some("vt100"), Some("15;0")), &BASIC));
    }

    #[test]
    fn short_term_name_is_not_a_256color_match() {
        assert!(std::ptr::eq(select_palette(Some("256color"), None), &BASIC));
        assert!(std::ptr::eq(select_palette(Some("-256color"), None), &DARK_256));
    }

    #[test]
    fn colorfgbg_selects_light_or_dark() {
        let term = Some("xterm-256color");
        assert!(std::ptr::eq(select_palette(term, None), &DARK_256));
        assert!(std::ptr::eq(select_palette(term, Some("15;0")), &DARK_256));
        assert!(std::ptr::eq(select_palette(term, Some("0;7")), &LIGHT_256));
        assert!(std::ptr::eq(select_palette(term, Some("0;10")), &LIGHT_256));
        assert!(std::ptr::eq(select_palette(term, Some("0;9")), &DARK_256));
    }

    #[test]
    fn malformed_colorfgbg_falls_back_to_dark() {
        let term = Some("rxvt-256color");
        assert!(std::ptr::eq(select_palette(term, Some("15")), &DARK_256));
        assert!(std::ptr::eq(select_palette(term, Some(";7")), &DARK_256));
        assert!(std::ptr::eq(select_palette(term, Some("a;b")), &DARK_256));
        assert!(std::ptr::eq(select_palette(term, Some("15;-1")), &DARK_256));
        assert!(std::ptr::eq(select_palette(term, Some("15;7;3")), &DARK_256));
    }

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn event(subsystem_name: &str, message: &str) -> LogEvent {
        LogEvent {
            level: Level::Warning,
            subsystem: SubsystemId::for_tests(0),
            message: message.to_owned(),
            timestamp: Utc::now(),
            function: "/UNKNOWN/".to_owned(),
            subsystem_name: subsystem_name.to_owned(),
            time_string: "2021-03-07 14:05:09.042".to_owned(),
        }
    }

    #[tokio::test]
    async fn line_format_pads_level_and_subsystem() {
        let buffer = SharedBuffer::default();
        let sink = StdoutSink::with_writer("stdout", Box::new(buffer.clone()));

        assert!(sink.write(&event("db", "ready")).await);

        let bytes = buffer.0.lock().unwrap().clone();
        let line = String::from_utf8(bytes).unwrap();
        assert_eq!(line, "2021-03-07 14:05:09.042 [warning] [db      ] ready\n");
    }

    #[tokio::test]
    async fn long_subsystem_names_are_cut_to_the_column() {
        let buffer = SharedBuffer::default();
        let sink = StdoutSink::with_writer("stdout", Box::new(buffer.clone()));

        assert!(sink.write(&event("verylongsubsystem", "x")).await);

        let bytes = buffer.0.lock().unwrap().clone();
        let line = String::from_utf8(bytes).unwrap();
        assert!(line.contains("[verylong]"), "got {line:?}");
    }

    #[test]
    fn retry_delay_is_ten_seconds() {
        let sink = StdoutSink::with_writer("stdout", Box::new(std::io::sink()));
        assert_eq!(sink.retry_delay(), Duration::from_secs(10));
    }
}
