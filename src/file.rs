//! Size-rotating XML file sink.
//!
//! Every event becomes one `<message>` element inside a `<logfile>` root.
//! When the next write would push the file past the size cap, the file is
//! closed (producing the closing tag) and renamed with an epoch stamp. A file
//! already present on (re)open is archived first, stamped with its
//! modification time.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::event::{format_stamp, LogEvent};
use crate::level::Level;
use crate::sink::{LevelGate, Sink};

/// Default size cap: 10 MiB.
pub const DEFAULT_MAX_SIZE: u64 = 10 * 1024 * 1024;

/// Room reserved for the closing `</logfile>` line.
const CLOSING_RESERVE: u64 = 12;

struct FileState {
    file: Option<File>,
    size: u64,
}

/// Sink appending XML fragments to a file, rotating by size.
pub struct FileSink {
    path: PathBuf,
    max_size: u64,
    gate: LevelGate,
    state: Mutex<FileState>,
}

impl FileSink {
    /// Open (or re-open) `path` with the default 10 MiB cap. A failure to
    /// open is tolerated here; the next write retries and reports `false`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_max_size(path, DEFAULT_MAX_SIZE)
    }

    pub fn with_max_size(path: impl Into<PathBuf>, max_size: u64) -> Self {
        let sink = Self {
            path: path.into(),
            max_size,
            gate: LevelGate::default(),
            state: Mutex::new(FileState { file: None, size: 0 }),
        };
        {
            let mut state = sink.lock();
            if !sink.open(&mut state) {
                tracing::warn!(path = %sink.path.display(), "could not open log file");
            }
        }
        sink
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FileState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Archive any pre-existing file, then start a fresh one.
    fn open(&self, state: &mut FileState) -> bool {
        if let Ok(meta) = fs::metadata(&self.path) {
            let stamp = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            if !self.archive(&stamp) {
                return false;
            }
        }

        let mut file = match File::create(&self.path) {
            Ok(file) => file,
            Err(error) => {
                tracing::warn!(path = %self.path.display(), %error, "open failed");
                return false;
            }
        };
        if file.write_all(b"<logfile>\n").and_then(|()| file.flush()).is_err() {
            return false;
        }
        state.size = 10;
        state.file = Some(file);
        true
    }

    /// Write the closing tag and archive the finished file.
    fn close(&self, state: &mut FileState) -> bool {
        if let Some(mut file) = state.file.take() {
            let _ = file.write_all(b"</logfile>\n").and_then(|()| file.flush());
        }
        state.size = 0;
        self.archive(&Utc::now())
    }

    fn archive(&self, stamp: &DateTime<Utc>) -> bool {
        let mut archived = self.path.clone().into_os_string();
        archived.push(format!("-{}", format_stamp(stamp)));
        match fs::rename(&self.path, Path::new(&archived)) {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!(path = %self.path.display(), %error, "archive rename failed");
                false
            }
        }
    }

    fn rotate(&self, state: &mut FileState) -> bool {
        self.close(state) && self.open(state)
    }
}

/// Wrap `text` in CDATA, splitting any embedded `]]>` across two sections so
/// the payload survives arbitrary message bytes.
fn cdata(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 24);
    out.push_str("<![CDATA[");
    let mut rest = text;
    while let Some(i) = rest.find("]]>") {
        out.push_str(&rest[..i + 2]);
        out.push_str("]]><![CDATA[");
        rest = &rest[i + 2..];
    }
    out.push_str(rest);
    out.push_str("]]>");
    out
}

#[async_trait]
impl Sink for FileSink {
    fn name(&self) -> String {
        format!("file: '{}'", self.path.display())
    }

    fn min_level(&self) -> Level {
        self.gate.get()
    }

    fn set_min_level(&self, level: Level) {
        self.gate.set(level);
    }

    async fn send(&self, event: &LogEvent) -> bool {
        let mut state = self.lock();
        if state.file.is_none() && !self.open(&mut state) {
            return false;
        }

        let line = format!(
            "<message level=\"{}\"><time>{}</time><subsystem>{}</subsystem>\
             <function>{}</function><text>{}</text></message>\n",
            event.level.name(),
            event.time_string,
            event.subsystem_name,
            event.function,
            cdata(&event.message),
        );

        if state.size + line.len() as u64 + CLOSING_RESERVE > self.max_size
            && !self.rotate(&mut state)
        {
            return false;
        }

        let Some(file) = state.file.as_mut() else { return false };
        match file.write_all(line.as_bytes()).and_then(|()| file.flush()) {
            Ok(()) => {
                state.size += line.len() as u64;
                true
            }
            Err(error) => {
                tracing::warn!(path = %self.path.display(), %error, "write failed");
                false
            }
        }
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        let mut state = self.lock();
        if state.file.is_some() {
            self.close(&mut state);
        }
    }
}
