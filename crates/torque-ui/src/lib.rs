#![deny(clippy::all)]

//! Terminal output for the task runner: styling that can be switched off
//! wholesale, a stable color per task for prefixed output, and replay of
//! captured logs on cache hits.

use std::{
    collections::HashMap,
    fmt::Display,
    io::Write,
    sync::{Arc, RwLock},
};

use console::{Style, StyledObject};
use once_cell::sync::Lazy;
use thiserror::Error;
use torquepath::AbsoluteSystemPath;

pub static GREY: Lazy<Style> = Lazy::new(|| Style::new().dim());
pub static BOLD_GREY: Lazy<Style> = Lazy::new(|| Style::new().dim().bold());
pub static BOLD: Lazy<Style> = Lazy::new(|| Style::new().bold());
pub static BOLD_GREEN: Lazy<Style> = Lazy::new(|| Style::new().green().bold());
pub static BOLD_RED: Lazy<Style> = Lazy::new(|| Style::new().red().bold());
pub static YELLOW: Lazy<Style> = Lazy::new(|| Style::new().yellow());
pub static MAGENTA: Lazy<Style> = Lazy::new(|| Style::new().magenta());
pub static CYAN: Lazy<Style> = Lazy::new(|| Style::new().cyan());

static TASK_COLORS: Lazy<[Style; 5]> = Lazy::new(|| {
    [
        Style::new().cyan(),
        Style::new().magenta(),
        Style::new().green(),
        Style::new().yellow(),
        Style::new().blue(),
    ]
});

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot read logs: {0}")]
    CannotReadLogs(#[source] std::io::Error),
    #[error("cannot write logs: {0}")]
    CannotWriteLogs(#[source] std::io::Error),
}

/// Whether to emit ANSI styling at all. Passed everywhere instead of being
/// consulted ambiently so tests can force either mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorConfig {
    pub should_strip_ansi: bool,
}

impl ColorConfig {
    pub fn new(should_strip_ansi: bool) -> Self {
        Self { should_strip_ansi }
    }

    pub fn infer() -> Self {
        Self {
            should_strip_ansi: !console::colors_enabled(),
        }
    }

    pub fn apply<D: Display>(&self, styled: StyledObject<D>) -> String {
        if self.should_strip_ansi {
            styled.force_styling(false).to_string()
        } else {
            styled.force_styling(true).to_string()
        }
    }

    /// One color per character. Reserved for the moment every task in a run
    /// was a cache hit.
    pub fn rainbow(&self, text: &str) -> String {
        if self.should_strip_ansi {
            return text.to_string();
        }
        text.chars()
            .enumerate()
            .map(|(i, c)| {
                let style = &TASK_COLORS[i % TASK_COLORS.len()];
                style.apply_to(c).force_styling(true).to_string()
            })
            .collect()
    }
}

#[macro_export]
macro_rules! color {
    ($color_config:expr, $color:expr, $($args:expr),+) => {
        $color_config.apply($color.apply_to(format!($($args),+)))
    };
}

#[macro_export]
macro_rules! cprintln {
    ($color_config:expr, $color:expr, $($args:expr),+) => {
        println!("{}", $crate::color!($color_config, $color, $($args),+))
    };
}

#[macro_export]
macro_rules! cprint {
    ($color_config:expr, $color:expr, $($args:expr),+) => {
        print!("{}", $crate::color!($color_config, $color, $($args),+))
    };
}

/// Hands out a stable color per key, cycling through a fixed palette in
/// first-seen order so reruns of the same graph color tasks the same way.
#[derive(Clone, Default)]
pub struct ColorSelector {
    inner: Arc<RwLock<HashMap<String, &'static Style>>>,
}

impl ColorSelector {
    pub fn color_for_key(&self, key: &str) -> &'static Style {
        if let Some(style) = self
            .inner
            .read()
            .expect("color lock poisoned")
            .get(key)
            .copied()
        {
            return style;
        }

        let mut lock = self.inner.write().expect("color lock poisoned");
        let style = &TASK_COLORS[lock.len() % TASK_COLORS.len()];
        *lock.entry(key.to_string()).or_insert(style)
    }

    pub fn prefix_with_color(&self, key: &str, prefix: &str) -> String {
        if prefix.is_empty() {
            return String::new();
        }
        let style = self.color_for_key(key);
        style.apply_to(format!("{prefix}: ")).to_string()
    }
}

/// Writes a prefix at the start of every line that passes through.
pub struct PrefixedWriter<W> {
    prefix: String,
    writer: W,
    needs_prefix: bool,
}

impl<W: Write> PrefixedWriter<W> {
    pub fn new(prefix: String, writer: W) -> Self {
        Self {
            prefix,
            writer,
            needs_prefix: true,
        }
    }
}

impl<W: Write> Write for PrefixedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        for chunk in buf.split_inclusive(|c| *c == b'\n') {
            if self.needs_prefix {
                self.writer.write_all(self.prefix.as_bytes())?;
            }
            self.writer.write_all(chunk)?;
            self.needs_prefix = chunk.ends_with(b"\n");
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

/// Per-task console output: status lines, warnings and errors, all behind
/// the task's prefix.
pub struct PrefixedUI<W> {
    color_config: ColorConfig,
    output_prefix: Option<String>,
    warn_prefix: Option<String>,
    error_prefix: Option<String>,
    out: W,
    err: W,
}

impl<W: Write> PrefixedUI<W> {
    pub fn new(color_config: ColorConfig, out: W, err: W) -> Self {
        Self {
            color_config,
            out,
            err,
            output_prefix: None,
            warn_prefix: None,
            error_prefix: None,
        }
    }

    pub fn with_output_prefix(mut self, output_prefix: String) -> Self {
        self.output_prefix = Some(output_prefix);
        self
    }

    pub fn with_warn_prefix(mut self, warn_prefix: String) -> Self {
        self.warn_prefix = Some(warn_prefix);
        self
    }

    pub fn with_error_prefix(mut self, error_prefix: String) -> Self {
        self.error_prefix = Some(error_prefix);
        self
    }

    pub fn output(&mut self, message: impl Display) {
        self.write_line(message, Command::Output)
    }

    pub fn warn(&mut self, message: impl Display) {
        self.write_line(message, Command::Warn)
    }

    pub fn error(&mut self, message: impl Display) {
        self.write_line(message, Command::Error)
    }

    fn write_line(&mut self, message: impl Display, command: Command) {
        let prefix = match command {
            Command::Output => &self.output_prefix,
            Command::Warn => &self.warn_prefix,
            Command::Error => &self.error_prefix,
        }
        .clone()
        .unwrap_or_default();
        let line = match command {
            Command::Output => message.to_string(),
            Command::Warn => self.color_config.apply(YELLOW.apply_to(message.to_string())),
            Command::Error => self
                .color_config
                .apply(BOLD_RED.apply_to(message.to_string())),
        };
        let writer = match command {
            Command::Output => &mut self.out,
            Command::Warn | Command::Error => &mut self.err,
        };

        // Not much to do if the terminal is gone.
        let _ = writeln!(writer, "{prefix}{line}");
    }

    /// A writer that streams child output under this task's prefix.
    pub fn output_prefixed_writer(&mut self) -> PrefixedWriter<&mut W> {
        PrefixedWriter::new(
            self.output_prefix.clone().unwrap_or_default(),
            &mut self.out,
        )
    }
}

enum Command {
    Output,
    Warn,
    Error,
}

/// Replays a captured log file into the given writer, as seen on cache
/// hits.
pub fn replay_logs<W: Write>(
    mut output: W,
    log_file_name: &AbsoluteSystemPath,
) -> Result<(), Error> {
    let log_file = log_file_name.read().map_err(Error::CannotReadLogs)?;
    output.write_all(&log_file).map_err(Error::CannotWriteLogs)?;
    output.flush().map_err(Error::CannotWriteLogs)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_prefixed_writer_prefixes_every_line() {
        let mut buffer = Vec::new();
        {
            let mut writer = PrefixedWriter::new("app: ".to_string(), &mut buffer);
            writer.write_all(b"line one\nline two\n").unwrap();
            writer.write_all(b"partial").unwrap();
            writer.write_all(b" line\n").unwrap();
        }
        assert_eq!(
            String::from_utf8(buffer).unwrap(),
            "app: line one\napp: line two\napp: partial line\n"
        );
    }

    #[test]
    fn test_color_selector_is_stable() {
        let selector = ColorSelector::default();
        let first = selector.color_for_key("a") as *const Style;
        let second = selector.color_for_key("b") as *const Style;
        assert_eq!(first, selector.color_for_key("a") as *const Style);
        assert_ne!(first, second);
    }

    #[test]
    fn test_strip_ansi() {
        let color_config = ColorConfig::new(true);
        assert_eq!(color!(color_config, BOLD, "plain {}", "text"), "plain text");
        assert_eq!(color_config.rainbow(">>> FULL TURBO"), ">>> FULL TURBO");
    }

    #[test]
    fn test_replay_logs() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let root = AbsoluteSystemPath::from_std_path(dir.path())?;
        let log_file = root.join_component("task.log");
        log_file.create_with_contents("cache hit, replaying logs\nhello\n")?;

        let mut replayed = Vec::new();
        replay_logs(&mut replayed, &log_file)?;
        assert_eq!(
            String::from_utf8(replayed).unwrap(),
            "cache hit, replaying logs\nhello\n"
        );
        Ok(())
    }
}
