use crate::config::LoggingConfig;
use anyhow::Context;
use regex::Regex;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::Subscriber;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer, Registry};

const DEFAULT_PII: &[(&str, &str)] = &[
    (r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}", "[EMAIL]"),
    (r"(?i)(password|passwd|token|secret)\s*[=:]\s*\S+", "$1=[REDACTED]"),
];

pub(crate) struct RedactingWriter<W> {
    inner: W,
    patterns: Arc<Vec<(Regex, String)>>,
}

impl<W: io::Write> io::Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let s = String::from_utf8_lossy(buf);
        let mut redacted = s.to_string();
        for (re, replacement) in self.patterns.iter() {
            redacted = re.replace_all(&redacted, replacement.as_str()).to_string();
        }
        self.inner.write_all(redacted.as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Log file shared by every writer the layer hands out.
#[derive(Clone)]
pub(crate) struct SharedFile(Arc<Mutex<File>>);

impl io::Write for SharedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut file = self.0.lock().unwrap_or_else(|e| e.into_inner());
        file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut file = self.0.lock().unwrap_or_else(|e| e.into_inner());
        file.flush()
    }
}

#[derive(Clone)]
struct RedactingMakeWriter<T> {
    target: T,
    patterns: Arc<Vec<(Regex, String)>>,
}

impl<'a> MakeWriter<'a> for RedactingMakeWriter<()> {
    type Writer = RedactingWriter<io::Stderr>;

    fn make_writer(&self) -> Self::Writer {
        RedactingWriter {
            inner: io::stderr(),
            patterns: Arc::clone(&self.patterns),
        }
    }
}

impl<'a> MakeWriter<'a> for RedactingMakeWriter<SharedFile> {
    type Writer = RedactingWriter<SharedFile>;

    fn make_writer(&self) -> Self::Writer {
        RedactingWriter {
            inner: self.target.clone(),
            patterns: Arc::clone(&self.patterns),
        }
    }
}

/// Compile the configured redaction patterns, skipping invalid ones.
pub(crate) fn redaction_patterns(config: &LoggingConfig) -> Vec<(Regex, String)> {
    let mut patterns = Vec::new();
    if !config.redaction.enabled {
        return patterns;
    }
    if config.redaction.use_default_pii {
        for (re, placeholder) in DEFAULT_PII {
            if let Ok(re) = Regex::new(re) {
                patterns.push((re, placeholder.to_string()));
            }
        }
    }
    for p in &config.redaction.patterns {
        match Regex::new(&p.regex) {
            Ok(re) => patterns.push((re, p.placeholder.clone())),
            Err(e) => eprintln!("warning: ignoring redaction pattern '{}': {}", p.name, e),
        }
    }
    patterns
}

fn fmt_layer<S, W>(config: &LoggingConfig, writer: W, ansi: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let show_file = config.format.location.show_file;
    let show_line = config.format.location.show_line;

    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(show_file)
        .with_file(show_file)
        .with_line_number(show_line)
        .with_thread_ids(false);

    match (config.format.json, config.format.show_time) {
        (true, true) => layer.json().boxed(),
        (true, false) => layer.json().without_time().boxed(),
        (false, true) => layer.boxed(),
        (false, false) => layer.without_time().boxed(),
    }
}

/// `<dir>/log_<unix seconds>.txt`
fn log_file_path(dir: &Path) -> PathBuf {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    dir.join(format!("log_{}.txt", ts))
}

/// Install the process-wide subscriber. Events go to stderr (stdout carries
/// command output) and, when enabled, to a log file whose path is returned.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<Option<PathBuf>> {
    let level = if config.verbose {
        "debug"
    } else {
        config.levels.directive()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let patterns = Arc::new(redaction_patterns(config));
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    layers.push(fmt_layer(
        config,
        RedactingMakeWriter {
            target: (),
            patterns: Arc::clone(&patterns),
        },
        true,
    ));

    let mut file_path = None;
    if config.file.enabled {
        std::fs::create_dir_all(&config.file.dir)
            .with_context(|| format!("cannot create log directory {}", config.file.dir.display()))?;
        let path = log_file_path(&config.file.dir);
        let file = File::create(&path)
            .with_context(|| format!("cannot create log file {}", path.display()))?;
        layers.push(fmt_layer(
            config,
            RedactingMakeWriter {
                target: SharedFile(Arc::new(Mutex::new(file))),
                patterns,
            },
            false,
        ));
        file_path = Some(path);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .context("logging already initialised")?;
    Ok(file_path)
}
