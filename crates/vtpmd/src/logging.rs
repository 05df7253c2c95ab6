//! Logging initialization from the `--log` options.
//!
//! `RUST_LOG` wins when set; otherwise the numeric `level` maps onto the
//! filter. Output goes to stderr, a file, or an inherited descriptor, with
//! an optional per-line prefix.

use std::fs::File;
use std::io::{self, Write};
use std::os::fd::FromRawFd;
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriter};
use tracing_subscriber::EnvFilter;

use crate::config::{ConfigError, LogOptions};

struct SharedFile(Arc<Mutex<File>>);

impl Write for SharedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner).flush()
    }
}

struct PrefixWriter<W: Write> {
    inner: W,
    prefix: Arc<str>,
    started: bool,
}

impl<W: Write> Write for PrefixWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.started {
            self.inner.write_all(self.prefix.as_bytes())?;
            self.started = true;
        }
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct PrefixMake<M> {
    inner: M,
    prefix: Arc<str>,
}

impl<'a, M: MakeWriter<'a>> MakeWriter<'a> for PrefixMake<M> {
    type Writer = PrefixWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        PrefixWriter { inner: self.inner.make_writer(), prefix: self.prefix.clone(), started: false }
    }
}

fn file_writer(file: File, prefix: Option<&str>) -> BoxMakeWriter {
    let shared = Arc::new(Mutex::new(file));
    let make = move || SharedFile(shared.clone());
    match prefix {
        Some(p) => BoxMakeWriter::new(PrefixMake { inner: make, prefix: Arc::from(p) }),
        None => BoxMakeWriter::new(make),
    }
}

/// Initialize the global subscriber. Safe to call more than once; later
/// calls are ignored.
pub fn init(opts: &LogOptions) -> Result<(), ConfigError> {
    let level = match opts.level {
        0 | 1 => "info",
        2..=4 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let writer: BoxMakeWriter = if let Some(path) = &opts.file {
        let file = File::options()
            .create(true)
            .write(true)
            .append(!opts.truncate)
            .truncate(opts.truncate)
            .open(path)
            .map_err(|e| {
                ConfigError::Invalid(format!("--log: opening {}: {e}", path.display()))
            })?;
        file_writer(file, opts.prefix.as_deref())
    } else if let Some(fd) = opts.fd {
        // The descriptor was handed over for the lifetime of the process.
        let file = unsafe { File::from_raw_fd(fd) };
        file_writer(file, opts.prefix.as_deref())
    } else {
        match &opts.prefix {
            Some(p) => {
                BoxMakeWriter::new(PrefixMake { inner: io::stderr, prefix: Arc::from(p.as_str()) })
            }
            None => BoxMakeWriter::new(io::stderr),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .ok();
    Ok(())
}
