//! Log sinks that mask secrets before any bytes leave the process.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use autotagger_sanitize::redact;
use tracing_subscriber::fmt::MakeWriter;

type Sink = Box<dyn Write + Send>;

/// [`MakeWriter`] that redacts each formatted event, then fans it out to
/// stderr and, optionally, an append-only log file.
#[derive(Clone)]
pub(crate) struct RedactingMakeWriter {
    sinks: Arc<Mutex<Vec<Sink>>>,
}

impl RedactingMakeWriter {
    /// Stderr, plus `log_file` opened for appending when given.
    pub(crate) fn new(log_file: Option<&Path>) -> io::Result<Self> {
        let mut sinks: Vec<Sink> = vec![Box::new(io::stderr())];
        if let Some(path) = log_file {
            let file: File = OpenOptions::new().create(true).append(true).open(path)?;
            sinks.push(Box::new(file));
        }
        Ok(Self::from_sinks(sinks))
    }

    fn from_sinks(sinks: Vec<Sink>) -> Self {
        Self {
            sinks: Arc::new(Mutex::new(sinks)),
        }
    }
}

impl<'a> MakeWriter<'a> for RedactingMakeWriter {
    type Writer = RedactingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter {
            sinks: Arc::clone(&self.sinks),
            buf: Vec::new(),
        }
    }
}

/// Buffers one event; redacts and emits it on flush or drop.
pub(crate) struct RedactingWriter {
    sinks: Arc<Mutex<Vec<Sink>>>,
    buf: Vec<u8>,
}

impl RedactingWriter {
    fn emit(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let clean = redact(&String::from_utf8_lossy(&self.buf));
        self.buf.clear();

        // A poisoned lock only means another thread panicked mid-write.
        let mut sinks = self.sinks.lock().unwrap_or_else(|e| e.into_inner());
        for sink in sinks.iter_mut() {
            sink.write_all(clean.as_bytes())?;
            sink.flush()?;
        }
        Ok(())
    }
}

impl Write for RedactingWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.emit()
    }
}

impl Drop for RedactingWriter {
    fn drop(&mut self) {
        let _ = self.emit();
    }
}
