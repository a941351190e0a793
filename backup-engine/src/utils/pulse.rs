//! Liveness callbacks for long-running writes.
//!
//! A step that streams a large file calls its pulse between chunks so the
//! caller can refresh its task lock. A pulse that returns an error aborts the
//! write.

use std::io::{self, Write};

/// Called between chunks of a long write.
pub type Pulse<'a> = dyn FnMut() -> io::Result<()> + 'a;

/// A pulse for callers with nothing to keep alive.
pub fn quiet() -> impl FnMut() -> io::Result<()> {
    || Ok(())
}

/// Writer that fires a pulse before every write to `inner`.
pub struct PulseWriter<W, P> {
    inner: W,
    pulse: P,
}

impl<W: Write, P: FnMut() -> io::Result<()>> PulseWriter<W, P> {
    pub fn new(inner: W, pulse: P) -> Self {
        Self { inner, pulse }
    }
}

impl<W: Write, P: FnMut() -> io::Result<()>> Write for PulseWriter<W, P> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (self.pulse)()?;
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
