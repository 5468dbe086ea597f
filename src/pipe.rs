//! §5 streaming model: a single-producer/single-consumer in-process byte
//! channel with a closed-with-error mechanism, used to let the generator's
//! archive producer run on its own thread while the consumer reads the tar
//! stream incrementally.

use std::io::{self, Read, Write};
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};

enum Chunk {
    Data(Vec<u8>),
    Err(io::Error),
}

/// Write half of the pipe. Dropping it without calling `close_with_error`
/// signals a clean end-of-stream to the reader.
pub struct PipeWriter {
    tx: SyncSender<Chunk>,
}

impl PipeWriter {
    /// Close the pipe, delivering `err` to the consumer's next read instead
    /// of a clean EOF. Used by the background producer task to propagate
    /// its terminal error.
    pub fn close_with_error(self, err: io::Error) {
        let _ = self.tx.send(Chunk::Err(err));
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .send(Chunk::Data(buf.to_vec()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader dropped"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Read half of the pipe.
pub struct PipeReader {
    rx: Receiver<Chunk>,
    pending: Vec<u8>,
    pending_pos: usize,
    errored: bool,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.errored {
            return Ok(0);
        }
        loop {
            if self.pending_pos < self.pending.len() {
                let n = std::cmp::min(buf.len(), self.pending.len() - self.pending_pos);
                buf[..n]
                    .copy_from_slice(&self.pending[self.pending_pos..self.pending_pos + n]);
                self.pending_pos += n;
                return Ok(n);
            }

            match self.rx.recv() {
                Ok(Chunk::Data(data)) => {
                    self.pending = data;
                    self.pending_pos = 0;
                }
                Ok(Chunk::Err(e)) => {
                    self.errored = true;
                    return Err(e);
                }
                // producer dropped without an explicit error: clean EOF.
                Err(_) => return Ok(0),
            }
        }
    }
}

/// Create a connected pipe pair with a bounded number of in-flight chunks.
pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let (tx, rx) = sync_channel(capacity.max(1));
    (
        PipeWriter { tx },
        PipeReader {
            rx,
            pending: Vec::new(),
            pending_pos: 0,
            errored: false,
        },
    )
}

/// Run `produce` on its own thread, writing into a `PipeWriter`, and return
/// the connected `PipeReader`. If `produce` returns an error, it is
/// delivered to the consumer's next read via `close_with_error`; a panic
/// inside `produce` is converted to an `io::Error` rather than propagated
/// silently as a dropped pipe.
pub fn spawn_producer<F>(produce: F) -> PipeReader
where
    F: FnOnce(&mut PipeWriter) -> io::Result<()> + Send + 'static,
{
    let (mut writer, reader) = pipe(4);
    std::thread::spawn(move || match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| produce(&mut writer))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => writer.close_with_error(e),
        Err(_) => writer.close_with_error(io::Error::other("layer producer panicked")),
    });
    reader
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_all_written_data() {
        let reader = spawn_producer(|w| {
            w.write_all(b"hello ")?;
            w.write_all(b"world")?;
            Ok(())
        });
        let mut out = Vec::new();
        let mut reader = reader;
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello world");
    }

    #[test]
    fn propagates_producer_error() {
        let mut reader = spawn_producer(|w| {
            w.write_all(b"partial")?;
            Err(io::Error::other("boom"))
        });
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).unwrap_err();
        assert_eq!(out, b"partial");
        assert_eq!(err.to_string(), "boom");
    }
}
