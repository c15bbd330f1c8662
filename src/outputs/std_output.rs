use std::fmt::Display;
use std::io::Stdout;
use std::io::Write;

use crate::errors::BoxError;
use crate::recovery::Epoch;

use super::Sink;

/// Print output to standard out, one line per item.
///
/// Items are written with their [`Display`] impl. If that is not
/// what you want, map the items into a string first.
pub struct StdOutSink<W = Stdout> {
    writer: W,
}

impl StdOutSink {
    pub fn new() -> Self {
        Self {
            writer: std::io::stdout(),
        }
    }
}

impl Default for StdOutSink {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: Write> StdOutSink<W> {
    /// Write lines somewhere other than stdout.
    pub fn with_writer(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<T: Display, W: Write> Sink<T> for StdOutSink<W> {
    fn write(&mut self, _epoch: Epoch, item: T) -> Result<(), BoxError> {
        writeln!(self.writer, "{item}")?;
        Ok(())
    }

    fn epoch_committed(&mut self, _epoch: Epoch) -> Result<(), BoxError> {
        self.writer.flush()?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), BoxError> {
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_lines() {
        let mut sink = StdOutSink::with_writer(Vec::new());
        for item in ["a", "b"] {
            sink.write(Epoch(0), item).unwrap();
        }
        Sink::<&str>::close(&mut sink).unwrap();

        assert_eq!(String::from_utf8(sink.into_inner()).unwrap(), "a\nb\n");
    }
}
