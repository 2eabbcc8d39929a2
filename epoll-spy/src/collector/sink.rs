//! Event sinks
//!
//! - [`TextSink`]: one human-readable line per event
//! - [`JsonSink`]: JSON lines, for piping into `jq` or a log shipper

use std::io::Write;

use crate::domain::SinkError;
use crate::event::EpollCtlEvent;

/// Destination for decoded events, injected into the collector.
///
/// `emit` must not block indefinitely; the collector calls it inline
/// from its polling loop.
pub trait EventSink {
    /// Forward one event
    ///
    /// # Errors
    /// Any failure; the collector logs it and moves on to the next event
    fn emit(&mut self, event: &EpollCtlEvent) -> Result<(), SinkError>;

    /// Flush buffered output; called once per poll
    ///
    /// # Errors
    /// Returns an error if buffered output cannot be written
    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

impl<S: EventSink + ?Sized> EventSink for Box<S> {
    fn emit(&mut self, event: &EpollCtlEvent) -> Result<(), SinkError> {
        (**self).emit(event)
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        (**self).flush()
    }
}

pub struct TextSink<W: Write> {
    writer: W,
}

impl<W: Write> TextSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> EventSink for TextSink<W> {
    fn emit(&mut self, event: &EpollCtlEvent) -> Result<(), SinkError> {
        writeln!(self.writer, "{event}")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.writer.flush()?;
        Ok(())
    }
}

pub struct JsonSink<W: Write> {
    writer: W,
}

impl<W: Write> JsonSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> EventSink for JsonSink<W> {
    fn emit(&mut self, event: &EpollCtlEvent) -> Result<(), SinkError> {
        serde_json::to_writer(&mut self.writer, event)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::tests::raw_event;

    fn sample() -> EpollCtlEvent {
        EpollCtlEvent::try_from(raw_event(1, 3)).unwrap()
    }

    #[test]
    fn test_text_sink_one_line_per_event() {
        let mut sink = TextSink::new(Vec::new());
        sink.emit(&sample()).unwrap();
        sink.emit(&sample()).unwrap();

        let out = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[0],
            "(pid: 4242) epoll_ctl(3, EPOLL_CTL_ADD, 7, { events={ EPOLLIN | EPOLLET }, data=99 })"
        );
    }

    #[test]
    fn test_json_sink_writes_json_lines() {
        let mut sink = JsonSink::new(Vec::new());
        sink.emit(&sample()).unwrap();

        let out = String::from_utf8(sink.into_inner()).unwrap();
        assert!(out.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(out.trim_end()).unwrap();
        assert_eq!(value["sequence"], 3);
        assert_eq!(value["fd"], 7);
    }

    #[test]
    fn test_boxed_sink() {
        let mut sink: Box<dyn EventSink> = Box::new(TextSink::new(std::io::sink()));
        assert!(sink.emit(&sample()).is_ok());
        assert!(sink.flush().is_ok());
    }
}
