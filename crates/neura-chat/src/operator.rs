//! The session's boundary to whoever is typing.

use std::io::{self, BufRead, Write};

use crate::error::ChatError;

/// Line-oriented operator the session reads turns from and answers to.
pub trait Operator {
    /// Next input line without its line terminator, or `None` at end of input.
    fn read_line(&mut self) -> io::Result<Option<String>>;

    /// Called with each reply piece while it is being generated.
    fn on_piece(&mut self, _piece: &str) {}

    /// A completed reply.
    fn respond(&mut self, reply: &str) -> io::Result<()>;

    /// A turn that failed without ending the session.
    fn report(&mut self, error: &ChatError) -> io::Result<()>;
}

/// Plain operator over any reader and writer.
pub struct LineOperator<R, W> {
    input: R,
    output: W,
    stream: bool,
    streamed_any: bool,
    write_error: Option<io::Error>,
}

impl<R: BufRead, W: Write> LineOperator<R, W> {
    /// Print whole replies once they complete.
    pub fn new(input: R, output: W) -> Self {
        Self {
            input,
            output,
            stream: false,
            streamed_any: false,
            write_error: None,
        }
    }

    /// Print reply pieces as they arrive.
    pub fn streaming(input: R, output: W) -> Self {
        Self {
            stream: true,
            ..Self::new(input, output)
        }
    }

    pub fn into_output(self) -> W {
        self.output
    }

    fn end_stream(&mut self) -> io::Result<()> {
        if let Some(e) = self.write_error.take() {
            return Err(e);
        }
        if std::mem::take(&mut self.streamed_any) {
            writeln!(self.output)?;
        }
        Ok(())
    }
}

impl<R: BufRead, W: Write> Operator for LineOperator<R, W> {
    fn read_line(&mut self) -> io::Result<Option<String>> {
        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        let trimmed = line.trim_end_matches(['\n', '\r']).len();
        line.truncate(trimmed);
        Ok(Some(line))
    }

    fn on_piece(&mut self, piece: &str) {
        if !self.stream || self.write_error.is_some() {
            return;
        }
        self.streamed_any = true;
        if let Err(e) = self
            .output
            .write_all(piece.as_bytes())
            .and_then(|_| self.output.flush())
        {
            self.write_error = Some(e);
        }
    }

    fn respond(&mut self, reply: &str) -> io::Result<()> {
        if self.stream {
            self.end_stream()?;
            if reply.is_empty() {
                writeln!(self.output)?;
            }
        } else {
            writeln!(self.output, "{}", reply)?;
        }
        self.output.flush()
    }

    fn report(&mut self, error: &ChatError) -> io::Result<()> {
        self.end_stream()?;
        writeln!(self.output, "error: {}", error)?;
        self.output.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn output_of<R: BufRead>(op: LineOperator<R, Vec<u8>>) -> String {
        String::from_utf8(op.into_output()).unwrap()
    }

    #[test]
    fn test_read_lines_strip_terminators() {
        let mut op = LineOperator::new(Cursor::new("hello\r\nworld\nlast"), Vec::new());
        assert_eq!(op.read_line().unwrap().as_deref(), Some("hello"));
        assert_eq!(op.read_line().unwrap().as_deref(), Some("world"));
        assert_eq!(op.read_line().unwrap().as_deref(), Some("last"));
        assert_eq!(op.read_line().unwrap(), None);
    }

    #[test]
    fn test_read_blank_line_is_not_eof() {
        let mut op = LineOperator::new(Cursor::new("\n"), Vec::new());
        assert_eq!(op.read_line().unwrap().as_deref(), Some(""));
        assert_eq!(op.read_line().unwrap(), None);
    }

    #[test]
    fn test_non_streaming_respond() {
        let mut op = LineOperator::new(Cursor::new(""), Vec::new());
        op.on_piece("ignored");
        op.respond("hi there").unwrap();
        assert_eq!(output_of(op), "hi there\n");
    }

    #[test]
    fn test_streaming_respond() {
        let mut op = LineOperator::streaming(Cursor::new(""), Vec::new());
        op.on_piece("h");
        op.on_piece("i");
        op.respond("hi").unwrap();
        assert_eq!(output_of(op), "hi\n");
    }

    #[test]
    fn test_streaming_empty_reply_still_ends_line() {
        let mut op = LineOperator::streaming(Cursor::new(""), Vec::new());
        op.respond("").unwrap();
        assert_eq!(output_of(op), "\n");
    }

    #[test]
    fn test_report_after_partial_stream() {
        let mut op = LineOperator::streaming(Cursor::new(""), Vec::new());
        op.on_piece("par");
        op.report(&ChatError::Cancelled).unwrap();
        assert_eq!(output_of(op), "par\nerror: generation cancelled\n");
    }
}
