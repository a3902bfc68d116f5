//! Terminal operator: styled prompt, streamed replies, coloured errors.
//!
//! `console` disables styling on its own when output is not a terminal.

use std::io::{self, BufRead, Write};

use console::style;
use neura_chat::{ChatError, Operator};

pub struct ConsoleOperator<R = io::StdinLock<'static>, W = io::Stdout> {
    input: R,
    output: W,
    stream: bool,
    streamed_any: bool,
    /// First failed write of a streamed piece, surfaced at the end of the turn.
    write_error: Option<io::Error>,
}

impl ConsoleOperator {
    pub fn new(stream: bool) -> Self {
        Self::with_io(io::stdin().lock(), io::stdout(), stream)
    }
}

impl<R: BufRead, W: Write> ConsoleOperator<R, W> {
    pub fn with_io(input: R, output: W, stream: bool) -> Self {
        Self {
            input,
            output,
            stream,
            streamed_any: false,
            write_error: None,
        }
    }

    pub fn greet(&mut self, exit_command: &str) -> io::Result<()> {
        writeln!(
            self.output,
            "{} {}",
            style("neura").bold().cyan(),
            style(format!("(type '{}' to quit)", exit_command)).dim()
        )
    }

    fn finish_stream(&mut self) -> io::Result<()> {
        if let Some(e) = self.write_error.take() {
            self.streamed_any = false;
            return Err(e);
        }
        if std::mem::take(&mut self.streamed_any) {
            writeln!(self.output)?;
        }
        Ok(())
    }
}

impl<R: BufRead, W: Write> Operator for ConsoleOperator<R, W> {
    fn read_line(&mut self) -> io::Result<Option<String>> {
        write!(self.output, "{} ", style(">").green().bold())?;
        self.output.flush()?;

        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            writeln!(self.output)?;
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
            self.finish_stream()?;
        } else {
            writeln!(self.output, "{}", reply)?;
        }
        self.output.flush()
    }

    fn report(&mut self, error: &ChatError) -> io::Result<()> {
        self.finish_stream()?;
        eprintln!("{} {}", style("error:").red().bold(), error);
        Ok(())
    }
}
