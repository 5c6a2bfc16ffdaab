use anyhow::Result;
use crossterm::{
    style::{self, Colorize, Styler},
    QueueableCommand,
};
use std::{
    io::{stdout, Write},
    time::Instant,
};

use crate::errors::Error;

const INDENT: &str = "  ";

/// Writes nested status lines:
///
/// ```text
/// Creating image...
///   Building base image...DONE! (0, 12.31s)
///   Initializing container...
///     <streamed output>
///   DONE! (0, 1.02m)
/// DONE! (0, 1.25m)
/// ```
pub struct Reporter {
    out: Box<dyn Write>,
    depth: usize,
    verbose: bool,
    styled: bool,
    // A heading was written and is still waiting for its result.
    line_open: bool,
}

impl Reporter {
    pub fn stdout(verbose: bool) -> Reporter {
        Reporter::new(Box::new(stdout()), verbose, true)
    }

    pub fn new(out: Box<dyn Write>, verbose: bool, styled: bool) -> Reporter {
        Reporter {
            out,
            depth: 0,
            verbose,
            styled,
            line_open: false,
        }
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Runs `f` one level deeper than `heading` and finishes the heading
    /// with the result and how long it took. Errors are passed through.
    pub fn nested<T, F>(&mut self, heading: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut Reporter) -> Result<T>,
    {
        self.begin_line()?;
        self.out.queue(style::Print(heading))?.flush()?;
        self.line_open = true;

        let start = Instant::now();
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;

        let (code, ok) = match &result {
            Ok(_) => (0, true),
            Err(err) => (
                err.downcast_ref::<Error>().map(Error::exit_code).unwrap_or(-1),
                false,
            ),
        };

        if self.line_open {
            self.line_open = false;
        } else {
            self.write_indent()?;
        }

        let status = if ok { "DONE!" } else { "FAILED!" };
        let summary = format!(" ({}, {:.2?})\n", code, start.elapsed());

        if self.styled {
            let status = style::style(status).bold();
            let status = if ok { status.green() } else { status.red() };
            self.out.queue(style::PrintStyledContent(status))?;
        } else {
            self.out.queue(style::Print(status))?;
        }
        self.out.queue(style::Print(summary))?.flush()?;

        result
    }

    pub fn write_line(&mut self, line: &str) -> Result<()> {
        self.begin_line()?;
        self.out
            .queue(style::Print(line.trim_end_matches('\n')))?
            .queue(style::Print("\n"))?
            .flush()?;

        Ok(())
    }

    pub fn write_verbose(&mut self, line: &str) -> Result<()> {
        if self.verbose {
            self.write_prefixed("VERBOSE: ", line, Prefix::Verbose)?;
        }

        Ok(())
    }

    pub fn write_info(&mut self, line: &str) -> Result<()> {
        self.write_prefixed("INFO: ", line, Prefix::Info)
    }

    pub fn write_error(&mut self, line: &str) -> Result<()> {
        self.write_prefixed("ERROR: ", line, Prefix::Error)
    }

    fn write_prefixed(&mut self, prefix: &'static str, line: &str, kind: Prefix) -> Result<()> {
        self.begin_line()?;

        if self.styled {
            let prefix = style::style(prefix).bold();
            let prefix = match kind {
                Prefix::Verbose => prefix.dark_grey(),
                Prefix::Info => prefix.cyan(),
                Prefix::Error => prefix.red(),
            };
            self.out.queue(style::PrintStyledContent(prefix))?;
        } else {
            self.out.queue(style::Print(prefix))?;
        }

        self.out
            .queue(style::Print(line.trim_end_matches('\n')))?
            .queue(style::Print("\n"))?
            .flush()?;

        Ok(())
    }

    fn begin_line(&mut self) -> Result<()> {
        if self.line_open {
            self.out.queue(style::Print("\n"))?;
            self.line_open = false;
        }

        self.write_indent()
    }

    fn write_indent(&mut self) -> Result<()> {
        for _ in 0..self.depth {
            self.out.queue(style::Print(INDENT))?;
        }

        Ok(())
    }
}

#[derive(Copy, Clone)]
enum Prefix {
    Verbose,
    Info,
    Error,
}
