//! Line-oriented scanning of license files and lmstat output.
//!
//! A [`LineScanner`] reads a text stream one logical line at a time. A line
//! ending in a backslash continues onto the next physical line, with the
//! backslash and newline replaced by a single space (FLEXlm license files
//! wrap long FEATURE lines this way). An optional regex filter skips
//! non-matching lines and exposes the capture groups of matching ones.
//!
//! Streams can come from a file, from a shell command, or from a directly
//! spawned program. Spawned children are reaped when the stream is drained.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::ops::Range;
use std::path::Path;
use std::process::{Child, Command, Stdio};

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use tracing::debug;

/// One delivered line plus the capture groups of the filter that matched it.
pub struct ScanLine<'s> {
    text: &'s str,
    captures: &'s [Option<Range<usize>>],
}

impl<'s> ScanLine<'s> {
    /// The full line, with its trailing newline when the source had one.
    pub fn text(&self) -> &'s str {
        self.text
    }

    /// A capture group of the filter regex. Group 0 is the whole match.
    ///
    /// Yields `None` when no filter is set, the group did not participate,
    /// or the index is out of range.
    pub fn capture(&self, index: usize) -> Option<&'s str> {
        self.captures
            .get(index)
            .and_then(|range| range.clone())
            .map(|range| &self.text[range])
    }
}

/// Scanner over a line-oriented text stream.
pub struct LineScanner {
    source: Box<dyn BufRead>,
    child: Option<Child>,
    filter: Option<Regex>,
    line: String,
    captures: Vec<Option<Range<usize>>>,
    line_number: u64,
}

impl LineScanner {
    /// Scan an arbitrary reader.
    pub fn from_reader(reader: impl BufRead + 'static) -> Self {
        Self {
            source: Box::new(reader),
            child: None,
            filter: None,
            line: String::new(),
            captures: Vec::new(),
            line_number: 0,
        }
    }

    /// Scan a file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("failed to open {} for scanning", path.display()))?;
        Ok(Self::from_reader(BufReader::new(file)))
    }

    /// Scan the standard output of a shell command.
    pub fn shell(command: &str) -> Result<Self> {
        debug!(command, "spawning shell command for scanning");
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to run command: {command}"))?;
        Self::from_child(child)
    }

    /// Scan the standard output of a directly spawned program.
    pub fn program(program: &str, args: &[String]) -> Result<Self> {
        debug!(program, "spawning program for scanning");
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to execute {program}"))?;
        Self::from_child(child)
    }

    fn from_child(mut child: Child) -> Result<Self> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("child process stdout was not captured"))?;
        let mut scanner = Self::from_reader(BufReader::new(stdout));
        scanner.child = Some(child);
        Ok(scanner)
    }

    /// Only deliver lines matching `filter`, with capture access.
    pub fn set_filter(&mut self, filter: Regex) {
        self.filter = Some(filter);
        self.captures.clear();
    }

    pub fn clear_filter(&mut self) {
        self.filter = None;
        self.captures.clear();
    }

    /// One-based number of the last physical line read, counting continuation
    /// lines individually.
    pub fn line_number(&self) -> u64 {
        self.line_number
    }

    /// Deliver the next line, skipping any the filter rejects.
    ///
    /// `Ok(None)` marks the end of the stream; a spawned child is reaped at
    /// that point.
    pub fn next_line(&mut self) -> Result<Option<ScanLine<'_>>> {
        loop {
            if !self.fill()? {
                self.reap()?;
                return Ok(None);
            }
            match &self.filter {
                Some(regex) => {
                    if let Some(caps) = regex.captures(&self.line) {
                        self.captures.clear();
                        self.captures
                            .extend(caps.iter().map(|group| group.map(|m| m.range())));
                        break;
                    }
                }
                None => {
                    self.captures.clear();
                    break;
                }
            }
        }
        Ok(Some(ScanLine {
            text: &self.line,
            captures: &self.captures,
        }))
    }

    /// Read one logical line, joining backslash continuations with a space.
    fn fill(&mut self) -> Result<bool> {
        self.line.clear();
        let mut piece = String::new();
        loop {
            piece.clear();
            let read = self
                .source
                .read_line(&mut piece)
                .context("failed to read line from scan source")?;
            if read == 0 {
                return Ok(!self.line.is_empty());
            }
            self.line_number += 1;
            if let Some(continued) = piece.strip_suffix("\\\n") {
                self.line.push_str(continued);
                self.line.push(' ');
                continue;
            }
            self.line.push_str(&piece);
            return Ok(true);
        }
    }

    fn reap(&mut self) -> Result<()> {
        if let Some(mut child) = self.child.take() {
            let status = child.wait().context("failed to wait for scanned child process")?;
            debug!(%status, "scanned child process finished");
        }
        Ok(())
    }
}

impl Drop for LineScanner {
    fn drop(&mut self) {
        // Abandoned mid-stream: don't leave the child around.
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
