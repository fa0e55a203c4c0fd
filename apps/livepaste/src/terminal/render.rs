use crate::notify::SessionEvent;
use crate::session::SessionInfo;
use crate::terminal::cli::OutputFormat;
use crate::terminal::error::CliError;
use serde::Serialize;
use std::io::{self, IsTerminal, Stderr, Stdout, Write};

/// Machine-readable share announcement for `--output json`.
#[derive(Debug, Serialize)]
pub struct ShareEnvelope<'a> {
    pub id: &'a str,
    pub link: &'a str,
    pub length: usize,
}

/// Writes the link to `out` and session progress to `log`.
///
/// Consecutive identical status lines are collapsed. The upload meter is
/// rewritten in place when `log` is a terminal and otherwise only appears in
/// the closing summary.
pub struct Renderer<O: Write, E: Write> {
    format: OutputFormat,
    out: O,
    log: E,
    inline_meter: bool,
    meter_visible: bool,
    last_status: Option<String>,
    uploads: u64,
}

impl Renderer<Stdout, Stderr> {
    pub fn stdio(format: OutputFormat) -> Self {
        let inline_meter = format == OutputFormat::Default && io::stderr().is_terminal();
        Self::new(format, io::stdout(), io::stderr(), inline_meter)
    }
}

impl<O: Write, E: Write> Renderer<O, E> {
    pub fn new(format: OutputFormat, out: O, log: E, inline_meter: bool) -> Self {
        Self {
            format,
            out,
            log,
            inline_meter,
            meter_visible: false,
            last_status: None,
            uploads: 0,
        }
    }

    pub fn session_ready(&mut self, info: &SessionInfo) -> Result<(), CliError> {
        match self.format {
            OutputFormat::Json => {
                let envelope = ShareEnvelope {
                    id: &info.id,
                    link: info.link.as_str(),
                    length: info.length,
                };
                let payload = serde_json::to_string(&envelope)
                    .map_err(|err| CliError::Output(err.to_string()))?;
                writeln!(self.out, "{payload}")?;
            }
            OutputFormat::Default => {
                writeln!(self.out, "\n📋 livepaste session ready!\n")?;
                writeln!(self.out, "  id     : {}", info.id)?;
                writeln!(self.out, "  link   : {}", info.link)?;
                writeln!(self.out, "  length : {} bytes", info.length)?;
                writeln!(self.out, "\n  Press Ctrl-C to stop sharing.\n")?;
            }
        }
        self.out.flush()?;
        Ok(())
    }

    pub fn event(&mut self, event: &SessionEvent) -> Result<(), CliError> {
        match event {
            SessionEvent::Status(message) => {
                if self.last_status.as_deref() == Some(message.as_str()) {
                    return Ok(());
                }
                self.break_meter()?;
                writeln!(self.log, "{message}")?;
                self.last_status = Some(message.clone());
            }
            SessionEvent::SuccessCount(count) => {
                self.uploads = *count;
                if self.inline_meter {
                    write!(self.log, "\r⟳ uploads: {count}")?;
                    self.meter_visible = true;
                }
            }
            // The link is part of the banner.
            SessionEvent::Link(_) => {}
            SessionEvent::Ended(reason) => {
                self.break_meter()?;
                writeln!(self.log, "session {reason} ({} uploads)", self.uploads)?;
            }
        }
        self.log.flush()?;
        Ok(())
    }

    fn break_meter(&mut self) -> io::Result<()> {
        if self.meter_visible {
            writeln!(self.log)?;
            self.meter_visible = false;
        }
        Ok(())
    }
}
