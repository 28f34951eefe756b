//! Observability side channel for outbound requests.
//!
//! Pass-through diagnostics only; nothing here participates in the
//! request/response contract.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};

use tracing::{debug, warn};

use quarry_fetch_core::model::DebugMode;

/// Mirrors outbound request lines per the configured debug mode.
pub(crate) struct RequestTrace {
    sink: Option<File>,
    verbose: bool,
}

impl RequestTrace {
    pub(crate) const fn disabled() -> Self {
        Self {
            sink: None,
            verbose: false,
        }
    }

    /// Apply a new mode; `Requests` opens the trace file in append mode.
    pub(crate) fn configure(&mut self, mode: &DebugMode) -> io::Result<()> {
        match mode {
            DebugMode::Off => {
                self.sink = None;
                self.verbose = false;
            }
            DebugMode::Verbose => {
                self.sink = None;
                self.verbose = true;
            }
            DebugMode::Requests(path) => {
                self.sink = Some(OpenOptions::new().create(true).append(true).open(path)?);
                self.verbose = true;
            }
        }
        Ok(())
    }

    /// Record one outbound request.
    pub(crate) fn outbound(&mut self, kind: &str, target: &str) {
        if self.verbose {
            debug!(kind, url = target, "outbound request");
        } else {
            debug!(kind, "outbound request");
        }
        if let Some(file) = self.sink.as_mut() {
            if let Err(error) = writeln!(file, "{kind} {target}") {
                warn!(error = %error, "request trace write failed");
            }
        }
    }
}
