//! Event sinks. Every event goes to every configured sink; the terminal
//! sink filters by verbosity, the JSONL sink records everything.

mod jsonl;
mod terminal;

pub use jsonl::JsonlSink;
pub use terminal::TerminalSink;

use crate::error::Result;
use crate::event::TraceEvent;

pub trait OutputSink: Send {
    fn emit(&mut self, event: &TraceEvent) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct OutputManager {
    sinks: Vec<Box<dyn OutputSink>>,
}

impl OutputManager {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    pub fn add_sink(&mut self, sink: Box<dyn OutputSink>) {
        self.sinks.push(sink);
    }

    pub fn emit(&mut self, event: &TraceEvent) -> Result<()> {
        for sink in &mut self.sinks {
            sink.emit(event)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        for sink in &mut self.sinks {
            sink.flush()?;
        }
        Ok(())
    }
}

impl Default for OutputManager {
    fn default() -> Self {
        Self::new()
    }
}
