//! Build progress reporting, for the purpose of display to the user.
//!
//! The engine talks to a trait so the console sink can be swapped for a
//! capturing sink in tests; there is no global logger.

/// The log channels the engine writes to.
pub trait Progress {
    /// Engine tracing: evaluation start/end, per-operation staleness checks.
    fn diagnostic(&mut self, msg: &str);

    /// State notices: up to date, missing output, cold start.
    fn info(&mut self, msg: &str);

    /// A stale operation's title, logged as it starts executing.
    fn high_priority(&mut self, msg: &str);

    /// Recoverable trouble, e.g. an unreadable results file, or the stdout
    /// of a failing command.
    fn warning(&mut self, msg: &str);

    /// Captured stderr from a command, and other hard failures.
    fn error(&mut self, msg: &str);
}

/// Line-oriented console sink.  The diagnostic channel is only printed
/// when verbose is set.
pub struct ConsoleProgress {
    verbose: bool,
}

impl ConsoleProgress {
    pub fn new(verbose: bool) -> Self {
        ConsoleProgress { verbose }
    }
}

impl Progress for ConsoleProgress {
    fn diagnostic(&mut self, msg: &str) {
        if self.verbose {
            println!("{}", msg);
        }
    }

    fn info(&mut self, msg: &str) {
        println!("{}", msg);
    }

    fn high_priority(&mut self, msg: &str) {
        println!("{}", msg);
    }

    fn warning(&mut self, msg: &str) {
        eprintln!("warning: {}", msg);
    }

    fn error(&mut self, msg: &str) {
        eprintln!("{}", msg);
    }
}
