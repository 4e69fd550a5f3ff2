//! Runs sandboxed commands, potentially in parallel.
//! Unaware of the operation graph or staleness; just command execution.

use crate::graph::OperationId;
use crate::sandbox::{Invocation, Sandbox, SandboxOutput};
use std::sync::mpsc;
use std::sync::Arc;

pub struct FinishedOperation {
    pub id: OperationId,
    pub output: SandboxOutput,
}

pub struct Runner {
    finished_send: mpsc::Sender<FinishedOperation>,
    finished_recv: mpsc::Receiver<FinishedOperation>,
    running: usize,
    parallelism: usize,
}

impl Runner {
    pub fn new(parallelism: usize) -> Self {
        let (tx, rx) = mpsc::channel();
        Runner {
            finished_send: tx,
            finished_recv: rx,
            running: 0,
            parallelism: parallelism.max(1),
        }
    }

    pub fn can_start_more(&self) -> bool {
        self.running < self.parallelism
    }

    pub fn is_running(&self) -> bool {
        self.running > 0
    }

    /// Run an invocation on a worker thread.  A spawn failure is folded
    /// into the output as a failing exit so the caller has a single
    /// completion path.
    pub fn start(&mut self, id: OperationId, sandbox: Arc<dyn Sandbox>, invocation: Invocation) {
        let tx = self.finished_send.clone();
        std::thread::spawn(move || {
            let output = sandbox.run(&invocation).unwrap_or_else(|err| SandboxOutput {
                exit_code: -1,
                stdout: Vec::new(),
                stderr: err.to_string().into_bytes(),
                observed_read: Vec::new(),
                observed_write: Vec::new(),
            });
            // The send only fails if the receiver disappeared, e.g. due to
            // shutting down after another operation failed.
            let _ = tx.send(FinishedOperation { id, output });
        });
        self.running += 1;
    }

    /// Block until some running operation completes.
    pub fn wait(&mut self) -> FinishedOperation {
        // The unwrap() checks the recv() call; the sender half lives in
        // self, so a running operation always reports back.
        let finished = self.finished_recv.recv().unwrap();
        self.running -= 1;
        finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    struct EchoSandbox;
    impl Sandbox for EchoSandbox {
        fn run(&self, invocation: &Invocation) -> std::io::Result<SandboxOutput> {
            Ok(SandboxOutput {
                exit_code: 0,
                stdout: invocation.arguments.clone().into_bytes(),
                ..SandboxOutput::default()
            })
        }
    }

    fn invocation(arguments: &str) -> Invocation {
        Invocation {
            executable: PathBuf::from("/bin/echo"),
            arguments: arguments.to_string(),
            working_directory: PathBuf::from("/"),
            allowed_read: Vec::new(),
            allowed_write: Vec::new(),
        }
    }

    #[test]
    fn completions_drain_in_any_order() {
        let sandbox: Arc<dyn Sandbox> = Arc::new(EchoSandbox);
        let mut runner = Runner::new(2);
        assert!(runner.can_start_more());
        runner.start(OperationId::from_raw(1), sandbox.clone(), invocation("a"));
        runner.start(OperationId::from_raw(2), sandbox.clone(), invocation("b"));
        assert!(!runner.can_start_more());

        let mut seen = vec![runner.wait().id, runner.wait().id];
        seen.sort();
        assert_eq!(
            seen,
            vec![OperationId::from_raw(1), OperationId::from_raw(2)]
        );
        assert!(!runner.is_running());
    }
}
