//! Sandboxed execution of one external command.
//!
//! The engine only depends on the Sandbox trait: run a command under
//! explicit read/write allow-lists and report the files it actually
//! touched.  The OS-level interposition mechanism that enforces the lists
//! is a separate concern; the in-tree ProcessSandbox runs the command
//! without enforcement and reports empty observed sets.

use std::io::Write;
use std::path::PathBuf;
use std::process::Command;

/// A command plus the file accesses it is allowed to perform.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub executable: PathBuf,
    pub arguments: String,
    pub working_directory: PathBuf,
    pub allowed_read: Vec<PathBuf>,
    pub allowed_write: Vec<PathBuf>,
}

/// What came back from running a command.
#[derive(Debug, Clone, Default)]
pub struct SandboxOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Paths the sandbox recorded the process reading.  Supersets of the
    /// declared inputs are expected and informational.
    pub observed_read: Vec<PathBuf>,
    /// Paths the sandbox recorded the process writing or creating.
    pub observed_write: Vec<PathBuf>,
}

pub trait Sandbox: Send + Sync {
    fn run(&self, invocation: &Invocation) -> std::io::Result<SandboxOutput>;
}

/// Runs commands through the shell with captured output.
pub struct ProcessSandbox;

impl Sandbox for ProcessSandbox {
    fn run(&self, invocation: &Invocation) -> std::io::Result<SandboxOutput> {
        let cmdline = if invocation.arguments.is_empty() {
            invocation.executable.display().to_string()
        } else {
            format!(
                "{} {}",
                invocation.executable.display(),
                invocation.arguments
            )
        };
        let out = Command::new("/bin/sh")
            .arg("-c")
            .arg(&cmdline)
            .current_dir(&invocation.working_directory)
            .output()?;

        let mut stderr = out.stderr;
        let exit_code = match out.status.code() {
            Some(code) => code,
            None => {
                #[cfg(unix)]
                {
                    use std::os::unix::process::ExitStatusExt;
                    match out.status.signal() {
                        Some(libc::SIGINT) => write!(stderr, "interrupted").unwrap(),
                        Some(sig) => write!(stderr, "signal {}", sig).unwrap(),
                        None => {}
                    }
                }
                -1
            }
        };

        Ok(SandboxOutput {
            exit_code,
            stdout: out.stdout,
            stderr,
            observed_read: Vec::new(),
            observed_write: Vec::new(),
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::Path;

    fn invocation(executable: &str, arguments: &str, dir: &Path) -> Invocation {
        Invocation {
            executable: PathBuf::from(executable),
            arguments: arguments.to_string(),
            working_directory: dir.to_owned(),
            allowed_read: Vec::new(),
            allowed_write: Vec::new(),
        }
    }

    #[test]
    fn captures_stdout_and_stderr_separately() {
        let dir = tempfile::tempdir().unwrap();
        let out = ProcessSandbox
            .run(&invocation(
                "/bin/sh",
                "-c 'echo to-out; echo to-err >&2'",
                dir.path(),
            ))
            .unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout, b"to-out\n");
        assert_eq!(out.stderr, b"to-err\n");
    }

    #[test]
    fn reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let out = ProcessSandbox
            .run(&invocation("/bin/sh", "-c 'exit 3'", dir.path()))
            .unwrap();
        assert_eq!(out.exit_code, 3);
    }

    #[test]
    fn runs_in_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let out = ProcessSandbox
            .run(&invocation("touch", "made-here", dir.path()))
            .unwrap();
        assert_eq!(out.exit_code, 0);
        assert!(dir.path().join("made-here").exists());
    }
}
