use std::io::Read;
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;

/// Helpers intended for [`std::process::Command`].
pub trait CommandRunExt {
    /// Log (at debug level) the full child commandline.
    fn log_debug(&mut self) -> &mut Self;

    /// Execute the child process, verifying a successful exit code.
    /// On failure, capture stderr into the error message.
    fn run(&mut self) -> Result<()>;

    /// Execute the child process, terminating stdout/stderr as with [`run`],
    /// and return stdout as a `String`.
    fn run_get_string(&mut self) -> Result<String>;

    /// Execute the child process and parse its stdout as JSON.
    fn run_and_parse_json<T: DeserializeOwned>(&mut self) -> Result<T>;
}

/// Render a command suitable for diagnostics.
fn command_to_string(cmd: &Command) -> String {
    let mut r = cmd.get_program().to_string_lossy().into_owned();
    for arg in cmd.get_args() {
        r.push(' ');
        r.push_str(&arg.to_string_lossy());
    }
    r
}

/// Check the exit status, gathering the tail of stderr for the error message.
fn check_status(cmd: &Command, st: std::process::ExitStatus, stderr: &[u8]) -> Result<()> {
    if st.success() {
        return Ok(());
    }
    let cmdline = command_to_string(cmd);
    let stderr = String::from_utf8_lossy(stderr);
    let stderr = stderr.trim();
    if stderr.is_empty() {
        anyhow::bail!("`{cmdline}`: {st}");
    }
    anyhow::bail!("`{cmdline}`: {st}: {stderr}")
}

impl CommandRunExt for Command {
    fn log_debug(&mut self) -> &mut Self {
        tracing::debug!("exec: {}", command_to_string(self));
        self
    }

    fn run(&mut self) -> Result<()> {
        self.stdin(Stdio::null());
        self.stdout(Stdio::null());
        self.stderr(Stdio::piped());
        let mut child = self.spawn().with_context(|| {
            format!("spawning {}", self.get_program().to_string_lossy())
        })?;
        let mut stderr = Vec::new();
        if let Some(mut f) = child.stderr.take() {
            f.read_to_end(&mut stderr)?;
        }
        let st = child.wait()?;
        check_status(self, st, &stderr)
    }

    fn run_get_string(&mut self) -> Result<String> {
        self.stdin(Stdio::null());
        let o = self.output().with_context(|| {
            format!("spawning {}", self.get_program().to_string_lossy())
        })?;
        check_status(self, o.status, &o.stderr)?;
        String::from_utf8(o.stdout).context("decoding command stdout")
    }

    fn run_and_parse_json<T: DeserializeOwned>(&mut self) -> Result<T> {
        let out = self.run_get_string()?;
        serde_json::from_str(&out).context("parsing command output as JSON")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_run_ext() {
        // The basics
        Command::new("true").run().unwrap();
        assert!(Command::new("false").run().is_err());

        // Verify we capture stderr
        let e = Command::new("/bin/sh")
            .args(["-c", "echo expected-this-oops 1>&2; exit 1"])
            .run()
            .err()
            .unwrap();
        similar_asserts::assert_eq!(
            e.to_string(),
            "`/bin/sh -c echo expected-this-oops 1>&2; exit 1`: exit status: 1: expected-this-oops"
        );

        // Ignoring stderr by default for successful command
        Command::new("/bin/sh")
            .args(["-c", "echo foo 1>&2; exit 0"])
            .run()
            .unwrap();
    }

    #[test]
    fn command_run_ext_json() {
        #[derive(serde::Deserialize)]
        struct Foo {
            a: String,
            b: u32,
        }
        let v: Foo = Command::new("echo")
            .arg(r##"{"a": "somevalue", "b": 42}"##)
            .run_and_parse_json()
            .unwrap();
        assert_eq!(v.a, "somevalue");
        assert_eq!(v.b, 42);
    }
}
