//! Engine subprocesses
//!
//! Engines redraw progress with carriage returns, so output is split on
//! `\r` as well as `\n` before it reaches the parsers.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::ExecutorError;

/// Stderr lines kept for failure reports
const STDERR_TAIL_LINES: usize = 20;

/// Stdout lines kept for parsers that read the end of the output. Large
/// enough for an indented kopia manifest; progress-only output is dropped
/// from the front.
const STDOUT_TAIL_LINES: usize = 1024;

/// The last `limit` lines of a stream
struct Tail {
    lines: VecDeque<String>,
    limit: usize,
}

impl Tail {
    fn new(limit: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(limit.min(64)),
            limit,
        }
    }

    fn push(&mut self, line: String) {
        if self.lines.len() == self.limit {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// A program, its arguments and extra environment
#[derive(Clone, Debug)]
pub struct EngineCommand {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    current_dir: Option<PathBuf>,
}

impl EngineCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn envs(mut self, env: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    /// Program and arguments for logs. Environment is left out since it
    /// carries credentials.
    pub fn describe(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

#[derive(Clone, Debug, Default)]
pub struct ProcessOutput {
    pub success: bool,
    pub code: Option<i32>,
    /// Last lines written to stdout, joined with `\n`. Every line still
    /// reaches the `stream` callback.
    pub stdout: String,
    /// Last lines written to stderr
    pub stderr_tail: Vec<String>,
}

impl ProcessOutput {
    /// The stderr tail as one line, for reasons and errors
    pub fn stderr_summary(&self) -> String {
        self.stderr_tail.join("; ")
    }

    /// Why a run failed: the stderr tail, or the exit code when stderr was
    /// empty
    pub fn failure_detail(&self) -> String {
        let tail = self.stderr_summary();
        if tail.is_empty() {
            format!("exit code {:?}", self.code)
        } else {
            tail
        }
    }
}

/// Run `cmd` to completion, handing every output line to `on_line` as it
/// arrives
pub async fn stream<F>(cmd: &EngineCommand, mut on_line: F) -> Result<ProcessOutput, ExecutorError>
where
    F: FnMut(Stream, &str),
{
    debug!(command = %cmd.describe(), "starting engine");
    let mut child = cmd.command().spawn().map_err(|e| ExecutorError::Spawn {
        program: cmd.program.clone(),
        source: e,
    })?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump(stdout, Stream::Stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump(stderr, Stream::Stderr, tx.clone()));
    }
    drop(tx);

    let mut stdout = Tail::new(STDOUT_TAIL_LINES);
    let mut stderr = Tail::new(STDERR_TAIL_LINES);
    while let Some((which, line)) = rx.recv().await {
        on_line(which, &line);
        match which {
            Stream::Stdout => stdout.push(line),
            Stream::Stderr => stderr.push(line),
        }
    }

    let status = child.wait().await.map_err(|e| ExecutorError::Spawn {
        program: cmd.program.clone(),
        source: e,
    })?;
    debug!(command = %cmd.program, code = ?status.code(), "engine exited");

    Ok(ProcessOutput {
        success: status.success(),
        code: status.code(),
        stdout: Vec::from(stdout.lines).join("\n"),
        stderr_tail: stderr.lines.into(),
    })
}

/// Run `cmd` to completion and collect its output
pub async fn run(cmd: &EngineCommand) -> Result<ProcessOutput, ExecutorError> {
    stream(cmd, |_, _| {}).await
}

async fn pump<R>(reader: R, which: Stream, tx: mpsc::UnboundedSender<(Stream, String)>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        let chunk = match reader.fill_buf().await {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(stream = ?which, error = %e, "failed to read engine output");
                break;
            }
        };
        if chunk.is_empty() {
            break;
        }
        for &byte in chunk {
            if byte == b'\n' || byte == b'\r' {
                if !line.is_empty() {
                    let _ = tx.send((which, String::from_utf8_lossy(&line).into_owned()));
                    line.clear();
                }
            } else {
                line.push(byte);
            }
        }
        let consumed = chunk.len();
        reader.consume(consumed);
    }
    if !line.is_empty() {
        let _ = tx.send((which, String::from_utf8_lossy(&line).into_owned()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> EngineCommand {
        EngineCommand::new("sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn carriage_returns_split_lines() {
        let mut seen = Vec::new();
        let output = stream(&sh("printf '10%%\\r20%%\\r30%%\\ndone\\n'"), |which, line| {
            seen.push((which, line.to_string()));
        })
        .await
        .unwrap();
        assert!(output.success);
        let lines: Vec<&str> = seen.iter().map(|(_, l)| l.as_str()).collect();
        assert_eq!(lines, vec!["10%", "20%", "30%", "done"]);
        assert_eq!(output.stdout, "10%\n20%\n30%\ndone");
    }

    #[tokio::test]
    async fn failures_keep_the_stderr_tail() {
        let output = run(&sh("echo first >&2; echo second >&2; exit 3"))
            .await
            .unwrap();
        assert!(!output.success);
        assert_eq!(output.code, Some(3));
        assert_eq!(output.stderr_summary(), "first; second");
    }

    #[tokio::test]
    async fn long_output_keeps_only_a_bounded_tail() {
        let lines = STDOUT_TAIL_LINES + 500;
        let mut seen = 0;
        let output = stream(&sh(&format!("seq 1 {}", lines)), |which, _| {
            if which == Stream::Stdout {
                seen += 1;
            }
        })
        .await
        .unwrap();
        assert_eq!(seen, lines);

        let kept: Vec<&str> = output.stdout.lines().collect();
        assert_eq!(kept.len(), STDOUT_TAIL_LINES);
        assert_eq!(kept.first().copied(), Some("501"));
        assert_eq!(kept.last().copied(), Some(lines.to_string().as_str()));
    }

    #[test]
    fn tail_drops_the_oldest_lines() {
        let mut tail = Tail::new(2);
        for line in ["a", "b", "c"] {
            tail.push(line.to_string());
        }
        assert_eq!(Vec::from(tail.lines), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn environment_reaches_the_child() {
        let cmd = sh("echo $KDMP_TEST_VALUE")
            .envs([("KDMP_TEST_VALUE".to_string(), "42".to_string())]);
        let output = run(&cmd).await.unwrap();
        assert_eq!(output.stdout, "42");
    }

    #[tokio::test]
    async fn missing_programs_fail_to_spawn() {
        let err = run(&EngineCommand::new("/nonexistent/kdmp-engine"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Spawn { .. }));
    }

    #[test]
    fn describe_leaves_out_the_environment() {
        let cmd = EngineCommand::new("restic")
            .args(["backup", "--json"])
            .envs([("RESTIC_PASSWORD".to_string(), "secret".to_string())]);
        assert_eq!(cmd.describe(), "restic backup --json");
    }
}
