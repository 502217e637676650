use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use flowcheck_core::prelude::RunContext;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::ClientError;

/// How long to wait for a readiness signal before assuming a running process is ready.
pub const READY_GRACE: Duration = Duration::from_secs(3);
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);
const CLOSE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CliResponseKind {
    Result,
    Error,
    Status,
    Prompt,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CliResponse {
    #[serde(rename = "type")]
    pub kind: CliResponseKind,
    pub content: String,
}

impl CliResponse {
    fn new(kind: CliResponseKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
        }
    }
}

/// Turns the CLI's tagged output into responses.
///
/// `[RESULT]` may continue over several lines and ends at the next tag, a prompt or a blank line.
/// `[ERROR]`, `[STATUS]` and `[PROMPT]` are single lines.
#[derive(Debug, Default)]
pub struct ResponseParser {
    pending: Option<String>,
    saw_prompt: bool,
}

impl ResponseParser {
    pub fn feed(&mut self, line: &str) -> Vec<CliResponse> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        let mut out = Vec::new();

        if let Some(rest) = line.strip_prefix("[RESULT]") {
            out.extend(self.flush());
            self.pending = Some(rest.trim().to_string());
            return out;
        }

        let single = [
            ("[ERROR]", CliResponseKind::Error),
            ("[STATUS]", CliResponseKind::Status),
            ("[PROMPT]", CliResponseKind::Prompt),
        ];
        for (tag, kind) in single {
            if let Some(rest) = line.strip_prefix(tag) {
                out.extend(self.flush());
                out.push(CliResponse::new(kind, rest.trim()));
                return out;
            }
        }

        if is_prompt_line(line) {
            self.saw_prompt = true;
            out.extend(self.flush());
        } else if let Some(pending) = &mut self.pending {
            pending.push('\n');
            pending.push_str(line);
        } else {
            log::trace!("Untagged CLI output: {line}");
        }

        out
    }

    /// Flush a result still being accumulated, used when the output ends.
    pub fn finish(&mut self) -> Option<CliResponse> {
        self.flush()
    }

    pub fn saw_prompt(&self) -> bool {
        self.saw_prompt
    }

    fn flush(&mut self) -> Option<CliResponse> {
        self.pending
            .take()
            .map(|content| CliResponse::new(CliResponseKind::Result, content))
    }
}

fn is_prompt_line(line: &str) -> bool {
    if line.trim().is_empty() || line.trim() == "Goodbye!" {
        return true;
    }

    let bytes = line.as_bytes();
    bytes.len() % 2 == 0 && bytes.chunks(2).all(|pair| pair == b"> ")
}

#[derive(Debug)]
struct CliProcess {
    child: Child,
    stdin: ChildStdin,
    responses: mpsc::UnboundedReceiver<CliResponse>,
    ready: watch::Receiver<bool>,
    readers: Vec<JoinHandle<()>>,
}

/// Drives the engine's interactive CLI as a long-lived subprocess.
#[derive(Debug)]
pub struct CliClient {
    program: PathBuf,
    args: Vec<String>,
    current_dir: Option<PathBuf>,
    process: Option<CliProcess>,
}

impl CliClient {
    /// The engine binary with quiet logging, optionally pointed at a config file and a repository.
    pub fn semspec(binary: impl Into<PathBuf>, config: Option<&Path>, repo: Option<&Path>) -> Self {
        let mut args = vec![
            "cli".to_string(),
            "--log-level".to_string(),
            "error".to_string(),
        ];
        if let Some(config) = config {
            args.push("--config".to_string());
            args.push(config.display().to_string());
        }
        if let Some(repo) = repo {
            args.push("--repo".to_string());
            args.push(repo.display().to_string());
        }

        Self::command(binary, args)
    }

    /// Any program that speaks the tagged line protocol.
    pub fn command(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            current_dir: None,
            process: None,
        }
    }

    pub fn with_current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn is_running(&mut self) -> bool {
        match &mut self.process {
            Some(process) => matches!(process.child.try_wait(), Ok(None)),
            None => false,
        }
    }

    pub fn start(&mut self) -> Result<(), ClientError> {
        if self.process.is_some() {
            return Err(ClientError::Process("already started".to_string()));
        }

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env("NO_COLOR", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|e| ClientError::io(format!("starting {}", self.program.display()), e))?;
        log::info!("Started CLI {} with pid {:?}", self.program.display(), child.id());

        let missing = |stream: &str| ClientError::Process(format!("no {stream} pipe"));
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let (sender, responses) = mpsc::unbounded_channel();
        let (ready_sender, ready) = watch::channel(false);

        let stdout_reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut parser = ResponseParser::default();

            while let Ok(Some(line)) = lines.next_line().await {
                for response in parser.feed(&line) {
                    if matches!(
                        response.kind,
                        CliResponseKind::Status | CliResponseKind::Prompt
                    ) {
                        ready_sender.send_replace(true);
                    }
                    if sender.send(response).is_err() {
                        return;
                    }
                }
                if parser.saw_prompt() {
                    ready_sender.send_replace(true);
                }
            }

            if let Some(response) = parser.finish() {
                let _ = sender.send(response);
            }
            log::debug!("CLI output closed");
        });

        let stderr_reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                log::debug!("CLI stderr: {line}");
            }
        });

        self.process = Some(CliProcess {
            child,
            stdin,
            responses,
            ready,
            readers: vec![stdout_reader, stderr_reader],
        });
        Ok(())
    }

    /// Wait for a prompt or status line. A process that is still running once [READY_GRACE] has
    /// passed is taken to be ready, since some builds print nothing until spoken to.
    pub async fn wait_for_ready(&mut self, ctx: &RunContext) -> Result<(), ClientError> {
        let process = self.running()?;

        let grace = ctx.with_timeout(READY_GRACE);
        let signalled = grace
            .run(process.ready.wait_for(|ready| *ready))
            .await
            .map(|ready| ready.is_ok());
        if let Some(reason) = ctx.check() {
            return Err(reason.into());
        }

        match signalled {
            Ok(true) => log::debug!("CLI signalled ready"),
            Ok(false) => {
                // Output closed before any readiness signal.
                let status = ctx
                    .run(process.child.wait())
                    .await?
                    .map_err(|e| ClientError::io("waiting for CLI", e))?;
                return Err(ClientError::Process(format!(
                    "exited during startup with {status}"
                )));
            }
            Err(_) => log::debug!("No readiness signal from CLI within {READY_GRACE:?}"),
        }

        match process.child.try_wait() {
            Ok(None) => Ok(()),
            Ok(Some(status)) => Err(ClientError::Process(format!(
                "exited during startup with {status}"
            ))),
            Err(e) => Err(ClientError::io("checking CLI process", e)),
        }
    }

    /// Send one line of input and wait for the next result, error or prompt.
    ///
    /// Anything left over from earlier commands is dropped first, and status lines are skipped.
    pub async fn send_command(
        &mut self,
        ctx: &RunContext,
        line: &str,
    ) -> Result<CliResponse, ClientError> {
        let process = self.running()?;

        while let Ok(stale) = process.responses.try_recv() {
            log::debug!("Dropping stale CLI response: {stale:?}");
        }

        let mut input = line.to_string();
        input.push('\n');
        let stdin = &mut process.stdin;
        ctx.run(async {
            stdin.write_all(input.as_bytes()).await?;
            stdin.flush().await
        })
        .await?
        .map_err(|e| ClientError::io("writing to CLI", e))?;

        let wait = ctx.with_timeout(RESPONSE_TIMEOUT);
        loop {
            match wait.run(process.responses.recv()).await? {
                Some(response) if response.kind == CliResponseKind::Status => {
                    log::debug!("CLI status: {}", response.content);
                }
                Some(response) => return Ok(response),
                None => {
                    return Err(ClientError::Process(format!(
                        "exited before answering {line:?}"
                    )))
                }
            }
        }
    }

    /// Ask the process to quit, killing it if it has not exited within a few seconds.
    pub async fn close(&mut self) -> Result<(), ClientError> {
        let Some(mut process) = self.process.take() else {
            return Ok(());
        };

        match tokio::time::timeout(CLOSE_GRACE, process.stdin.write_all(b"/quit\n")).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::debug!("Could not send /quit to CLI: {e}"),
            Err(_) => log::debug!("CLI is not reading its input, skipping /quit"),
        }
        drop(process.stdin);

        let result = match tokio::time::timeout(CLOSE_GRACE, process.child.wait()).await {
            Ok(Ok(status)) => {
                log::debug!("CLI exited with {status}");
                Ok(())
            }
            Ok(Err(e)) => Err(ClientError::io("waiting for CLI", e)),
            Err(_) => {
                log::warn!("CLI did not exit after /quit, killing it");
                process
                    .child
                    .kill()
                    .await
                    .map_err(|e| ClientError::io("killing CLI", e))
            }
        };

        for reader in process.readers {
            reader.abort();
        }
        result
    }

    fn running(&mut self) -> Result<&mut CliProcess, ClientError> {
        self.process
            .as_mut()
            .ok_or_else(|| ClientError::Process("not started".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(lines: &[&str]) -> Vec<CliResponse> {
        let mut parser = ResponseParser::default();
        let mut out: Vec<_> = lines.iter().flat_map(|line| parser.feed(line)).collect();
        out.extend(parser.finish());
        out
    }

    #[test]
    fn multi_line_result_ends_at_prompt() {
        assert_eq!(
            vec![CliResponse::new(
                CliResponseKind::Result,
                "Plan created\nslug: auth"
            )],
            parse(&["[RESULT] Plan created", "slug: auth", "> ", "ignored"])
        );
    }

    #[test]
    fn single_line_tags_flush_a_pending_result() {
        assert_eq!(
            vec![
                CliResponse::new(CliResponseKind::Result, "first"),
                CliResponse::new(CliResponseKind::Error, "unknown command"),
                CliResponse::new(CliResponseKind::Status, "thinking"),
            ],
            parse(&["[RESULT] first", "[ERROR] unknown command", "[STATUS]   thinking  "])
        );
    }

    #[test]
    fn result_ends_at_blank_line_or_goodbye() {
        assert_eq!(
            vec![
                CliResponse::new(CliResponseKind::Result, "one"),
                CliResponse::new(CliResponseKind::Result, "two"),
            ],
            parse(&["[RESULT] one", "", "[RESULT] two", "Goodbye!"])
        );
    }

    #[test]
    fn output_ending_mid_result_is_flushed() {
        assert_eq!(
            vec![CliResponse::new(CliResponseKind::Result, "partial\nmore")],
            parse(&["[RESULT] partial\r", "more"])
        );
    }

    #[test]
    fn prompt_lines() {
        assert!(is_prompt_line("> "));
        assert!(is_prompt_line("> > "));
        assert!(is_prompt_line("   "));
        assert!(!is_prompt_line("> hello"));
        assert!(!is_prompt_line(">"));
    }

    #[test]
    fn responses_serialize_with_a_type_field() {
        assert_eq!(
            serde_json::json!({"type": "error", "content": "nope"}),
            serde_json::to_value(CliResponse::new(CliResponseKind::Error, "nope")).unwrap()
        );
    }

    #[test]
    fn semspec_arguments() {
        let client = CliClient::semspec(
            "./bin/semspec",
            Some(Path::new("e2e.json")),
            Some(Path::new("/workspace")),
        );

        assert_eq!(
            vec!["cli", "--log-level", "error", "--config", "e2e.json", "--repo", "/workspace"],
            client.args
        );
    }
}
