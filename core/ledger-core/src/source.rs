//! Per-host session enumeration.
//!
//! The default source shells out to `quser /server:<host>` and parses its
//! tabular output. Every failure is reported per host as a `FetchError`; the
//! scheduler leaves failed hosts out of the cycle's snapshot.

use encoding_rs::{Encoding, UTF_8};
use serde::Deserialize;
use std::io::{self, Read};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::{SourceConfig, SourceFormat, TrackerConfig};
use crate::error::FetchError;
use crate::logon_time::parse_reported;
use crate::types::Session;

const HOST_PLACEHOLDER: &str = "{host}";
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(20);
const NO_SESSIONS_MARKERS: [&str; 2] = ["no users exist for", "no user exists for"];

pub trait SessionSource: Send + Sync {
    fn fetch(&self, host: &str) -> Result<Vec<Session>, FetchError>;
}

/// Runs an external enumeration command per host.
#[derive(Debug, Clone)]
pub struct CommandSessionSource {
    config: SourceConfig,
    timeout: Duration,
    encoding: &'static Encoding,
}

impl CommandSessionSource {
    pub fn new(config: &TrackerConfig) -> Self {
        Self {
            config: config.source.clone(),
            timeout: config.fetch_timeout(),
            encoding: config.source.output_encoding().unwrap_or(UTF_8),
        }
    }

    fn command_args(&self, host: &str) -> Vec<String> {
        self.config
            .args
            .iter()
            .map(|arg| arg.replace(HOST_PLACEHOLDER, host))
            .collect()
    }

    fn run(&self, host: &str) -> Result<CommandOutput, FetchError> {
        let args = self.command_args(host);
        debug!(host = %host, command = %self.config.command, args = ?args, "Querying host");

        let mut child = Command::new(&self.config.command)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| FetchError::Spawn {
                command: self.config.command.clone(),
                source,
            })?;

        // Drain both pipes concurrently so a chatty child cannot block on a
        // full pipe while we wait for it to exit.
        let limit = self.config.max_output_bytes;
        let stdout = spawn_reader(child.stdout.take(), limit);
        let stderr = spawn_reader(child.stderr.take(), limit);

        // No deadline only when the timeout does not fit in an Instant.
        let deadline = Instant::now().checked_add(self.timeout);
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                let _ = child.kill();
                let _ = child.wait();
                return Err(self.timed_out());
            }
            thread::sleep(WAIT_POLL_INTERVAL);
        };

        // Processes the child left behind can hold the pipes open after it
        // exits, so collecting output is bounded by the same deadline.
        Ok(CommandOutput {
            status,
            stdout: self.collect(&stdout, deadline)?,
            stderr: self.collect(&stderr, deadline)?,
        })
    }

    fn collect(
        &self,
        reader: &PipeReader,
        deadline: Option<Instant>,
    ) -> Result<String, FetchError> {
        let received = match deadline {
            Some(deadline) => reader
                .recv_timeout(deadline.saturating_duration_since(Instant::now()))
                .map_err(|err| match err {
                    RecvTimeoutError::Timeout => self.timed_out(),
                    RecvTimeoutError::Disconnected => reader_lost(),
                })?,
            None => reader.recv().map_err(|_| reader_lost())?,
        };

        let bytes = received?;
        if bytes.len() as u64 > self.config.max_output_bytes {
            return Err(FetchError::OutputTooLarge {
                limit: self.config.max_output_bytes,
            });
        }
        Ok(decode_output(&bytes, self.encoding))
    }

    fn timed_out(&self) -> FetchError {
        FetchError::Timeout {
            secs: self.timeout.as_secs(),
        }
    }
}

impl SessionSource for CommandSessionSource {
    fn fetch(&self, host: &str) -> Result<Vec<Session>, FetchError> {
        let output = self.run(host)?;

        if reports_no_sessions(&output.stdout) || reports_no_sessions(&output.stderr) {
            debug!(host = %host, "Host reports no active users");
            return Ok(Vec::new());
        }

        if !output.status.success() {
            return Err(FetchError::ExitStatus {
                status: output.status.to_string(),
                stderr: output.stderr.trim().to_string(),
            });
        }

        match self.config.format {
            SourceFormat::Table => parse_table(&output.stdout, host, &self.config),
            SourceFormat::Json => parse_json(&output.stdout, host, &self.config),
        }
    }
}

struct CommandOutput {
    status: ExitStatus,
    stdout: String,
    stderr: String,
}

type PipeReader = Receiver<io::Result<Vec<u8>>>;

fn spawn_reader<R: Read + Send + 'static>(pipe: Option<R>, limit: u64) -> PipeReader {
    let (tx, rx) = mpsc::channel();
    match pipe {
        Some(pipe) => {
            thread::spawn(move || {
                let _ = tx.send(read_pipe_bounded(pipe, limit));
            });
        }
        None => {
            let _ = tx.send(Ok(Vec::new()));
        }
    }
    rx
}

/// Reads at most one byte past `limit`, so an oversized stream is detectable
/// and the pipe is closed instead of drained.
fn read_pipe_bounded<R: Read>(pipe: R, limit: u64) -> io::Result<Vec<u8>> {
    let mut buffer = Vec::new();
    pipe.take(limit.saturating_add(1)).read_to_end(&mut buffer)?;
    Ok(buffer)
}

fn reader_lost() -> FetchError {
    FetchError::Io(io::Error::new(
        io::ErrorKind::Other,
        "pipe reader exited without a result",
    ))
}

fn decode_output(bytes: &[u8], encoding: &'static Encoding) -> String {
    let (text, had_errors) = encoding.decode_without_bom_handling(bytes);
    if had_errors {
        debug!(encoding = encoding.name(), "Command output contained undecodable bytes");
    }
    text.into_owned()
}

fn reports_no_sessions(text: &str) -> bool {
    let lowered = text.to_lowercase();
    NO_SESSIONS_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}

/// Parses `quser`-style output.
///
/// Columns are `USERNAME [SESSIONNAME] ID STATE IDLE LOGON-TIME...`. The
/// session name is blank for disconnected sessions, which shifts the id and
/// state one column left. Rows whose id is not numeric are system sessions
/// and are dropped here.
pub fn parse_table(
    output: &str,
    host: &str,
    config: &SourceConfig,
) -> Result<Vec<Session>, FetchError> {
    let time_tokens = config.logon_time_tokens;
    let mut sessions = Vec::new();

    for (index, line) in output.trim().lines().enumerate().skip(1) {
        let line_number = index + 1;
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.is_empty() {
            continue;
        }

        let (session_id, state) = if tokens.len() >= time_tokens + 5 {
            (tokens[2], tokens[3])
        } else if tokens.len() == time_tokens + 4 {
            (tokens[1], tokens[2])
        } else {
            return Err(FetchError::Parse {
                line: line_number,
                details: format!(
                    "expected at least {} columns, found {}",
                    time_tokens + 4,
                    tokens.len()
                ),
            });
        };

        let username = tokens[0].trim_start_matches('>');
        if !session_id.chars().all(|c| c.is_ascii_digit()) {
            debug!(
                host = %host,
                username = %username,
                session_id = %session_id,
                "Ignoring system session"
            );
            continue;
        }

        let raw_logon = tokens[tokens.len() - time_tokens..].join(" ");
        let logon_time = parse_reported(&raw_logon, &config.logon_time_format).ok_or_else(|| {
            FetchError::Parse {
                line: line_number,
                details: format!(
                    "logon time {:?} does not match {:?}",
                    raw_logon, config.logon_time_format
                ),
            }
        })?;

        sessions.push(Session {
            host: host.to_string(),
            session_id: session_id.to_string(),
            username: username.to_string(),
            state: state.to_string(),
            logon_time,
        });
    }

    Ok(sessions)
}

#[derive(Debug, Deserialize)]
struct JsonSession {
    username: String,
    session_id: JsonSessionId,
    #[serde(default)]
    state: String,
    logon_time: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum JsonSessionId {
    Number(u64),
    Text(String),
}

impl JsonSessionId {
    fn into_string(self) -> String {
        match self {
            JsonSessionId::Number(value) => value.to_string(),
            JsonSessionId::Text(value) => value,
        }
    }
}

/// Parses a JSON array of `{username, session_id, state, logon_time}`.
pub fn parse_json(
    output: &str,
    host: &str,
    config: &SourceConfig,
) -> Result<Vec<Session>, FetchError> {
    if output.trim().is_empty() {
        return Ok(Vec::new());
    }

    let raw: Vec<JsonSession> =
        serde_json::from_str(output).map_err(|err| FetchError::Parse {
            line: err.line(),
            details: err.to_string(),
        })?;

    raw.into_iter()
        .enumerate()
        .map(|(index, entry)| {
            let logon_time = parse_reported(&entry.logon_time, &config.logon_time_format)
                .ok_or_else(|| FetchError::Parse {
                    line: index + 1,
                    details: format!(
                        "logon time {:?} does not match {:?}",
                        entry.logon_time, config.logon_time_format
                    ),
                })?;
            Ok(Session {
                host: host.to_string(),
                session_id: entry.session_id.into_string(),
                username: entry.username.trim_start_matches('>').to_string(),
                state: entry.state,
                logon_time,
            })
        })
        .collect()
}
