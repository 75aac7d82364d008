// ABOUTME: Runs wrapped PostgreSQL binaries and streams their output
// ABOUTME: Drains stdout and stderr concurrently with optional line filters and timestamps

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;

use crate::error::CommandError;

const TIMESTAMP_FORMAT: &str = "%Y/%m/%d %H:%M:%S ";

#[derive(Debug, Clone, Default)]
pub struct CommandRunner {
    filters: Vec<String>,
    timestamps: bool,
}

impl CommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prefix every forwarded line with the local time.
    pub fn with_timestamps(mut self, timestamps: bool) -> Self {
        self.timestamps = timestamps;
        self
    }

    /// Drop lines containing `pattern` (literal match).
    pub fn filter(mut self, pattern: impl Into<String>) -> Self {
        self.filters.push(pattern.into());
        self
    }

    /// Runs the command, forwarding its output to the terminal.
    pub async fn run_to_console(&self, command: Command) -> Result<(), CommandError> {
        let mut stdout = tokio::io::stdout();
        let mut stderr = tokio::io::stderr();
        self.run(command, &mut stdout, &mut stderr).await
    }

    pub async fn run<O, E>(
        &self,
        mut command: Command,
        stdout: &mut O,
        stderr: &mut E,
    ) -> Result<(), CommandError>
    where
        O: AsyncWrite + Unpin,
        E: AsyncWrite + Unpin,
    {
        let program = command.as_std().get_program().to_string_lossy().into_owned();
        tracing::debug!("Running {}", program);

        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CommandError::Start {
                program: program.clone(),
                source,
            })?;

        let (child_out, child_err) = match (child.stdout.take(), child.stderr.take()) {
            (Some(out), Some(err)) => (out, err),
            _ => {
                return Err(CommandError::Start {
                    program,
                    source: std::io::Error::other("output pipes were not captured"),
                })
            }
        };

        // Both pipes must be drained together or a chatty child blocks on a full buffer
        let drained = tokio::try_join!(
            self.forward(child_out, stdout),
            self.forward(child_err, stderr)
        );
        if let Err(source) = drained {
            return Err(CommandError::Stream { program, source });
        }

        let status = child.wait().await.map_err(|source| CommandError::Stream {
            program: program.clone(),
            source,
        })?;
        if !status.success() {
            return Err(CommandError::Exit { program, status });
        }
        Ok(())
    }

    async fn forward<R, W>(&self, reader: R, writer: &mut W) -> std::io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();
        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line).await? == 0 {
                break;
            }
            let prefix = self
                .timestamps
                .then(|| chrono::Local::now().format(TIMESTAMP_FORMAT).to_string());
            if let Some(rendered) = render_line(&line, &self.filters, prefix.as_deref()) {
                writer.write_all(&rendered).await?;
            }
        }
        writer.flush().await
    }
}

/// Returns the line as it should be written, or `None` if a filter drops it.
fn render_line(line: &[u8], filters: &[String], prefix: Option<&str>) -> Option<Vec<u8>> {
    let body = line.strip_suffix(b"\n").unwrap_or(line);
    if filters
        .iter()
        .any(|f| contains_bytes(body, f.as_bytes()))
    {
        return None;
    }

    let mut rendered = Vec::with_capacity(body.len() + 24);
    if let Some(prefix) = prefix {
        rendered.extend_from_slice(prefix.as_bytes());
    }
    rendered.extend_from_slice(body);
    rendered.push(b'\n');
    Some(rendered)
}

fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}
