//! Child-process links: spawn a peer executable and speak JSON-Lines over
//! its stdio.

use std::str::FromStr;

use futures::future::BoxFuture;
use statewire::{Error, Link, LinkChannels};
use tokio::process::Child;

use crate::Lines;

/// A peer running in a child process.
///
/// The child is spawned when the link starts; stdin/stdout carry the wire
/// messages as JSON lines, stderr is collected for error reporting, and the
/// process is killed when the link is dropped.
///
/// ```
/// # use statewire_tokio::ChildPeer;
/// # use std::str::FromStr;
/// let peer = ChildPeer::from_str("RUST_LOG=debug my-agent --serve").unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct ChildPeer {
    command: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl ChildPeer {
    /// Build from an iterator of command-line words. Leading `NAME=value`
    /// words become environment variables; the first remaining word is the
    /// command.
    pub fn from_args<I, T>(words: I) -> Result<ChildPeer, Error>
    where
        I: IntoIterator<Item = T>,
        T: ToString,
    {
        let words: Vec<String> = words.into_iter().map(|word| word.to_string()).collect();
        let mut env = Vec::new();
        let mut command_idx = 0;
        for (idx, word) in words.iter().enumerate() {
            match parse_env_var(word) {
                Some(pair) => {
                    env.push(pair);
                    command_idx = idx + 1;
                }
                None => break,
            }
        }
        let Some(command) = words.get(command_idx) else {
            return Err(Error::internal_error().with_data("no command given"));
        };
        Ok(ChildPeer {
            command: command.clone(),
            args: words[command_idx + 1..].to_vec(),
            env,
        })
    }

    fn spawn(&self) -> Result<(Child, Lines), Error> {
        let mut cmd = tokio::process::Command::new(&self.command);
        cmd.args(&self.args);
        for (name, value) in &self.env {
            cmd.env(name, value);
        }
        cmd.stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut child = cmd.spawn().map_err(Error::into_internal_error)?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::internal_error().with_data("failed to open stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::internal_error().with_data("failed to open stdout"))?;
        Ok((child, Lines::over(stdin, stdout)))
    }
}

impl FromStr for ChildPeer {
    type Err = Error;

    fn from_str(command_line: &str) -> Result<ChildPeer, Error> {
        let words = shell_words::split(command_line.trim())
            .map_err(|e| Error::internal_error().with_data(format!("bad command line: {e}")))?;
        ChildPeer::from_args(words)
    }
}

/// Kills the child when dropped.
struct ChildGuard(Child);

impl ChildGuard {
    async fn wait(&mut self) -> std::io::Result<std::process::ExitStatus> {
        self.0.wait().await
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        let _ = self.0.start_kill();
    }
}

/// Wait for the child; a non-zero exit becomes an error carrying whatever
/// stderr produced.
async fn monitor_child(
    child: Child,
    stderr_rx: tokio::sync::oneshot::Receiver<String>,
) -> Result<(), Error> {
    let mut guard = ChildGuard(child);
    let status = guard.wait().await.map_err(Error::into_internal_error)?;
    if status.success() {
        return Ok(());
    }
    let stderr = stderr_rx.await.unwrap_or_default();
    let message = if stderr.is_empty() {
        format!("peer process exited with {status}")
    } else {
        format!("peer process exited with {status}: {stderr}")
    };
    Err(Error::internal_error().with_data(message))
}

impl Link for ChildPeer {
    fn run(self: Box<Self>, channels: LinkChannels) -> BoxFuture<'static, Result<(), Error>> {
        Box::pin(async move {
            let (mut child, lines) = self.spawn()?;

            let stderr = child
                .stderr
                .take()
                .ok_or_else(|| Error::internal_error().with_data("failed to open stderr"))?;
            let (stderr_tx, stderr_rx) = tokio::sync::oneshot::channel();
            tokio::spawn(async move {
                use tokio::io::AsyncBufReadExt;
                let mut lines = tokio::io::BufReader::new(stderr).lines();
                let mut collected = String::new();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(peer_stderr = %line);
                    if !collected.is_empty() {
                        collected.push('\n');
                    }
                    collected.push_str(&line);
                }
                let _ = stderr_tx.send(collected);
            });

            let link = Box::new(lines).run(channels);
            let monitor = monitor_child(child, stderr_rx);

            // A failing child preempts the link with its exit diagnostics.
            tokio::select! {
                result = link => result,
                result = monitor => result,
            }
        })
    }
}

fn parse_env_var(word: &str) -> Option<(String, String)> {
    let eq = word.find('=')?;
    if eq == 0 {
        return None;
    }
    let (name, value) = (&word[..eq], &word[eq + 1..]);
    let mut chars = name.chars();
    let first = chars.next()?;
    if !first.is_ascii_alphabetic() && first != '_' {
        return None;
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    Some((name.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_env_prefix_and_command() {
        let peer = ChildPeer::from_str("RUST_LOG=debug node worker.js --port 9000").unwrap();
        assert_eq!(peer.env, vec![("RUST_LOG".into(), "debug".into())]);
        assert_eq!(peer.command, "node");
        assert_eq!(peer.args, vec!["worker.js", "--port", "9000"]);
    }

    #[test]
    fn quoted_arguments_survive() {
        let peer = ChildPeer::from_str(r#"python "my worker.py""#).unwrap();
        assert_eq!(peer.args, vec!["my worker.py"]);
    }

    #[test]
    fn rejects_env_only_command_lines() {
        assert!(ChildPeer::from_str("FOO=bar").is_err());
        assert!(ChildPeer::from_str("").is_err());
    }

    #[test]
    fn equals_in_arguments_is_not_env() {
        let peer = ChildPeer::from_str("worker --mode=fast 2=2").unwrap();
        assert_eq!(peer.command, "worker");
        assert_eq!(peer.args, vec!["--mode=fast", "2=2"]);
        assert!(peer.env.is_empty());
    }
}
