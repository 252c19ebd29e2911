use super::writer::LogWriter;
use crate::config::ProcessSpec;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const READ_CHUNK: usize = 8 * 1024;
const LINE_QUEUE: usize = 1024;

/// Which child stream a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Where one life's output ends up
#[derive(Debug, Clone)]
pub struct LogTargets {
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    pub merge: bool,
    pub timestamp_format: Option<String>,
}

impl LogTargets {
    pub fn for_spec(spec: &ProcessSpec) -> Self {
        Self {
            stdout_path: spec.stdout_path.clone(),
            stderr_path: spec.stderr_path.clone(),
            merge: spec.merge_logs,
            timestamp_format: spec
                .timestamp_enabled
                .then(|| spec.date_format.clone()),
        }
    }
}

/// Copies a child's output streams to their destination files, line by line
pub struct LogPipe;

impl LogPipe {
    /// Start draining `stdout` and `stderr` into the destinations.
    ///
    /// Each stream is read on its own task; a single writer task appends lines
    /// in the order they were read. The returned handle resolves once both
    /// streams reached end of file and everything was flushed. Write failures
    /// are logged and never stop the readers, so the child cannot block on a
    /// full pipe because of a logging problem.
    pub fn attach<O, E>(targets: LogTargets, stdout: Option<O>, stderr: Option<E>) -> JoinHandle<()>
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(LINE_QUEUE);

        if let Some(stdout) = stdout {
            tokio::spawn(read_lines(stdout, StreamKind::Stdout, tx.clone()));
        }
        if let Some(stderr) = stderr {
            tokio::spawn(read_lines(stderr, StreamKind::Stderr, tx.clone()));
        }
        drop(tx);

        tokio::spawn(write_lines(targets, rx))
    }
}

/// Split a byte stream into lines. A trailing partial line is emitted at EOF.
async fn read_lines<R>(mut reader: R, kind: StreamKind, tx: mpsc::Sender<(StreamKind, Vec<u8>)>)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut pending: Vec<u8> = Vec::new();

    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::warn!("Reading {:?} failed: {}", kind, e);
                break;
            }
        };
        pending.extend_from_slice(&chunk[..n]);

        while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = pending.drain(..=pos).collect();
            line.pop();
            if tx.send((kind, line)).await.is_err() {
                return;
            }
        }
    }

    if !pending.is_empty() {
        let _ = tx.send((kind, pending)).await;
    }
}

async fn write_lines(targets: LogTargets, mut rx: mpsc::Receiver<(StreamKind, Vec<u8>)>) {
    let mut stdout = open_writer(&targets.stdout_path, &targets.timestamp_format).await;
    let mut stderr = if targets.merge {
        None
    } else {
        Some(open_writer(&targets.stderr_path, &targets.timestamp_format).await)
    };

    while let Some((kind, line)) = rx.recv().await {
        let writer = match (kind, stderr.as_mut()) {
            (StreamKind::Stderr, Some(stderr)) => stderr,
            _ => &mut stdout,
        };

        if let Err(e) = writer.write_line(&line).await {
            tracing::warn!("Dropping log line for {}: {}", writer.path().display(), e);
        }
    }

    for writer in std::iter::once(&mut stdout).chain(stderr.as_mut()) {
        if let Err(e) = writer.flush().await {
            tracing::warn!("{}", e);
        }
    }
}

async fn open_writer(path: &std::path::Path, timestamp_format: &Option<String>) -> LogWriter {
    match LogWriter::open(path, timestamp_format.clone()).await {
        Ok(writer) => writer,
        Err(e) => {
            // Keep draining; the writer retries the open on every line
            tracing::warn!("{}", e);
            LogWriter::detached(path, timestamp_format.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;

    fn targets(dir: &TempDir, merge: bool) -> LogTargets {
        LogTargets {
            stdout_path: dir.path().join("out.log"),
            stderr_path: dir.path().join("err.log"),
            merge,
            timestamp_format: None,
        }
    }

    #[tokio::test]
    async fn test_partial_lines_are_joined() {
        let temp_dir = TempDir::new().unwrap();
        let (mut w, r) = tokio::io::duplex(64);

        let handle = LogPipe::attach(targets(&temp_dir, false), Some(r), None::<tokio::io::Empty>);
        w.write_all(b"hel").await.unwrap();
        w.write_all(b"lo\nwor").await.unwrap();
        w.write_all(b"ld\ntail-without-newline").await.unwrap();
        drop(w);
        handle.await.unwrap();

        let out = std::fs::read_to_string(temp_dir.path().join("out.log")).unwrap();
        assert_eq!(out, "hello\nworld\ntail-without-newline\n");
    }

    #[tokio::test]
    async fn test_split_streams() {
        let temp_dir = TempDir::new().unwrap();
        let handle = LogPipe::attach(
            targets(&temp_dir, false),
            Some(&b"a\nb\n"[..]),
            Some(&b"x\n"[..]),
        );
        handle.await.unwrap();

        let out = std::fs::read_to_string(temp_dir.path().join("out.log")).unwrap();
        let err = std::fs::read_to_string(temp_dir.path().join("err.log")).unwrap();
        assert_eq!(out, "a\nb\n");
        assert_eq!(err, "x\n");
    }

    #[tokio::test]
    async fn test_merged_streams() {
        let temp_dir = TempDir::new().unwrap();
        let handle = LogPipe::attach(
            targets(&temp_dir, true),
            Some(&b"a\nb\n"[..]),
            Some(&b"x\n"[..]),
        );
        handle.await.unwrap();

        let out = std::fs::read_to_string(temp_dir.path().join("out.log")).unwrap();
        let mut lines: Vec<&str> = out.lines().collect();
        lines.sort();
        assert_eq!(lines, vec!["a", "b", "x"]);
        assert!(!temp_dir.path().join("err.log").exists());
    }

    #[tokio::test]
    async fn test_timestamp_prefix() {
        let temp_dir = TempDir::new().unwrap();
        let mut t = targets(&temp_dir, false);
        t.timestamp_format = Some("%Y".to_string());

        LogPipe::attach(t, Some(&b"boot\n"[..]), None::<tokio::io::Empty>)
            .await
            .unwrap();

        let out = std::fs::read_to_string(temp_dir.path().join("out.log")).unwrap();
        let (year, rest) = out.split_once(": ").unwrap();
        assert_eq!(year.len(), 4);
        assert_eq!(rest, "boot\n");
    }
}
