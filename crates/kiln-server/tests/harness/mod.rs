//! Test harness for kilnd end-to-end tests
//!
//! Starts a real server on a loopback port with its scratch root in a temp
//! dir, writes shell-script compilers, and speaks the wire protocol through
//! kiln-proto's codec.

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use kiln_proto::Message;
use kiln_server::{Server, ServerConfig, ServerHandle};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Copies the first `*.c` argument to the `-o` target, so the object's
/// content proves the dependency was linked into the workspace.
pub const CAT_COMPILER: &str = r#"#!/bin/sh
case "$1" in
  --version) echo "cat-gcc 1.0"; exit 0 ;;
  -dumpmachine) echo "x86_64-linux-gnu"; exit 0 ;;
esac
out=""
src=""
while [ $# -gt 0 ]; do
  case "$1" in
    -o) out="$2"; shift ;;
    *.c) [ -n "$src" ] || src="$1" ;;
  esac
  shift
done
[ -n "$out" ] || out="$(basename "${src%.c}").o"
cat "$src" > "$out" || exit 1
echo "compiled $src"
"#;

/// Never finishes within any test timeout.
pub const SLOW_COMPILER: &str = r#"#!/bin/sh
case "$1" in
  --version) exit 0 ;;
esac
exec sleep 30
"#;

/// Answers `--version`, then deletes itself so the compile step cannot
/// be spawned.
pub const SELF_DELETING_COMPILER: &str = r#"#!/bin/sh
case "$1" in
  --version) rm -f "$0"; exit 0 ;;
esac
exit 0
"#;

pub struct TestServer {
    pub dir: TempDir,
    pub handle: ServerHandle,
}

impl TestServer {
    pub async fn start(limit: usize, timeout: Duration) -> Self {
        let dir = TempDir::new().expect("failed to create temp dir");
        let scratch = Utf8Path::from_path(dir.path())
            .expect("temp dir is not UTF-8")
            .join("scratch");

        let config = ServerConfig::new(limit)
            .with_address("127.0.0.1")
            .with_port(0)
            .with_compilation_timeout(timeout)
            .with_scratch_parent(scratch)
            .with_shuffle_seed(1);

        let server = Server::bind(config).await.expect("failed to bind server");
        Self {
            dir,
            handle: server.spawn(),
        }
    }

    pub fn root(&self) -> &Utf8Path {
        Utf8Path::from_path(self.dir.path()).expect("temp dir is not UTF-8")
    }

    pub fn scratch_parent(&self) -> Utf8PathBuf {
        self.root().join("scratch")
    }

    /// Write an executable compiler script and return its absolute path.
    pub fn compiler(&self, name: &str, script: &str) -> String {
        let bin = self.root().join("bin");
        std::fs::create_dir_all(&bin).expect("failed to create bin dir");
        let path = bin.join(name);
        std::fs::write(&path, script).expect("failed to write compiler");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("failed to chmod compiler");
        path.into_string()
    }

    pub async fn connect(&self) -> Client {
        let stream = TcpStream::connect(self.handle.local_addr())
            .await
            .expect("failed to connect");
        Client {
            stream,
            buffer: Vec::new(),
        }
    }

    /// Wait until the live session count equals `expected`.
    pub async fn wait_for_active(&self, expected: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.handle.active_connections() != expected {
            assert!(
                tokio::time::Instant::now() < deadline,
                "active connections stuck at {}, expected {}",
                self.handle.active_connections(),
                expected
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

pub struct Client {
    pub stream: TcpStream,
    buffer: Vec<u8>,
}

impl Client {
    pub async fn send(&mut self, message: impl Into<Message>) {
        let frame = message.into().to_bytes().expect("failed to encode");
        self.stream
            .write_all(&frame)
            .await
            .expect("failed to send");
    }

    /// Next message, or `None` once the server closed the connection.
    pub async fn recv(&mut self) -> Option<Message> {
        let mut chunk = vec![0u8; 64 * 1024];
        loop {
            if !self.buffer.is_empty() {
                let (needed, message) = Message::from_bytes(&self.buffer).expect("bad frame");
                if let Some(message) = message {
                    let trailing = if needed < 0 {
                        needed.unsigned_abs() as usize
                    } else {
                        0
                    };
                    self.buffer.drain(..self.buffer.len() - trailing);
                    return Some(message);
                }
            }

            let read = tokio::time::timeout(Duration::from_secs(10), self.stream.read(&mut chunk))
                .await
                .expect("timed out waiting for the server")
                .unwrap_or(0);
            if read == 0 {
                assert!(self.buffer.is_empty(), "connection closed mid-message");
                return None;
            }
            self.buffer.extend_from_slice(&chunk[..read]);
        }
    }

    /// Whether the server sends anything within `wait`.
    pub async fn is_quiet_for(&mut self, wait: Duration) -> bool {
        let mut peeked = [0u8; 1];
        tokio::time::timeout(wait, self.stream.peek(&mut peeked))
            .await
            .is_err()
    }
}
