//! Integration test harness: spawn a slircb instance and drive raw IRC
//! lines from both sides (a mock network server and a client).

#![allow(dead_code)]

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

const STARTUP_DEADLINE: Duration = Duration::from_secs(10);
const LINE_DEADLINE: Duration = Duration::from_secs(10);

/// A running bouncer process backed by a throwaway config file.
pub struct Bouncer {
    child: Child,
    config_path: PathBuf,
    _dir: tempfile::TempDir,
    pub port: u16,
}

impl Bouncer {
    /// Spawn the binary with one user `alice` (password `s3cret`) pointed at
    /// `upstream_port` on localhost.
    pub fn spawn(listen_port: u16, upstream_port: u16) -> Bouncer {
        let dir = tempfile::tempdir().expect("tempdir");
        let config_path = dir.path().join("slircb.json");

        let doc = serde_json::json!({
            "attributes": [
                ["listener_address", ["127.0.0.1", listen_port]]
            ],
            "children": {
                "users": {
                    "attributes": [],
                    "children": {
                        "alice": {
                            "attributes": [
                                ["password", "s3cret"],
                                ["nick", "alice"],
                                ["server_address", ["127.0.0.1", upstream_port]]
                            ],
                            "children": {}
                        }
                    }
                }
            }
        });

        std::fs::write(
            &config_path,
            serde_json::to_string_pretty(&doc).expect("config json"),
        )
        .expect("write config");

        let child = Command::new(env!("CARGO_BIN_EXE_slircb"))
            .arg("-c")
            .arg(&config_path)
            .env("RUST_LOG", "debug")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn slircb");

        Bouncer {
            child,
            config_path,
            _dir: dir,
            port: listen_port,
        }
    }

    pub fn config_path(&self) -> &PathBuf {
        &self.config_path
    }
}

impl Drop for Bouncer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// A line-oriented peer, either side of a TCP socket.
pub struct LineConn {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    /// Partial line carried across read timeouts.
    pending: String,
    history: Vec<String>,
}

impl LineConn {
    pub fn from_stream(stream: TcpStream) -> LineConn {
        stream
            .set_read_timeout(Some(Duration::from_millis(200)))
            .expect("read timeout");
        let writer = stream.try_clone().expect("clone stream");
        LineConn {
            reader: BufReader::new(stream),
            writer,
            pending: String::new(),
            history: Vec::new(),
        }
    }

    /// Connect to a port, retrying until the listener is up.
    pub fn connect(port: u16) -> LineConn {
        let deadline = Instant::now() + STARTUP_DEADLINE;
        loop {
            match TcpStream::connect(("127.0.0.1", port)) {
                Ok(stream) => return LineConn::from_stream(stream),
                Err(e) => {
                    if Instant::now() > deadline {
                        panic!("could not connect to 127.0.0.1:{}: {}", port, e);
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        }
    }

    pub fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{}\r\n", line).as_bytes())
            .expect("write line");
        self.writer.flush().expect("flush");
    }

    /// Next line, if one arrives before the per-call timeout. A timeout
    /// mid-line keeps the partial data buffered for the next call.
    pub fn try_recv(&mut self) -> Option<String> {
        match self.reader.read_line(&mut self.pending) {
            Ok(0) => None,
            Ok(_) if self.pending.ends_with('\n') => {
                let line = std::mem::take(&mut self.pending);
                let line = line.trim_end_matches(['\r', '\n']).to_owned();
                self.history.push(line.clone());
                Some(line)
            }
            _ => None,
        }
    }

    /// Read lines until one contains `needle`. Lines read along the way are
    /// consumed, which makes consecutive `expect_line` calls an ordering
    /// assertion.
    pub fn expect_line(&mut self, needle: &str) -> String {
        let deadline = Instant::now() + LINE_DEADLINE;
        loop {
            if let Some(line) = self.try_recv() {
                if line.contains(needle) {
                    return line;
                }
                continue;
            }

            if Instant::now() > deadline {
                panic!(
                    "never saw {:?}; lines so far: {:#?}",
                    needle, self.history
                );
            }
        }
    }

    /// Assert the peer closed the connection (EOF within the deadline).
    pub fn expect_eof(&mut self) {
        let deadline = Instant::now() + LINE_DEADLINE;
        loop {
            match self.reader.read_line(&mut self.pending) {
                Ok(0) => return,
                Ok(_) if self.pending.ends_with('\n') => {
                    let line = std::mem::take(&mut self.pending);
                    self.history
                        .push(line.trim_end_matches(['\r', '\n']).to_owned());
                }
                _ => {}
            }

            if Instant::now() > deadline {
                panic!("peer never closed; lines so far: {:#?}", self.history);
            }
        }
    }
}

/// A mock IRC network: the listener the bouncer's upstream side dials.
pub struct MockServer {
    listener: TcpListener,
}

impl MockServer {
    pub fn bind() -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        MockServer { listener }
    }

    pub fn port(&self) -> u16 {
        self.listener.local_addr().expect("local addr").port()
    }

    /// Wait for the bouncer to connect.
    pub fn accept(&self) -> LineConn {
        self.listener
            .set_nonblocking(true)
            .expect("nonblocking listener");

        let deadline = Instant::now() + STARTUP_DEADLINE;
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(false).expect("blocking stream");
                    return LineConn::from_stream(stream);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() > deadline {
                        panic!("bouncer never connected to the mock server");
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => panic!("accept failed: {}", e),
            }
        }
    }
}
