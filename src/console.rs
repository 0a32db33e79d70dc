// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The guest's serial console: a live TCP connection to QEMU, or a recorded
//! transcript replayed for tests.

use std::{
    fs::File,
    io::{ErrorKind, Read, Write},
    net::TcpStream,
    time::Duration,
};

use anyhow::Context as _;
use camino::Utf8Path;

/// The result of one read from a console.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsoleRead {
    Data(String),

    /// Nothing arrived within the read's timeout.
    Timeout,

    /// The other end went away.
    Closed,
}

/// A line-oriented conversation with a guest console.
pub trait Console: Send {
    /// Reads whatever output is available, waiting at most `timeout`.
    fn read(&mut self, timeout: Duration) -> std::io::Result<ConsoleRead>;

    /// Types `line` followed by Enter.
    fn send_line(&mut self, line: &str) -> std::io::Result<()>;
}

/// A QEMU serial port exposed as a TCP server. Everything the guest prints is
/// also appended to a log file.
pub struct TcpConsole {
    stream: TcpStream,
    log: Option<File>,
}

impl TcpConsole {
    pub fn connect(
        port: u16,
        log_path: Option<&Utf8Path>,
    ) -> anyhow::Result<Self> {
        let stream =
            TcpStream::connect(("127.0.0.1", port)).with_context(|| {
                format!("connecting to guest console on port {port}")
            })?;
        stream.set_nodelay(true)?;

        let log = match log_path {
            Some(path) => Some(
                File::options()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("opening console log {path}"))?,
            ),
            None => None,
        };

        Ok(Self { stream, log })
    }
}

impl Console for TcpConsole {
    fn read(&mut self, timeout: Duration) -> std::io::Result<ConsoleRead> {
        // A zero timeout means "block forever" to the socket layer.
        self.stream
            .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;

        let mut buf = [0u8; 4096];
        match self.stream.read(&mut buf) {
            Ok(0) => Ok(ConsoleRead::Closed),
            Ok(n) => {
                if let Some(log) = &mut self.log {
                    log.write_all(&buf[..n])?;
                }
                let text = String::from_utf8_lossy(&buf[..n]);
                Ok(ConsoleRead::Data(text.into_owned()))
            }
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut
                ) =>
            {
                Ok(ConsoleRead::Timeout)
            }
            Err(e) if e.kind() == ErrorKind::ConnectionReset => {
                Ok(ConsoleRead::Closed)
            }
            Err(e) => Err(e),
        }
    }

    fn send_line(&mut self, line: &str) -> std::io::Result<()> {
        self.stream.write_all(line.as_bytes())?;
        self.stream.write_all(b"\r")?;
        self.stream.flush()
    }
}

/// Marks a transcript line as the reply the driver is expected to type.
const REPLY_MARKER: &str = "<<<";

/// Matches any reply; used where the reply is a generated secret.
const ANY_REPLY: &str = "*";

#[derive(Clone, Debug)]
struct Exchange {
    output: String,
    reply: Option<String>,
}

/// Replays a recorded console transcript.
///
/// A transcript is the guest's output interleaved with the replies typed in
/// response, each on a line of its own prefixed with `<<< `. A reply of `*`
/// accepts anything. Output after a reply is only produced once that reply
/// has been sent, and a reply that differs from the recorded one is an
/// error. Once the transcript is exhausted the console reports itself
/// closed.
pub struct ReplayConsole {
    exchanges: Vec<Exchange>,
    next: usize,
    output_sent: bool,
    sent: Vec<String>,
}

impl ReplayConsole {
    pub fn from_transcript(transcript: &str) -> Self {
        let mut exchanges = Vec::new();
        let mut output = String::new();
        for line in transcript.lines() {
            match line.strip_prefix(REPLY_MARKER) {
                Some(reply) => exchanges.push(Exchange {
                    output: std::mem::take(&mut output),
                    reply: Some(reply.trim().to_string()),
                }),
                None => {
                    output.push_str(line);
                    output.push('\n');
                }
            }
        }

        if !output.is_empty() {
            exchanges.push(Exchange { output, reply: None });
        }

        Self { exchanges, next: 0, output_sent: false, sent: Vec::new() }
    }

    /// The lines typed so far.
    pub fn sent(&self) -> &[String] {
        &self.sent
    }
}

impl Console for ReplayConsole {
    fn read(&mut self, timeout: Duration) -> std::io::Result<ConsoleRead> {
        let Some(exchange) = self.exchanges.get(self.next) else {
            return Ok(ConsoleRead::Closed);
        };

        if !self.output_sent {
            self.output_sent = true;
            return Ok(ConsoleRead::Data(exchange.output.clone()));
        }

        if exchange.reply.is_none() {
            self.next += 1;
            self.output_sent = false;
            return Ok(ConsoleRead::Closed);
        }

        // Waiting for the driver to type something.
        std::thread::sleep(timeout.min(Duration::from_millis(1)));
        Ok(ConsoleRead::Timeout)
    }

    fn send_line(&mut self, line: &str) -> std::io::Result<()> {
        let expected = self
            .exchanges
            .get(self.next)
            .filter(|_| self.output_sent)
            .and_then(|e| e.reply.as_deref());

        match expected {
            Some(expected) if expected == ANY_REPLY || expected == line => {
                self.sent.push(line.to_string());
                self.next += 1;
                self.output_sent = false;
                Ok(())
            }
            Some(expected) => Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("transcript expected reply {expected:?}"),
            )),
            None => Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "transcript expected no reply here",
            )),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const TRANSCRIPT: &str = "\
boot>
<<< boot
Password for root account? (will not echo)
<<< *
bye
";

    fn read_data(console: &mut ReplayConsole) -> String {
        match console.read(Duration::ZERO).unwrap() {
            ConsoleRead::Data(data) => data,
            other => panic!("expected data, got {other:?}"),
        }
    }

    #[test]
    fn output_waits_for_the_recorded_reply() {
        let mut console = ReplayConsole::from_transcript(TRANSCRIPT);
        assert_eq!(read_data(&mut console), "boot>\n");
        assert_eq!(console.read(Duration::ZERO).unwrap(), ConsoleRead::Timeout);

        assert!(console.send_line("bsd.rd").is_err());
        console.send_line("boot").unwrap();
        assert!(read_data(&mut console).starts_with("Password"));
        console.send_line("hunter2").unwrap();
        assert_eq!(read_data(&mut console), "bye\n");
        assert_eq!(console.read(Duration::ZERO).unwrap(), ConsoleRead::Closed);
        assert_eq!(console.sent(), ["boot", "hunter2"]);
    }
}
