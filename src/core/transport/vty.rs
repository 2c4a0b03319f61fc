use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::sync::mpsc::UnboundedSender;

use super::restconf::host_for_url;
use super::ssh::SshLink;
use super::{
    CommandChannel, CommandProtocol, Credentials, PromptReply, TransportError, TransportSettings,
};

const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;
const OPT_ECHO: u8 = 1;
const OPT_SGA: u8 = 3;

const AUTH_FAILURES: &[&str] = &[
    "% authentication failed",
    "% login invalid",
    "% bad secrets",
    "% access denied",
    "% bad passwords",
];

/// Byte stream under a VTY session. The SSH link sits behind a mutex only
/// so the session stays `Sync`; it is always reached through `get_mut`.
enum Link {
    Ssh(Box<Mutex<SshLink>>),
    Telnet {
        stream: TcpStream,
        decoder: TelnetDecoder,
    },
}

impl Link {
    async fn read(&mut self, chunk: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Link::Ssh(link) => link.get_mut().stream.read(chunk).await,
            Link::Telnet { stream, .. } => stream.read(chunk).await,
        }
    }

    async fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        match self {
            Link::Ssh(link) => {
                let stream = &mut link.get_mut().stream;
                stream.write_all(bytes).await?;
                stream.flush().await
            }
            Link::Telnet { stream, .. } => stream.write_all(bytes).await,
        }
    }

    /// Printable text of a received chunk, plus any bytes that must be sent
    /// back (telnet option answers).
    fn decode(&mut self, bytes: &[u8]) -> (String, Vec<u8>) {
        match self {
            Link::Ssh(_) => {
                let text: Vec<u8> = bytes
                    .iter()
                    .copied()
                    .filter(|b| *b != b'\r' && *b != 0)
                    .collect();
                (String::from_utf8_lossy(&text).into_owned(), Vec::new())
            }
            Link::Telnet { decoder, .. } => decoder.decode(bytes),
        }
    }

    async fn shutdown(&mut self) {
        match self {
            Link::Ssh(link) => {
                let link = link.get_mut();
                let _ = link.stream.shutdown().await;
                link.disconnect().await;
            }
            Link::Telnet { stream, .. } => {
                let _ = stream.shutdown().await;
            }
        }
    }
}

/// Interactive VTY session over SSH or telnet.
pub struct VtySession {
    address: String,
    link: Link,
    buffer: String,
    hostname: String,
    closed: bool,
}

impl VtySession {
    pub async fn connect(
        address: &str,
        credentials: &Credentials,
        settings: &TransportSettings,
    ) -> Result<Self, TransportError> {
        let link = match settings.command_protocol {
            CommandProtocol::Ssh => {
                let link = SshLink::open(address, credentials, settings).await?;
                Link::Ssh(Box::new(Mutex::new(link)))
            }
            CommandProtocol::Telnet => {
                let target = format!("{}:{}", host_for_url(address), settings.command_port);
                let started = Instant::now();
                let stream =
                    tokio::time::timeout(settings.connect_timeout, TcpStream::connect(&target))
                        .await
                        .map_err(|_| {
                            TransportError::timeout(address, "connect", started.elapsed())
                        })?
                        .map_err(|e| TransportError::connect(address, e.to_string()))?;
                tracing::warn!("Command channel to {} uses cleartext telnet", address);
                Link::Telnet {
                    stream,
                    decoder: TelnetDecoder::default(),
                }
            }
        };

        let mut session = Self {
            address: address.to_string(),
            link,
            buffer: String::new(),
            hostname: String::new(),
            closed: false,
        };
        session.login(credentials, settings.connect_timeout).await?;
        session
            .exec("terminal length 0", settings.command_timeout)
            .await?;
        tracing::debug!(
            "VTY session to {} over {} ready at prompt {}#",
            address,
            settings.command_protocol.as_str(),
            session.hostname
        );
        Ok(session)
    }

    /// Walk the prompts up to privileged EXEC. Over SSH the device starts
    /// at the EXEC prompt; over telnet it asks for username and password.
    async fn login(
        &mut self,
        credentials: &Credentials,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut sent_username = false;
        let mut sent_password = false;
        let mut enabling = false;

        loop {
            let lowered = self.buffer.to_ascii_lowercase();
            if AUTH_FAILURES.iter().any(|marker| lowered.contains(marker)) {
                return Err(TransportError::Auth {
                    address: self.address.clone(),
                });
            }

            let last = last_line(&self.buffer).to_string();
            let last_lower = last.to_ascii_lowercase();
            if last_lower.ends_with("username:") || last_lower.ends_with("login:") {
                if sent_username {
                    return Err(TransportError::Auth {
                        address: self.address.clone(),
                    });
                }
                sent_username = true;
                self.buffer.clear();
                self.send_line(&credentials.username).await?;
                continue;
            }
            if last_lower.ends_with("password:") {
                let secret = if enabling {
                    credentials
                        .enable_secret
                        .as_deref()
                        .unwrap_or(&credentials.password)
                } else if sent_password {
                    return Err(TransportError::Auth {
                        address: self.address.clone(),
                    });
                } else {
                    sent_password = true;
                    &credentials.password
                };
                let secret = secret.to_string();
                self.buffer.clear();
                self.send_line(&secret).await?;
                continue;
            }
            if let Some(host) = last.strip_suffix('#') {
                self.hostname = host.trim().to_string();
                self.buffer.clear();
                return Ok(());
            }
            if last.ends_with('>') {
                // Still in user mode after enable means the secret was wrong.
                if enabling {
                    return Err(TransportError::Auth {
                        address: self.address.clone(),
                    });
                }
                enabling = true;
                self.buffer.clear();
                self.send_line("enable").await?;
                continue;
            }

            if !self.read_some(deadline, started, "login").await? {
                return Err(TransportError::connect(
                    &self.address,
                    "connection closed during login",
                ));
            }
        }
    }

    async fn send_line(&mut self, line: &str) -> Result<(), TransportError> {
        let payload = format!("{}\r\n", line);
        self.link
            .write_all(payload.as_bytes())
            .await
            .map_err(|e| TransportError::connect(&self.address, e.to_string()))
    }

    /// Read one chunk into the text buffer. `Ok(false)` means the device
    /// closed the connection.
    async fn read_some(
        &mut self,
        deadline: Instant,
        started: Instant,
        operation: &str,
    ) -> Result<bool, TransportError> {
        let mut chunk = [0u8; 4096];
        let remaining = deadline.saturating_duration_since(Instant::now());
        let read = tokio::time::timeout(remaining, self.link.read(&mut chunk)).await;
        let n = match read {
            Err(_) => {
                return Err(TransportError::timeout(
                    &self.address,
                    operation,
                    started.elapsed(),
                ));
            }
            Ok(Err(e)) => return Err(TransportError::connect(&self.address, e.to_string())),
            Ok(Ok(0)) => return Ok(false),
            Ok(Ok(n)) => n,
        };

        let (text, replies) = self.link.decode(&chunk[..n]);
        if !replies.is_empty() {
            self.link
                .write_all(&replies)
                .await
                .map_err(|e| TransportError::connect(&self.address, e.to_string()))?;
        }
        self.buffer.push_str(&text);
        Ok(true)
    }

    fn is_prompt(&self, line: &str) -> bool {
        !self.hostname.is_empty()
            && line.starts_with(&self.hostname)
            && (line.ends_with('#') || line.ends_with('>'))
    }

    async fn run(
        &mut self,
        command: &str,
        replies: &[PromptReply],
        timeout: Duration,
        sink: Option<UnboundedSender<String>>,
        tolerate_close: bool,
    ) -> Result<String, TransportError> {
        if self.closed {
            return Err(TransportError::connect(&self.address, "session closed"));
        }
        self.buffer.clear();
        self.send_line(command).await?;
        let started = Instant::now();
        let deadline = started + timeout;
        let mut output = String::new();

        loop {
            while let Some(pos) = self.buffer.find('\n') {
                let line: String = self.buffer.drain(..=pos).collect();
                let line = line.trim_end_matches('\n');
                if let Some(sink) = &sink
                    && !line.trim().is_empty()
                    && line.trim() != command
                {
                    let _ = sink.send(line.to_string());
                }
                output.push_str(line);
                output.push('\n');
            }

            let partial = self.buffer.trim_end().to_string();
            if self.is_prompt(&partial) {
                self.buffer.clear();
                break;
            }
            if let Some(answer) = replies
                .iter()
                .find(|r| !partial.is_empty() && partial.contains(&r.prompt))
            {
                if let Some(sink) = &sink {
                    let _ = sink.send(partial.clone());
                }
                output.push_str(&partial);
                output.push('\n');
                self.buffer.clear();
                let reply = answer.reply.clone();
                self.send_line(&reply).await?;
                continue;
            }

            match self.read_some(deadline, started, command).await {
                Ok(true) => {}
                Ok(false) if tolerate_close => {
                    tracing::debug!("{} closed the session during `{}`", self.address, command);
                    self.closed = true;
                    output.push_str(&std::mem::take(&mut self.buffer));
                    break;
                }
                Err(TransportError::Connect { .. }) if tolerate_close => {
                    tracing::debug!("{} dropped the session during `{}`", self.address, command);
                    self.closed = true;
                    output.push_str(&std::mem::take(&mut self.buffer));
                    break;
                }
                Ok(false) => {
                    self.closed = true;
                    return Err(TransportError::connect(
                        &self.address,
                        format!("connection closed during `{}`", command),
                    ));
                }
                Err(e) => return Err(e),
            }
        }

        Ok(strip_echo(&output, command))
    }
}

/// Telnet option handling: refuses everything except remote echo and
/// suppress-go-ahead.
#[derive(Default)]
struct TelnetDecoder {
    carry: Vec<u8>,
}

impl TelnetDecoder {
    /// Strip telnet negotiation from `bytes`, returning printable text and
    /// the negotiation answers to send back. Incomplete sequences are kept
    /// for the next chunk.
    fn decode(&mut self, bytes: &[u8]) -> (String, Vec<u8>) {
        let mut data = std::mem::take(&mut self.carry);
        data.extend_from_slice(bytes);

        let mut text = Vec::with_capacity(data.len());
        let mut replies = Vec::new();
        let mut i = 0;
        while i < data.len() {
            let byte = data[i];
            if byte != IAC {
                if byte != b'\r' && byte != 0 {
                    text.push(byte);
                }
                i += 1;
                continue;
            }
            let Some(&command) = data.get(i + 1) else {
                break;
            };
            match command {
                IAC => {
                    text.push(IAC);
                    i += 2;
                }
                DO | DONT | WILL | WONT => {
                    let Some(&option) = data.get(i + 2) else {
                        break;
                    };
                    match command {
                        DO => replies.extend_from_slice(&[IAC, WONT, option]),
                        WILL if option == OPT_ECHO || option == OPT_SGA => {
                            replies.extend_from_slice(&[IAC, DO, option])
                        }
                        WILL => replies.extend_from_slice(&[IAC, DONT, option]),
                        _ => {}
                    }
                    i += 3;
                }
                SB => match data[i + 2..].windows(2).position(|w| w == [IAC, SE]) {
                    Some(offset) => i += 2 + offset + 2,
                    None => break,
                },
                _ => i += 2,
            }
        }
        self.carry = data[i..].to_vec();
        (String::from_utf8_lossy(&text).into_owned(), replies)
    }
}

fn last_line(text: &str) -> &str {
    text.trim_end().rsplit('\n').next().unwrap_or("").trim()
}

/// Drop the echoed command line from the top of `output`.
fn strip_echo(output: &str, command: &str) -> String {
    let mut lines = output.lines().peekable();
    while let Some(first) = lines.peek() {
        if first.trim().is_empty() {
            lines.next();
            continue;
        }
        if first.trim().ends_with(command.trim()) {
            lines.next();
        }
        break;
    }
    lines.collect::<Vec<_>>().join("\n")
}

#[async_trait]
impl CommandChannel for VtySession {
    async fn exec(&mut self, command: &str, timeout: Duration) -> Result<String, TransportError> {
        self.run(command, &[], timeout, None, false).await
    }

    async fn exec_interactive(
        &mut self,
        command: &str,
        replies: &[PromptReply],
        timeout: Duration,
        sink: Option<UnboundedSender<String>>,
    ) -> Result<String, TransportError> {
        self.run(command, replies, timeout, sink, true).await
    }

    async fn configure(
        &mut self,
        lines: &[String],
        timeout: Duration,
    ) -> Result<String, TransportError> {
        let mut transcript = Vec::new();
        self.exec("configure terminal", timeout).await?;
        for line in lines {
            let output = self.exec(line, timeout).await?;
            if !output.trim().is_empty() {
                transcript.push(output);
            }
        }
        self.exec("end", timeout).await?;
        Ok(transcript.join("\n"))
    }

    async fn close(&mut self) {
        if !self.closed {
            let _ = self.send_line("exit").await;
            self.link.shutdown().await;
            self.closed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    fn credentials() -> Credentials {
        Credentials {
            username: "admin".into(),
            password: "secret".into(),
            enable_secret: None,
        }
    }

    #[test]
    fn strip_echo_removes_command_line() {
        let output = "show clock\n*10:00:00.000 UTC Mon Oct 19 2026\n";
        assert_eq!(strip_echo(output, "show clock"), "*10:00:00.000 UTC Mon Oct 19 2026");
        assert_eq!(strip_echo("no echo here\n", "show clock"), "no echo here");
    }

    #[test]
    fn telnet_negotiation_is_answered_and_stripped() {
        let mut telnet = TelnetDecoder::default();
        let (text, replies) = telnet.decode(&[
            IAC, WILL, OPT_ECHO, IAC, DO, 24, b'U', b's', b'e', b'r', b'\r', b'\n', IAC,
        ]);
        assert_eq!(text, "User\n");
        assert_eq!(replies, vec![IAC, DO, OPT_ECHO, IAC, WONT, 24]);

        // The split sequence completes with the next chunk.
        let (text, replies) = telnet.decode(&[SB, 31, 0, 80, IAC, SE, b'>']);
        assert_eq!(text, ">");
        assert!(replies.is_empty());
    }

    #[tokio::test]
    async fn scripted_device_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let device = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            let mut lines = BufReader::new(read).lines();

            write
                .write_all(b"\r\nUser Access Verification\r\n\r\nUsername: ")
                .await
                .unwrap();
            assert_eq!(lines.next_line().await.unwrap().unwrap().trim(), "admin");
            write.write_all(b"Password: ").await.unwrap();
            assert_eq!(lines.next_line().await.unwrap().unwrap().trim(), "secret");
            write.write_all(b"\r\nlab-sw1#").await.unwrap();

            assert_eq!(
                lines.next_line().await.unwrap().unwrap().trim(),
                "terminal length 0"
            );
            write.write_all(b"terminal length 0\r\nlab-sw1#").await.unwrap();

            assert_eq!(lines.next_line().await.unwrap().unwrap().trim(), "show version");
            write
                .write_all(b"show version\r\nCisco IOS XE Software, Version 17.09.04a\r\nlab-sw1#")
                .await
                .unwrap();

            assert_eq!(lines.next_line().await.unwrap().unwrap().trim(), "write memory");
            write
                .write_all(b"write memory\r\nDestination filename [startup-config]? ")
                .await
                .unwrap();
            assert_eq!(lines.next_line().await.unwrap().unwrap().trim(), "");
            write.write_all(b"\r\n[OK]\r\nlab-sw1#").await.unwrap();

            assert!(
                lines
                    .next_line()
                    .await
                    .unwrap()
                    .unwrap()
                    .starts_with("install add")
            );
            write
                .write_all(b"install add file flash:cat9k.bin activate commit\r\nChassis 1 reloading, reason - Reload command\r\n")
                .await
                .unwrap();
        });

        let settings = TransportSettings {
            command_protocol: CommandProtocol::Telnet,
            command_port: port,
            connect_timeout: Duration::from_secs(5),
            ..TransportSettings::default()
        };
        let mut session = VtySession::connect("127.0.0.1", &credentials(), &settings)
            .await
            .unwrap();
        assert_eq!(session.hostname, "lab-sw1");

        let version = session
            .exec("show version", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(version, "Cisco IOS XE Software, Version 17.09.04a");

        let saved = session
            .exec_interactive(
                "write memory",
                &[PromptReply::new("Destination filename", "")],
                Duration::from_secs(5),
                None,
            )
            .await
            .unwrap();
        assert!(saved.contains("[OK]"));

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let install = session
            .exec_interactive(
                "install add file flash:cat9k.bin activate commit",
                &[],
                Duration::from_secs(5),
                Some(tx),
            )
            .await
            .unwrap();
        assert!(install.contains("reloading"));
        assert_eq!(
            rx.recv().await.unwrap(),
            "Chassis 1 reloading, reason - Reload command"
        );

        device.await.unwrap();
    }

    #[tokio::test]
    async fn ssh_is_the_default_and_never_sends_cleartext_credentials() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // A telnet-style device: prompts for a username, records what arrives.
        let device = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let _ = socket.write_all(b"\r\nUsername: ").await;
            let mut received = Vec::new();
            let mut chunk = [0u8; 1024];
            let read = tokio::time::timeout(Duration::from_secs(2), socket.read(&mut chunk)).await;
            if let Ok(Ok(n)) = read {
                received.extend_from_slice(&chunk[..n]);
            }
            String::from_utf8_lossy(&received).into_owned()
        });

        let settings = TransportSettings {
            command_port: port,
            connect_timeout: Duration::from_secs(3),
            ..TransportSettings::default()
        };
        assert_eq!(settings.command_protocol, CommandProtocol::Ssh);
        let result = VtySession::connect("127.0.0.1", &credentials(), &settings).await;
        assert!(result.is_err());

        let received = device.await.unwrap();
        assert!(received.starts_with("SSH-2.0-"), "{:?}", received);
        assert!(!received.contains("admin"));
        assert!(!received.contains("secret"));
    }
}
