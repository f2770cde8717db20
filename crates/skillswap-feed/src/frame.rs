//! STOMP 1.2 frame encoding and decoding
//!
//! Frames are text: a command line, `name:value` header lines, an empty
//! line, the body and a terminating NUL octet. A bare EOL between frames is
//! a heart-beat.

use skillswap_core::{Result, SwapError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Connected,
    Subscribe,
    Unsubscribe,
    Send,
    Message,
    Receipt,
    Error,
    Disconnect,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Connected => "CONNECTED",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Send => "SEND",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
            Command::Disconnect => "DISCONNECT",
        }
    }

    fn parse(raw: &str) -> Result<Self> {
        Ok(match raw {
            "CONNECT" | "STOMP" => Command::Connect,
            "CONNECTED" => Command::Connected,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "SEND" => Command::Send,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            "DISCONNECT" => Command::Disconnect,
            other => {
                return Err(SwapError::Protocol(format!("Unknown command '{}'", other)));
            }
        })
    }

    // CONNECT and CONNECTED headers are sent verbatim for 1.0 compatibility
    fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of `name`; repeated headers keep the earliest entry.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn connect(host: &str, authorization: Option<&str>) -> Self {
        let mut frame = Frame::new(Command::Connect)
            .header("accept-version", "1.2,1.1")
            .header("host", host)
            .header("heart-beat", "0,0");
        if let Some(auth) = authorization {
            frame = frame.header("Authorization", auth);
        }
        frame
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        Frame::new(Command::Subscribe)
            .header("id", id)
            .header("destination", destination)
            .header("ack", "auto")
    }

    pub fn unsubscribe(id: &str) -> Self {
        Frame::new(Command::Unsubscribe).header("id", id)
    }

    pub fn send(destination: &str, body: impl Into<String>) -> Self {
        Frame::new(Command::Send)
            .header("destination", destination)
            .header("content-type", "application/json")
            .body(body)
    }

    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(64 + self.body.len());
        out.push_str(self.command.as_str());
        out.push('\n');

        for (name, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        if !self.body.is_empty() && self.get("content-length").is_none() {
            out.push_str(&format!("content-length:{}\n", self.body.len()));
        }

        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }
}

fn escape_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(raw: &str) -> Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            other => {
                return Err(SwapError::Protocol(format!(
                    "Invalid header escape '\\{}'",
                    other.map(String::from).unwrap_or_default()
                )));
            }
        }
    }
    Ok(out)
}

/// Decode every complete frame contained in one transport payload.
pub fn decode_all(payload: &str) -> Result<Vec<Frame>> {
    let mut frames = Vec::new();
    let mut rest = payload;

    loop {
        rest = rest.trim_start_matches(['\r', '\n']);
        if rest.is_empty() {
            break;
        }
        let (frame, remaining) = decode_one(rest)?;
        frames.push(frame);
        rest = remaining;
    }

    Ok(frames)
}

fn decode_one(input: &str) -> Result<(Frame, &str)> {
    let head_end = input
        .find("\n\n")
        .map(|i| (i, 2))
        .into_iter()
        .chain(input.find("\r\n\r\n").map(|i| (i, 4)))
        .min_by_key(|(i, _)| *i)
        .ok_or_else(|| SwapError::Protocol("Frame is missing the header terminator".into()))?;
    let (head, after_head) = (&input[..head_end.0], &input[head_end.0 + head_end.1..]);

    let mut lines = head.lines();
    let command = Command::parse(lines.next().unwrap_or_default().trim_end_matches('\r'))?;

    let mut headers = Vec::new();
    for line in lines {
        let line = line.trim_end_matches('\r');
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| SwapError::Protocol(format!("Malformed header line '{}'", line)))?;
        if command.escapes_headers() {
            headers.push((unescape_header(name)?, unescape_header(value)?));
        } else {
            headers.push((name.to_string(), value.to_string()));
        }
    }

    let frame_headers = Frame {
        command,
        headers,
        body: String::new(),
    };

    let (body, remaining) = match frame_headers.get("content-length") {
        Some(raw_len) => {
            let len: usize = raw_len
                .trim()
                .parse()
                .map_err(|_| SwapError::Protocol(format!("Invalid content-length '{}'", raw_len)))?;
            if after_head.len() < len || !after_head.is_char_boundary(len) {
                return Err(SwapError::Protocol("Frame body shorter than content-length".into()));
            }
            let (body, tail) = after_head.split_at(len);
            let tail = tail
                .strip_prefix('\0')
                .ok_or_else(|| SwapError::Protocol("Frame body is not NUL-terminated".into()))?;
            (body, tail)
        }
        None => {
            let end = after_head
                .find('\0')
                .ok_or_else(|| SwapError::Protocol("Frame body is not NUL-terminated".into()))?;
            (&after_head[..end], &after_head[end + 1..])
        }
    };

    Ok((frame_headers.body(body), remaining))
}
