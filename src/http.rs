use std::{
    io::{self, BufRead, BufReader, Read, Write},
    net::TcpStream,
    sync::Arc,
};

use anyhow::{Context, Result, anyhow, bail};
use log::{debug, trace};
use rustls::{ClientConfig, ClientConnection, StreamOwned};
use url::{Host, Url};

use crate::{dial::Dialer, tls::TlsSettings};

const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_CHUNK_LINE_BYTES: u64 = 4 * 1024;

pub struct Client<D> {
    dialer: D,
    tls: TlsSettings,
    tls_config: Arc<ClientConfig>,
}

impl<D: Dialer> Client<D> {
    pub fn new(dialer: D, tls: TlsSettings) -> Result<Self> {
        let tls_config = tls.client_config()?;
        Ok(Self {
            dialer,
            tls,
            tls_config,
        })
    }

    /// Sends `request` and reads the response head. The body stays on the
    /// connection until [`Response::read_body`] drains it.
    pub fn execute(&self, request: &Request) -> Result<Response> {
        let mut request_bytes = Vec::new();
        request.write_to(&mut request_bytes)?;

        debug!(">>> {} bytes", request_bytes.len());
        trace!(
            "\n{}",
            prefix_lines(&String::from_utf8_lossy(&request_bytes), ">>> "),
        );

        let addr = request.authority();
        let stream = self
            .dialer
            .dial(&addr)
            .with_context(|| format!("failed to connect to {addr}"))?;

        let mut conn = match request.scheme {
            Scheme::Http => Connection::Plain(stream),
            Scheme::Https => self.handshake(&request.host_name(), stream)?,
        };
        conn.write_all(&request_bytes)
            .context("failed to send request")?;
        conn.flush()?;

        let mut reader = BufReader::new(conn);
        let head = read_head(&mut reader)?;
        let framing = Framing::for_response(head.status_code, &head.headers)?;
        debug!("<<< {} {} ({framing:?})", head.status_code, head.status_message);

        Ok(Response {
            status_code: head.status_code,
            status_message: head.status_message,
            headers: head.headers,
            body: Body::new(reader, framing),
        })
    }

    fn handshake(&self, host: &str, mut stream: TcpStream) -> Result<Connection> {
        let server_name = self.tls.server_name(host)?;
        let mut conn = ClientConnection::new(self.tls_config.clone(), server_name)?;
        while conn.is_handshaking() {
            conn.complete_io(&mut stream)
                .context("TLS handshake failed")?;
        }

        debug!(
            "TLS established: {:?} {:?}",
            conn.protocol_version(),
            conn.negotiated_cipher_suite().map(|suite| suite.suite()),
        );
        Ok(Connection::Tls(Box::new(StreamOwned::new(conn, stream))))
    }
}

enum Connection {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(stream) => stream.read(buf),
            Self::Tls(stream) => stream.read(buf),
        }
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(stream) => stream.write(buf),
            Self::Tls(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(stream) => stream.flush(),
            Self::Tls(stream) => stream.flush(),
        }
    }
}

/// Header fields in the order they were set or received. Names keep their
/// case, lookups ignore it.
#[derive(Clone, Debug, Default)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    /// Sets `key` to `val`, dropping any earlier values.
    pub fn insert(&mut self, key: impl ToString, val: impl ToString) {
        let key = key.to_string();
        self.remove(&key);
        self.0.push((key, val.to_string()));
    }

    pub fn append(&mut self, key: impl ToString, val: impl ToString) {
        self.0.push((key.to_string(), val.to_string()));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(key))
            .map(|(_, value)| value.as_str())
    }

    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> {
        self.0
            .iter()
            .filter(move |(name, _)| name.eq_ignore_ascii_case(key))
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn remove(&mut self, key: &str) {
        self.0.retain(|(name, _)| !name.eq_ignore_ascii_case(key));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    /// Distinct names, first occurrence wins.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for (name, _) in &self.0 {
            if !names.iter().any(|seen| seen.eq_ignore_ascii_case(name)) {
                names.push(name);
            }
        }
        names
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Scheme {
    Http,
    Https,
}

pub struct Request {
    method: String,
    url: Url,
    scheme: Scheme,
    host: Host<String>,
    headers: Headers,
}

impl Request {
    pub fn new(method: &str, url: &str) -> Result<Self> {
        if method.is_empty() || !method.bytes().all(is_token_byte) {
            bail!("Invalid method: {method:?}");
        }

        let url = Url::parse(url).with_context(|| format!("Invalid URL: {url:?}"))?;
        let scheme = match url.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            _ => bail!("Unknown scheme: {}", url.scheme()),
        };
        let host = url
            .host()
            .ok_or_else(|| anyhow!("Given URL does not contain a host"))?
            .to_owned();

        Ok(Self {
            method: method.to_string(),
            url,
            scheme,
            host,
            headers: Default::default(),
        })
    }

    pub fn get(url: &str) -> Result<Self> {
        Self::new("GET", url)
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    fn port(&self) -> u16 {
        self.url.port().unwrap_or(match self.scheme {
            Scheme::Http => 80,
            Scheme::Https => 443,
        })
    }

    /// `host:port` handed to the dialer. The port is always present.
    fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port())
    }

    /// Bare host, as used for the TLS server name.
    fn host_name(&self) -> String {
        match &self.host {
            Host::Domain(domain) => domain.clone(),
            Host::Ipv4(addr) => addr.to_string(),
            Host::Ipv6(addr) => addr.to_string(),
        }
    }

    fn write_to(&self, mut writer: impl Write) -> Result<()> {
        let mut headers = Headers::default();
        headers.insert(
            "Host",
            match self.url.port() {
                Some(port) => format!("{}:{port}", self.host),
                None => self.host.to_string(),
            },
        );
        for name in self.headers.names() {
            headers.remove(name);
            for value in self.headers.get_all(name) {
                headers.append(name, value);
            }
        }
        if !headers.contains("User-Agent") {
            headers.insert(
                "User-Agent",
                format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            );
        }
        if !headers.contains("Accept-Encoding") {
            headers.insert("Accept-Encoding", "identity");
        }
        if !headers.contains("Connection") {
            headers.insert("Connection", "close");
        }

        let mut path = self.url.path().to_string();
        if let Some(query) = self.url.query() {
            path = format!("{path}?{query}");
        }

        write!(writer, "{} {} HTTP/1.1\r\n", self.method, path)?;
        for (key, value) in headers.iter() {
            if value.contains(['\r', '\n']) {
                bail!("Invalid value for header {key}");
            }
            write!(writer, "{key}: {value}\r\n")?;
        }
        writer.write_all(b"\r\n")?;

        Ok(())
    }
}

fn is_token_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&byte)
}

pub struct Response {
    status_code: u16,
    status_message: String,
    headers: Headers,
    body: Body<BufReader<Connection>>,
}

impl Response {
    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    pub fn status_message(&self) -> &str {
        &self.status_message
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Drains the body. The connection is closed when this returns, on
    /// success and on error alike.
    pub fn read_body(self) -> Result<Vec<u8>> {
        let mut reader = self.body;
        let mut body = Vec::new();
        reader
            .read_to_end(&mut body)
            .with_context(|| format!("body stream failed after {} bytes", body.len()))?;
        debug!("<<< {} body bytes", body.len());
        Ok(body)
    }
}

struct Head {
    status_code: u16,
    status_message: String,
    headers: Headers,
}

fn read_head<R: BufRead>(reader: &mut R) -> Result<Head> {
    loop {
        let head = read_single_head(reader)?;
        if (100..200).contains(&head.status_code) && head.status_code != 101 {
            debug!("<<< skipping interim {} response", head.status_code);
            continue;
        }
        return Ok(head);
    }
}

fn read_single_head<R: BufRead>(reader: &mut R) -> Result<Head> {
    let mut total = 0;
    let status_line = read_head_line(reader, &mut total)?
        .ok_or_else(|| anyhow!("Connection closed before a response was received"))?;
    trace!("<<< {status_line}");

    let mut parts = status_line.splitn(3, ' ');
    if !parts.next().is_some_and(|version| version.starts_with("HTTP/")) {
        bail!("Invalid status line: {status_line:?}");
    }
    let status_code: u16 = parts
        .next()
        .ok_or_else(|| anyhow!("Invalid status line: {status_line:?}"))?
        .parse()
        .with_context(|| format!("Invalid status code in {status_line:?}"))?;
    let status_message = parts.next().unwrap_or_default().to_owned();

    let mut headers = Headers::default();
    loop {
        let line = read_head_line(reader, &mut total)?
            .ok_or_else(|| anyhow!("Connection closed inside the response head"))?;
        if line.is_empty() {
            break;
        }
        trace!("<<< {line}");

        let (key, value) = line
            .split_once(':')
            .ok_or_else(|| anyhow!("Invalid header: {line:?}"))?;
        headers.append(key.trim(), value.trim());
    }

    Ok(Head {
        status_code,
        status_message,
        headers,
    })
}

/// Reads one LF-terminated line, dropping the line ending. `None` means the
/// stream ended before the first byte.
fn read_head_line<R: BufRead>(reader: &mut R, total: &mut usize) -> Result<Option<String>> {
    let mut line = Vec::new();
    let limit = (MAX_HEAD_BYTES - *total) as u64;
    let read = reader.by_ref().take(limit).read_until(b'\n', &mut line)?;
    *total += read;

    if !line.ends_with(b"\n") {
        if *total >= MAX_HEAD_BYTES {
            bail!("Response head exceeds {MAX_HEAD_BYTES} bytes");
        }
        if line.is_empty() {
            return Ok(None);
        }
        bail!("Connection closed inside the response head");
    }

    line.pop();
    if line.ends_with(b"\r") {
        line.pop();
    }
    Ok(Some(String::from_utf8_lossy(&line).into_owned()))
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Framing {
    Length(u64),
    Chunked,
    Close,
}

impl Framing {
    fn for_response(status_code: u16, headers: &Headers) -> Result<Self> {
        if status_code == 204 || status_code == 304 {
            return Ok(Self::Length(0));
        }

        let last_coding = headers
            .get_all("Transfer-Encoding")
            .flat_map(|value| value.split(','))
            .map(str::trim)
            .last();
        if let Some(coding) = last_coding {
            return Ok(if coding.eq_ignore_ascii_case("chunked") {
                Self::Chunked
            } else {
                Self::Close
            });
        }

        match headers.get("Content-Length") {
            Some(value) => Ok(Self::Length(
                value
                    .parse()
                    .with_context(|| format!("Invalid Content-Length: {value:?}"))?,
            )),
            None => Ok(Self::Close),
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum BodyState {
    Length(u64),
    ChunkSize,
    Chunk(u64),
    Close,
    Done,
}

/// Response body decoded according to its framing.
struct Body<R> {
    reader: R,
    state: BodyState,
}

impl<R: BufRead> Body<R> {
    fn new(reader: R, framing: Framing) -> Self {
        let state = match framing {
            Framing::Length(0) => BodyState::Done,
            Framing::Length(length) => BodyState::Length(length),
            Framing::Chunked => BodyState::ChunkSize,
            Framing::Close => BodyState::Close,
        };
        Self { reader, state }
    }
}

impl<R: BufRead> Read for Body<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            match self.state {
                BodyState::Done => return Ok(0),
                BodyState::Close => {
                    return match self.reader.read(buf) {
                        Ok(0) => {
                            self.state = BodyState::Done;
                            Ok(0)
                        }
                        // TLS peers often close without close_notify
                        Err(error) if error.kind() == io::ErrorKind::UnexpectedEof => {
                            self.state = BodyState::Done;
                            Ok(0)
                        }
                        other => other,
                    };
                }
                BodyState::Length(remaining) => {
                    let read = read_limited(&mut self.reader, buf, remaining)?;
                    self.state = match remaining - read as u64 {
                        0 => BodyState::Done,
                        left => BodyState::Length(left),
                    };
                    return Ok(read);
                }
                BodyState::ChunkSize => {
                    let size = read_chunk_size(&mut self.reader)?;
                    if size == 0 {
                        skip_trailers(&mut self.reader)?;
                        self.state = BodyState::Done;
                    } else {
                        self.state = BodyState::Chunk(size);
                    }
                }
                BodyState::Chunk(remaining) => {
                    let read = read_limited(&mut self.reader, buf, remaining)?;
                    self.state = match remaining - read as u64 {
                        0 => {
                            expect_crlf(&mut self.reader)?;
                            BodyState::ChunkSize
                        }
                        left => BodyState::Chunk(left),
                    };
                    return Ok(read);
                }
            }
        }
    }
}

fn read_limited<R: Read>(reader: &mut R, buf: &mut [u8], remaining: u64) -> io::Result<usize> {
    let max = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
    let read = reader.read(&mut buf[..max])?;
    if read == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("connection closed with {remaining} body bytes outstanding"),
        ));
    }
    Ok(read)
}

fn read_framing_line<R: BufRead>(reader: &mut R) -> io::Result<String> {
    let mut line = Vec::new();
    reader
        .by_ref()
        .take(MAX_CHUNK_LINE_BYTES)
        .read_until(b'\n', &mut line)?;

    if !line.ends_with(b"\n") {
        if line.len() as u64 >= MAX_CHUNK_LINE_BYTES {
            return Err(invalid_data("chunk framing line too long".to_string()));
        }
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed inside chunk framing",
        ));
    }

    line.pop();
    if line.ends_with(b"\r") {
        line.pop();
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}

fn read_chunk_size<R: BufRead>(reader: &mut R) -> io::Result<u64> {
    let line = read_framing_line(reader)?;
    let digits = line.split(';').next().unwrap_or_default().trim();
    u64::from_str_radix(digits, 16).map_err(|_| invalid_data(format!("Invalid chunk size: {line:?}")))
}

fn expect_crlf<R: BufRead>(reader: &mut R) -> io::Result<()> {
    let line = read_framing_line(reader)?;
    if !line.is_empty() {
        return Err(invalid_data("Missing CRLF after chunk".to_string()));
    }
    Ok(())
}

fn skip_trailers<R: BufRead>(reader: &mut R) -> io::Result<()> {
    while !read_framing_line(reader)?.is_empty() {}
    Ok(())
}

fn invalid_data(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

fn prefix_lines(str: &str, prefix: &str) -> String {
    str.lines()
        .map(|line| format!("{prefix}{line}"))
        .collect::<Vec<String>>()
        .join("\n")
}
