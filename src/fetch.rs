use std::{
    io::{self, Write},
    net::{IpAddr, Ipv4Addr},
};

use anyhow::{Context, anyhow};
use log::{debug, warn};
use thiserror::Error;
use url::{ParseError, Url};

use crate::{
    dial::{Dialer, FixedIpDialer},
    http::{Client, Request, Response},
    tls::TlsSettings,
};

/// Name presented as SNI and as the Host header.
pub const DOMAIN: &str = "bubble.freelink.co.jp";
/// Address every connection is made to.
pub const TARGET_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(162, 159, 35, 39));

const MAX_REDIRECTS: usize = 10;

#[derive(Clone, Debug, PartialEq)]
pub struct Endpoint {
    pub domain: String,
    pub ip: IpAddr,
    /// Explicit port for the request URL; 443 applies when unset. The fixed
    /// endpoint never sets it, only loopback test servers do.
    pub port: Option<u16>,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            domain: DOMAIN.to_string(),
            ip: TARGET_IP,
            port: None,
        }
    }
}

impl Endpoint {
    /// The request URL. Its authority is the IP, never the domain.
    pub fn url(&self) -> String {
        let host = match self.ip {
            IpAddr::V4(ip) => ip.to_string(),
            IpAddr::V6(ip) => format!("[{ip}]"),
        };
        match self.port {
            Some(port) => format!("https://{host}:{port}/"),
            None => format!("https://{host}/"),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("创建请求失败: {0:#}")]
    CreateRequest(anyhow::Error),
    #[error("请求失败: {0:#}")]
    Request(anyhow::Error),
    #[error("读取响应失败: {0:#}")]
    ReadResponse(anyhow::Error),
    #[error("写入输出失败: {0}")]
    Output(#[from] io::Error),
}

pub struct Fetcher<D> {
    endpoint: Endpoint,
    client: Client<D>,
}

impl Fetcher<FixedIpDialer> {
    pub fn new(endpoint: Endpoint) -> anyhow::Result<Self> {
        let dialer = FixedIpDialer::new(endpoint.ip);
        Self::with_dialer(endpoint, dialer)
    }
}

impl<D: Dialer> Fetcher<D> {
    pub fn with_dialer(endpoint: Endpoint, dialer: D) -> anyhow::Result<Self> {
        let tls = TlsSettings {
            server_name: Some(endpoint.domain.clone()),
            skip_certificate_verification: true,
        };
        let client = Client::new(dialer, tls)?;
        Ok(Self { endpoint, client })
    }

    fn request(&self) -> anyhow::Result<Request> {
        let mut request = Request::get(&self.endpoint.url())?;
        request.headers_mut().insert("Host", &self.endpoint.domain);
        Ok(request)
    }

    /// Issues the request, following up to ten redirects, and writes status
    /// and headers, then the body, to `out`. Nothing is retried.
    pub fn fetch<W: Write>(&self, out: &mut W) -> Result<(), FetchError> {
        let request = self.request().map_err(FetchError::CreateRequest)?;
        let response = self.follow(request).map_err(FetchError::Request)?;
        debug!(
            "{} answered {} {}",
            self.endpoint.domain,
            response.status_code(),
            response.status_message()
        );

        write_head(out, &response)?;
        let body = response.read_body().map_err(FetchError::ReadResponse)?;
        write_body(out, &body)?;
        Ok(())
    }

    /// Every hop goes through the same dialer and TLS server name. The Host
    /// override survives relative redirects only.
    fn follow(&self, mut request: Request) -> anyhow::Result<Response> {
        let mut redirects = 0;
        loop {
            let response = self.client.execute(&request)?;
            let location = match redirect_location(&response) {
                Some(location) => location.to_string(),
                None => return Ok(response),
            };

            redirects += 1;
            if redirects >= MAX_REDIRECTS {
                return Err(anyhow!("stopped after {MAX_REDIRECTS} redirects"));
            }

            let url = request
                .url()
                .join(&location)
                .with_context(|| format!("Invalid redirect location: {location:?}"))?;
            debug!("{} redirect to {url}", response.status_code());

            request = Request::get(url.as_str())?;
            if matches!(Url::parse(&location), Err(ParseError::RelativeUrlWithoutBase)) {
                request
                    .headers_mut()
                    .insert("Host", &self.endpoint.domain);
            }
        }
    }

    /// Like [`Fetcher::fetch`], with failures reported on `out` too.
    pub fn run<W: Write>(&self, out: &mut W) -> io::Result<()> {
        match self.fetch(out) {
            Ok(()) => Ok(()),
            Err(FetchError::Output(error)) => Err(error),
            Err(error) => {
                warn!("{error}");
                writeln!(out, "{error}")
            }
        }
    }
}

fn redirect_location(response: &Response) -> Option<&str> {
    match response.status_code() {
        301 | 302 | 303 | 307 | 308 => response.headers().get("Location"),
        _ => None,
    }
}

fn write_head(out: &mut impl Write, response: &Response) -> io::Result<()> {
    writeln!(out, "状态码: {}", response.status_code())?;
    writeln!(out)?;
    writeln!(out, "响应头:")?;

    let headers = response.headers();
    for name in headers.names() {
        for value in headers.get_all(name) {
            writeln!(out, "{name}: {value}")?;
        }
    }
    out.flush()
}

fn write_body(out: &mut impl Write, body: &[u8]) -> io::Result<()> {
    writeln!(out)?;
    writeln!(out, "响应内容:")?;
    writeln!(out, "{}", String::from_utf8_lossy(body))
}
