use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_serial::SerialPortBuilderExt;

/// Byte stream a MAVLink link runs over.
pub trait LinkStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> LinkStream for T {}

/// `tcp:host:port` or `serial:/dev/ttyX:baud`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Serial { dev: String, baud: u32 },
}

impl Endpoint {
    pub fn is_serial(&self) -> bool {
        matches!(self, Endpoint::Serial { .. })
    }

    pub async fn connect(&self) -> Result<Box<dyn LinkStream>> {
        match self {
            Endpoint::Tcp { host, port } => {
                let s = TcpStream::connect((host.as_str(), *port))
                    .await
                    .with_context(|| format!("connect {}", self))?;
                s.set_nodelay(true).ok();
                Ok(Box::new(s))
            }
            Endpoint::Serial { dev, baud } => {
                let s = tokio_serial::new(dev, *baud)
                    .open_native_async()
                    .with_context(|| format!("open serial device {}", dev))?;
                Ok(Box::new(s))
            }
        }
    }
}

impl FromStr for Endpoint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (kind, rest) = s.split_once(':').context("endpoint must look like tcp:host:port or serial:dev:baud")?;
        let (addr, num) = rest.rsplit_once(':').with_context(|| format!("endpoint {} missing port/baud", s))?;
        if addr.is_empty() {
            bail!("endpoint {} missing host/device", s);
        }
        match kind {
            "tcp" => Ok(Endpoint::Tcp {
                host: addr.to_string(),
                port: num.parse().with_context(|| format!("bad port in {}", s))?,
            }),
            "serial" => Ok(Endpoint::Serial {
                dev: addr.to_string(),
                baud: num.parse().with_context(|| format!("bad baud in {}", s))?,
            }),
            other => bail!("unknown endpoint kind {}", other),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "tcp:{}:{}", host, port),
            Endpoint::Serial { dev, baud } => write!(f, "serial:{}:{}", dev, baud),
        }
    }
}
