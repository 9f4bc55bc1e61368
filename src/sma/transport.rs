use crate::prelude::*;

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::thread;

use net2::TcpStreamExt;
use serialport::SerialPort;

use crate::config::Endpoint;

/// RFCOMM ignores the line rate, but the tty still wants one.
const BAUD_RATE: u32 = 115_200;
const TCP_KEEPALIVE_SECS: u64 = 60;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Byte stream the link reader pulls frames from.
pub trait Transport {
    /// Reads whatever arrives within `timeout`. A quiet link fails with
    /// `TimedOut` or `WouldBlock`; `Ok(0)` means the peer has gone.
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        (**self).read_timeout(buf, timeout)
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        (**self).write_all(data)
    }
}

pub fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
}

// Link {{{
enum Port {
    Serial(Box<dyn SerialPort>),
    Tcp(TcpStream),
}

/// A connection to the inverter: an RFCOMM tty (`/dev/rfcomm0`) or a TCP
/// serial bridge.
pub struct Link {
    name: String,
    port: Port,
    timeout: Option<Duration>,
}

impl Link {
    /// Connects to `endpoint`, making up to `attempts` tries one second apart.
    pub fn open(endpoint: &Endpoint, attempts: u32, timeout: Duration) -> Result<Self> {
        let attempts = attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            let result = match endpoint {
                Endpoint::Device(path) => Self::open_device(path, timeout),
                Endpoint::Tcp { host, port } => Self::connect_tcp(host, *port, timeout),
            };

            match result {
                Ok(link) => {
                    info!("connected to {} (attempt {}/{})", link.name, attempt, attempts);
                    return Ok(link);
                }
                Err(err) => {
                    warn!("connecting to {} failed (attempt {}/{}): {}", endpoint, attempt, attempts, err);
                    last_error = Some(err);
                    if attempt < attempts {
                        thread::sleep(CONNECT_RETRY_DELAY);
                    }
                }
            }
        }

        match last_error {
            Some(err) => Err(anyhow!(
                "transport.rs:could not connect to {} after {} attempts: {}",
                endpoint,
                attempts,
                err
            )),
            None => bail!("could not connect to {}", endpoint),
        }
    }

    pub fn open_device(path: &str, timeout: Duration) -> io::Result<Self> {
        let port = serialport::new(path, BAUD_RATE).timeout(timeout).open()?;

        Ok(Self {
            name: path.to_owned(),
            port: Port::Serial(port),
            timeout: Some(timeout),
        })
    }

    pub fn connect_tcp(host: &str, port: u16, timeout: Duration) -> io::Result<Self> {
        let addr = (host, port).to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("{} did not resolve", host))
        })?;

        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        if let Err(e) = stream.set_keepalive(Some(Duration::from_secs(TCP_KEEPALIVE_SECS))) {
            warn!("Failed to set TCP keepalive: {}", e);
        }
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }

        Ok(Self {
            name: format!("{}:{}", host, port),
            port: Port::Tcp(stream),
            timeout: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        // a zero read timeout is rejected by TcpStream
        let timeout = timeout.max(Duration::from_millis(1));
        if self.timeout == Some(timeout) {
            return Ok(());
        }

        match &mut self.port {
            Port::Serial(port) => port.set_timeout(timeout)?,
            Port::Tcp(stream) => stream.set_read_timeout(Some(timeout))?,
        }
        self.timeout = Some(timeout);
        Ok(())
    }
}

impl Transport for Link {
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        self.set_timeout(timeout)?;

        loop {
            let result = match &mut self.port {
                Port::Serial(port) => port.read(buf),
                Port::Tcp(stream) => stream.read(buf),
            };
            match result {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match &mut self.port {
            Port::Serial(port) => {
                Write::write_all(port, data)?;
                port.flush()
            }
            Port::Tcp(stream) => {
                Write::write_all(stream, data)?;
                stream.flush()
            }
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        if let Port::Tcp(stream) = &self.port {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
} // }}}

// ReplayTransport {{{
#[derive(Debug)]
enum Incoming {
    Bytes(Vec<u8>),
    Silence,
}

/// In-memory transport that plays back queued input and records every write.
/// Used to replay captured traffic against a script.
#[derive(Debug, Default)]
pub struct ReplayTransport {
    queue: VecDeque<Incoming>,
    pending: VecDeque<u8>,
    sent: Vec<Vec<u8>>,
}

impl ReplayTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues bytes that become readable once earlier input is consumed.
    pub fn push(&mut self, bytes: impl Into<Vec<u8>>) -> &mut Self {
        self.queue.push_back(Incoming::Bytes(bytes.into()));
        self
    }

    /// Queues one read that times out.
    pub fn push_silence(&mut self) -> &mut Self {
        self.queue.push_back(Incoming::Silence);
        self
    }

    pub fn sent(&self) -> &[Vec<u8>] {
        &self.sent
    }

    /// True once every queued chunk has been consumed.
    pub fn is_drained(&self) -> bool {
        self.pending.is_empty() && self.queue.iter().all(|i| matches!(i, Incoming::Silence))
    }
}

impl Transport for ReplayTransport {
    fn read_timeout(&mut self, buf: &mut [u8], _timeout: Duration) -> io::Result<usize> {
        if self.pending.is_empty() {
            if let Some(Incoming::Bytes(bytes)) = self.queue.pop_front() {
                self.pending.extend(bytes);
            }
        }
        if self.pending.is_empty() {
            return Err(io::ErrorKind::TimedOut.into());
        }

        let n = buf.len().min(self.pending.len());
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.sent.push(data.to_vec());
        Ok(())
    }
} // }}}
