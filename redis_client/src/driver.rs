//! Low-level connection handling: TCP or UNIX socket, command write, reply
//! read. One `Driver` owns one physical connection to the broker.
use std::io::{BufReader, Read, Write};
use std::net::TcpStream;
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::time::Duration;

use crate::error::{BrokerError, BrokerErrorKind};
use crate::resp::{RespValue, read_value, write_command};

/// Either half of the connection the broker adapter might use. UNIX sockets
/// are only compiled in on platforms that have them.
pub enum Connection {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Connection {
    pub fn try_clone(&self) -> std::io::Result<Connection> {
        match self {
            Connection::Tcp(s) => Ok(Connection::Tcp(s.try_clone()?)),
            #[cfg(unix)]
            Connection::Unix(s) => Ok(Connection::Unix(s.try_clone()?)),
        }
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        match self {
            Connection::Tcp(s) => s.set_read_timeout(timeout),
            #[cfg(unix)]
            Connection::Unix(s) => s.set_read_timeout(timeout),
        }
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Connection::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            Connection::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Connection::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            Connection::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Connection::Tcp(s) => s.flush(),
            #[cfg(unix)]
            Connection::Unix(s) => s.flush(),
        }
    }
}

/// Owns a connection and issues RESP commands over it, reading back exactly
/// one reply per command.
pub struct Driver {
    writer: Connection,
    reader: BufReader<Connection>,
}

impl Driver {
    pub fn connect_tcp(host: &str, port: u16) -> Result<Self, BrokerError> {
        let stream = TcpStream::connect((host, port)).map_err(|e| {
            BrokerError::new(
                format!("could not connect to {host}:{port}: {e}"),
                BrokerErrorKind::ConnectionError,
            )
        })?;
        Self::from_connection(Connection::Tcp(stream))
    }

    #[cfg(unix)]
    pub fn connect_unix(path: &str) -> Result<Self, BrokerError> {
        let stream = UnixStream::connect(path).map_err(|e| {
            BrokerError::new(
                format!("could not connect to unix socket {path}: {e}"),
                BrokerErrorKind::ConnectionError,
            )
        })?;
        Self::from_connection(Connection::Unix(stream))
    }

    fn from_connection(conn: Connection) -> Result<Self, BrokerError> {
        let writer = conn.try_clone()?;
        Ok(Driver {
            writer: conn,
            reader: BufReader::new(writer),
        })
    }

    pub fn command(&mut self, parts: &[Vec<u8>]) -> Result<RespValue, BrokerError> {
        write_command(parts, &mut self.writer)?;
        read_value(&mut self.reader)
    }

    /// Sends a command without waiting for a reply. Used for SUBSCRIBE-style
    /// commands where the reply is consumed by the subscriber's read loop
    /// instead.
    pub fn send(&mut self, parts: &[Vec<u8>]) -> Result<(), BrokerError> {
        write_command(parts, &mut self.writer)
    }

    pub fn read_reply(&mut self) -> Result<RespValue, BrokerError> {
        read_value(&mut self.reader)
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<(), BrokerError> {
        self.writer.set_read_timeout(timeout)?;
        Ok(())
    }

    pub fn try_clone(&self) -> Result<Driver, BrokerError> {
        Self::from_connection(self.writer.try_clone()?)
    }
}
