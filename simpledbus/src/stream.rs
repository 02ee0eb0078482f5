//! Byte streams a [`PeerTransport`](crate::PeerTransport) can run over.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;

use crate::error::*;

pub trait Stream: Read + Write + Send + AsRawFd {
    fn shutdown(&mut self) -> Result<()>;
    fn set_nonblocking(&mut self, b: bool) -> Result<()>;
}

impl Stream for TcpStream {
    #[inline]
    fn shutdown(&mut self) -> Result<()> {
        TcpStream::shutdown(self, Shutdown::Both).map_err(map_context!())?;
        Ok(())
    }

    #[inline]
    fn set_nonblocking(&mut self, b: bool) -> Result<()> {
        TcpStream::set_nonblocking(self, b).map_err(map_context!())?;
        Ok(())
    }
}

impl Stream for UnixStream {
    #[inline]
    fn shutdown(&mut self) -> Result<()> {
        UnixStream::shutdown(self, Shutdown::Both).map_err(map_context!())?;
        Ok(())
    }

    #[inline]
    fn set_nonblocking(&mut self, b: bool) -> Result<()> {
        UnixStream::set_nonblocking(self, b).map_err(map_context!())?;
        Ok(())
    }
}

/// Open a stream to `address`: `tcp:host:port`, `unix:/path` or, on Linux,
/// `unix:@name` for an abstract socket. Anything after a `;` is ignored.
pub fn connect(address: &str) -> Result<Box<dyn Stream>> {
    if let Some(addr) = address.strip_prefix("tcp:") {
        let stream = TcpStream::connect(addr).map_err(map_context!())?;
        return Ok(Box::new(stream));
    }

    if let Some(addr) = address.strip_prefix("unix:") {
        let addr = addr.split(';').next().unwrap_or_default();
        if let Some(name) = addr.strip_prefix('@') {
            return connect_abstract(name);
        }
        let stream = UnixStream::connect(addr).map_err(map_context!())?;
        return Ok(Box::new(stream));
    }

    Err(context!(ErrorKind::Transport(format!(
        "unknown address '{}'",
        address
    ))))
}

#[cfg(target_os = "linux")]
fn connect_abstract(name: &str) -> Result<Box<dyn Stream>> {
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::SocketAddr;

    let addr = SocketAddr::from_abstract_name(name).map_err(map_context!())?;
    let stream = UnixStream::connect_addr(&addr).map_err(map_context!())?;
    Ok(Box::new(stream))
}

#[cfg(not(target_os = "linux"))]
fn connect_abstract(name: &str) -> Result<Box<dyn Stream>> {
    Err(context!(ErrorKind::Transport(format!(
        "abstract socket '@{}' not supported on this platform",
        name
    ))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_address() {
        let err = connect("udp:localhost:1").err().unwrap();
        assert!(matches!(err.kind(), ErrorKind::Transport(_)));
    }

    #[test]
    fn test_unix_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("socket");
        let _listener = std::os::unix::net::UnixListener::bind(&path).unwrap();
        let stream = connect(&format!("unix:{};mode=0600", path.display()));
        assert!(stream.is_ok());
    }

    #[test]
    fn test_missing_unix_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nothing-here");
        let err = connect(&format!("unix:{}", path.display())).err().unwrap();
        assert!(matches!(err.kind(), ErrorKind::Io(_)));
    }
}
