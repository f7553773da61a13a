use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

use log::warn;
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::timeout;

use crate::connector::Bootstrap;
use crate::error::ConnectError;

/// Parse a socket address, falling back to the resolver for host names.
/// If multiple addresses resolve, only the first is taken.
pub(crate) fn resolve(addr: &str) -> io::Result<SocketAddr> {
    if let Ok(sa) = addr.parse::<SocketAddr>() {
        return Ok(sa);
    }
    match addr.to_socket_addrs() {
        Ok(mut iter) => iter.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no address for {:?}", addr))
        }),
        Err(e) => {
            warn!("fail to resolve addr {:?}: {:?}", addr, e);
            Err(e)
        }
    }
}

/// Dial with the bootstrap's socket options applied. The native path goes
/// through an explicitly configured socket (reuse-address set before the
/// connect); the portable path is the runtime's plain connect.
pub(crate) async fn dial(boot: &Bootstrap, addr: &str) -> Result<TcpStream, ConnectError> {
    let sa = resolve(addr)?;
    let connect = async {
        if boot.native_poll {
            let socket = if sa.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
            socket.set_reuseaddr(boot.reuse_addr)?;
            socket.connect(sa).await
        } else {
            TcpStream::connect(sa).await
        }
    };
    let stream = if boot.connect_timeout.is_zero() {
        connect.await?
    } else {
        match timeout(boot.connect_timeout, connect).await {
            Ok(r) => r?,
            Err(_) => return Err(ConnectError::Timeout),
        }
    };
    if boot.nodelay {
        let _ = stream.set_nodelay(true);
    }
    Ok(stream)
}
