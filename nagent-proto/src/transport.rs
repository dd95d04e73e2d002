//! Socket management for message datagrams and I/O byte streams.
//!
//! The message engine exchanges exactly one framed message per datagram.
//! Stream helpers return short counts to the caller; looping until a full
//! buffer is transferred is the caller's business. Both modes retry system
//! calls interrupted by signals.

use crate::message::{HEADER_LEN, Header, MAX_MESSAGE_SIZE, Message, MsgType, ProtocolError};
use crate::pack::PackError;
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

const LISTEN_BACKLOG: i32 = 128;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },

    #[error("failed to connect to {addr}: {source}")]
    Connect { addr: SocketAddr, source: io::Error },

    #[error("socket error: {0}")]
    Io(#[from] io::Error),

    #[error("receive timed out")]
    Timeout,

    #[error("short datagram send: {sent} of {len} bytes")]
    ShortSend { sent: usize, len: usize },

    #[error("failed to encode message: {0}")]
    Encode(#[from] PackError),

    /// A datagram arrived but could not be decoded.
    #[error("undecodable message from {src}: {source}")]
    Decode {
        src: SocketAddr,
        /// Header type when the header itself was readable.
        msg_type: Option<u16>,
        source: ProtocolError,
    },
}

/// Run `op` until it completes with something other than `EINTR`.
pub fn retry_eintr<T>(mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    loop {
        match op() {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

fn domain_for(addr: &SocketAddr) -> Domain {
    match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    }
}

/// Datagram socket carrying one complete message per send/receive.
#[derive(Debug)]
pub struct MessageEngine {
    socket: UdpSocket,
}

/// Open a datagram socket bound to `bind_addr`.
pub fn init_message_engine(bind_addr: SocketAddr) -> Result<MessageEngine, TransportError> {
    let bind_err = |source| TransportError::Bind {
        addr: bind_addr,
        source,
    };
    let socket = Socket::new(domain_for(&bind_addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.bind(&bind_addr.into()).map_err(bind_err)?;

    let socket: UdpSocket = socket.into();
    debug!(addr = ?socket.local_addr().ok(), "Message engine bound");
    Ok(MessageEngine { socket })
}

impl MessageEngine {
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    /// Bound how long `receive_*` blocks; `None` blocks forever.
    pub fn set_receive_timeout(&self, timeout: Option<Duration>) -> Result<(), TransportError> {
        Ok(self.socket.set_read_timeout(timeout)?)
    }

    /// Another handle on the same socket, for a second thread.
    pub fn try_clone(&self) -> Result<Self, TransportError> {
        Ok(Self {
            socket: self.socket.try_clone()?,
        })
    }

    /// Frame `payload` behind a header and send it as one datagram.
    pub fn send_node_buffer(
        &self,
        dest: SocketAddr,
        msg_type: MsgType,
        flags: u16,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let mut header = crate::pack::Packer::with_limit(HEADER_LEN);
        Header::new(msg_type, flags, payload.len()).pack(&mut header)?;
        let mut datagram = header.into_inner();
        if datagram.len() + payload.len() > MAX_MESSAGE_SIZE {
            return Err(PackError::BufferFull {
                needed: payload.len(),
                remaining: MAX_MESSAGE_SIZE - HEADER_LEN,
            }
            .into());
        }
        datagram.extend_from_slice(payload);
        self.send_datagram(dest, &datagram)
    }

    pub fn send_message(&self, dest: SocketAddr, msg: &Message) -> Result<(), TransportError> {
        let datagram = msg.encode()?;
        trace!(%dest, msg_type = ?msg.msg_type(), len = datagram.len(), "Sending message");
        self.send_datagram(dest, &datagram)
    }

    fn send_datagram(&self, dest: SocketAddr, datagram: &[u8]) -> Result<(), TransportError> {
        let sent = retry_eintr(|| self.socket.send_to(datagram, dest))?;
        if sent != datagram.len() {
            return Err(TransportError::ShortSend {
                sent,
                len: datagram.len(),
            });
        }
        Ok(())
    }

    fn receive_datagram(&self, buf: &mut [u8]) -> Result<(SocketAddr, usize), TransportError> {
        match retry_eintr(|| self.socket.recv_from(buf)) {
            Ok((len, src)) => Ok((src, len)),
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut =>
            {
                Err(TransportError::Timeout)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Receive one message into `buf` and validate its header.
    ///
    /// On success the payload occupies
    /// `buf[HEADER_LEN..HEADER_LEN + header.payload_length]`.
    pub fn receive_buffer(
        &self,
        buf: &mut [u8],
    ) -> Result<(SocketAddr, Header, MsgType), TransportError> {
        let (src, len) = self.receive_datagram(buf)?;
        let datagram = &buf[..len];
        let header = Header::parse(datagram).map_err(|source| TransportError::Decode {
            src,
            msg_type: None,
            source,
        })?;
        let msg_type =
            header
                .validate(len - HEADER_LEN)
                .map_err(|source| TransportError::Decode {
                    src,
                    msg_type: Some(header.msg_type),
                    source,
                })?;
        Ok((src, header, msg_type))
    }

    /// Receive and fully decode one message.
    pub fn receive_message(&self) -> Result<(SocketAddr, Message), TransportError> {
        let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
        let (src, header, msg_type) = self.receive_buffer(&mut buf)?;
        let body = &buf[HEADER_LEN..HEADER_LEN + header.payload_length as usize];
        let msg = Message::decode_body(msg_type, body).map_err(|source| TransportError::Decode {
            src,
            msg_type: Some(header.msg_type),
            source,
        })?;
        trace!(%src, ?msg_type, "Received message");
        Ok((src, msg))
    }

    /// Release the socket.
    pub fn shutdown(self) {
        debug!(addr = ?self.socket.local_addr().ok(), "Message engine shut down");
    }
}

/// Listen for I/O stream connections.
pub fn listen_stream(addr: SocketAddr) -> Result<TcpListener, TransportError> {
    let bind_err = |source| TransportError::Bind { addr, source };
    let socket =
        Socket::new(domain_for(&addr), Type::STREAM, Some(Protocol::TCP)).map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket.listen(LISTEN_BACKLOG).map_err(bind_err)?;
    Ok(socket.into())
}

pub fn accept_stream(listener: &TcpListener) -> Result<(TcpStream, SocketAddr), TransportError> {
    Ok(retry_eintr(|| listener.accept())?)
}

pub fn connect_stream(addr: SocketAddr, timeout: Duration) -> Result<TcpStream, TransportError> {
    let stream = retry_eintr(|| TcpStream::connect_timeout(&addr, timeout))
        .map_err(|source| TransportError::Connect { addr, source })?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Read whatever is available; may return fewer bytes than `buf` holds.
/// Zero means end of stream.
pub fn read_stream<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    retry_eintr(|| reader.read(buf))
}

/// Write as much as the peer accepts right now; may be a short count.
pub fn write_stream<W: Write>(writer: &mut W, buf: &[u8]) -> io::Result<usize> {
    retry_eintr(|| writer.write(buf))
}

/// Shut down one or both directions, ignoring already-closed sockets.
pub fn shutdown_stream(stream: &TcpStream, how: Shutdown) {
    if let Err(e) = stream.shutdown(how)
        && e.kind() != io::ErrorKind::NotConnected
    {
        debug!(error = %e, "Stream shutdown failed");
    }
}
