//! The transport adapter: three multicast endpoints derived from one base
//! address, each independently joinable for sending, receiving or both.
//!
//! Receiving endpoints run a dedicated reader task feeding a bounded queue -
//! that is the only parallelism the transport introduces. A full send buffer
//! (ENOBUFS) is surfaced as the distinct, recoverable `Error::BufferFull` so
//! the state machines can back off instead of dying.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error, trace};

use crate::config::TransferConfig;
use crate::error::{Error, Result};

/// Queue depth of a receiving endpoint, in datagrams.
const RECV_QUEUE_DEPTH: usize = 64;

/// Socket buffer sizing, in datagrams. Control traffic is sparse; the data
/// channel carries the firehose.
const SEND_BUF_CONTROL: usize = 2;
const RECV_BUF_CONTROL: usize = 32;
const SEND_BUF_DATA: usize = 64;
const RECV_BUF_DATA: usize = 64;

/// The three logical endpoints of a transfer group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    ControlToServer,
    ControlToClient,
    Data,
}

impl Channel {
    fn port_offset(self) -> u16 {
        match self {
            Channel::ControlToServer => 0,
            Channel::ControlToClient => 1,
            Channel::Data => 2,
        }
    }

    fn index(self) -> usize {
        self.port_offset() as usize
    }

    fn is_data(self) -> bool {
        self == Channel::Data
    }
}

/// One received datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub payload: Vec<u8>,
    pub source: SocketAddr,
}

/// The sending half of the transport, separated out so the sender/receiver
/// state machines can be driven against a mock.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSender: Send + Sync + 'static {
    /// Send one datagram on the channel's multicast address. `BufferFull` is
    /// recoverable; everything else is fatal to the caller's main loop.
    async fn send(&self, channel: Channel, buf: &[u8]) -> Result<usize>;

    fn max_message_size(&self) -> usize;
}

pub struct Multicast {
    config: TransferConfig,
    sockets: [Option<Arc<UdpSocket>>; 3],
}

impl Multicast {
    pub fn new(config: TransferConfig) -> Multicast {
        Multicast {
            config,
            sockets: [None, None, None],
        }
    }

    pub fn channel_addr(&self, channel: Channel) -> SocketAddrV4 {
        SocketAddrV4::new(
            *self.config.group.ip(),
            self.config.group.port() + channel.port_offset(),
        )
    }

    /// Make `channel` sendable. Idempotent; shares the socket with a
    /// receiving join on the same channel.
    pub fn join_sender(&mut self, channel: Channel) -> Result<()> {
        self.socket(channel)?;
        Ok(())
    }

    /// Make `channel` receivable and return its datagram queue. The reader
    /// task lives until the socket errors or the queue is dropped.
    pub fn join_receiver(&mut self, channel: Channel) -> Result<mpsc::Receiver<Result<Datagram>>> {
        let socket = self.socket(channel)?;
        let max_message_size = self.config.datagram_size;

        let (tx, rx) = mpsc::channel(RECV_QUEUE_DEPTH);
        tokio::spawn(async move {
            let mut buf = vec![0u8; max_message_size];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((n, source)) => {
                        trace!("received {} bytes from {:?}", n, source);
                        let datagram = Datagram {
                            payload: buf[..n].to_vec(),
                            source,
                        };
                        if tx.send(Ok(datagram)).await.is_err() {
                            debug!("receive queue dropped, stopping reader task");
                            return;
                        }
                    }
                    Err(e) => {
                        error!("socket error on receive: {}", e);
                        let _ = tx.send(Err(e.into())).await;
                        return;
                    }
                }
            }
        });
        Ok(rx)
    }

    fn socket(&mut self, channel: Channel) -> Result<Arc<UdpSocket>> {
        if let Some(socket) = &self.sockets[channel.index()] {
            return Ok(socket.clone());
        }

        let socket = self.create_socket(channel)?;
        self.sockets[channel.index()] = Some(socket.clone());
        Ok(socket)
    }

    fn create_socket(&self, channel: Channel) -> Result<Arc<UdpSocket>> {
        let config = &self.config;
        let port = config.group.port() + channel.port_offset();

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;

        let iface = config.interface.unwrap_or(Ipv4Addr::UNSPECIFIED);
        socket.join_multicast_v4(config.group.ip(), &iface)?;
        socket.set_multicast_ttl_v4(config.ttl)?;
        socket.set_multicast_loop_v4(config.loopback)?;
        if let Some(iface) = config.interface {
            socket.set_multicast_if_v4(&iface)?;
        }

        let (send_count, recv_count) = if channel.is_data() {
            (SEND_BUF_DATA, RECV_BUF_DATA)
        } else {
            (SEND_BUF_CONTROL, RECV_BUF_CONTROL)
        };
        socket.set_send_buffer_size(config.datagram_size * send_count)?;
        socket.set_recv_buffer_size(config.datagram_size * recv_count)?;

        socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(socket.into())?;
        debug!("joined {:?} on port {}", channel, port);
        Ok(Arc::new(socket))
    }
}

#[async_trait]
impl DatagramSender for Multicast {
    async fn send(&self, channel: Channel, buf: &[u8]) -> Result<usize> {
        let socket = self.sockets[channel.index()]
            .as_ref()
            .ok_or_else(|| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "channel was not joined for sending",
                ))
            })?;

        let dest = self.channel_addr(channel);
        match socket.send_to(buf, SocketAddr::V4(dest)).await {
            Ok(n) => Ok(n),
            Err(e) if e.raw_os_error() == Some(libc::ENOBUFS) => Err(Error::BufferFull),
            Err(e) => Err(e.into()),
        }
    }

    fn max_message_size(&self) -> usize {
        self.config.datagram_size
    }
}
