use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use anyhow::bail;

/// All tunables of a transfer participant. There is no global state - a
/// config is built once (CLI or defaults) and passed to the constructors.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Base multicast group. Control-to-server traffic uses this port,
    /// control-to-client `port + 1`, data `port + 2`.
    pub group: SocketAddrV4,

    /// IPv4 address of the NIC to bind multicast traffic to. `None` leaves
    /// the choice to the OS routing table.
    pub interface: Option<Ipv4Addr>,

    pub ttl: u32,

    /// Deliver our own multicast sends back to us. Required when sender and
    /// receiver share a host.
    pub loopback: bool,

    /// Upper bound for a single datagram, send and receive. The default of
    /// 65000 assumes a network that handles IP fragmentation gracefully;
    /// lowering it towards a typical MTU (1200-1500) trades throughput for
    /// robustness on lossier fabrics.
    pub datagram_size: usize,

    /// How often an idle sender advertises its transfer.
    pub announce_interval: Duration,

    /// The single liveness timeout: receivers re-ask their current question
    /// after this long without progress, and each receiver feedback buys the
    /// sender's data pump this much send time.
    pub resend_timeout: Duration,

    /// Progress reporting cadence. Purely cosmetic.
    pub refresh_interval: Duration,

    /// Backoff after a control-path send hits a full socket buffer.
    pub buffer_full_backoff: Duration,
}

impl TransferConfig {
    pub const DEFAULT_PORT: u16 = 1360;

    pub fn default_group() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(236, 0, 0, 100), Self::DEFAULT_PORT)
    }

    pub fn new(group: SocketAddrV4) -> TransferConfig {
        TransferConfig {
            group,
            interface: None,
            ttl: 8,
            loopback: false,
            datagram_size: 65000,
            announce_interval: Duration::from_secs(1),
            resend_timeout: Duration::from_millis(500),
            refresh_interval: Duration::from_secs(1),
            buffer_full_backoff: Duration::from_millis(50),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.datagram_size < 512 || self.datagram_size > 65000 {
            bail!(
                "datagram size {} outside the supported range 512..=65000",
                self.datagram_size
            );
        }
        if self.group.port() == 0 || self.group.port() > u16::MAX - 2 {
            bail!(
                "base port {} leaves no room for the three channel ports",
                self.group.port()
            );
        }
        if !self.group.ip().is_multicast() {
            bail!("group address {} is not a multicast address", self.group.ip());
        }
        Ok(())
    }

    /// Initial data-pump rate in datagrams per second, sized so a fresh
    /// sender starts around 1 GiB/s of wire budget and adapts from there.
    pub fn initial_send_rate(&self) -> f64 {
        (1024.0 * 1024.0 * 1024.0) / (self.datagram_size as f64 * 8.0)
    }
}

impl Default for TransferConfig {
    fn default() -> TransferConfig {
        TransferConfig::new(TransferConfig::default_group())
    }
}
