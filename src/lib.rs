//! Lancaster performs bulk file transfer from one sender to many receivers
//! over a single unreliable IP multicast channel. The sender's cost is
//! independent of the receiver count: every data byte goes out once (plus
//! retransmissions), no matter how many machines are listening.
//!
//! ## Design
//!
//! A sorted collection of files is exposed as one synthetic byte stream (the
//! "virtual tarball"): each file contributes its contents plus a single zero
//! terminator byte, so even empty files and symlinks occupy stream space and
//! therefore materialize on the receiving side. Sender and receiver derive
//! identical stream layouts from the transfer metadata.
//!
//! Reliability is NAK-based. Receivers track the not-yet-received subset of
//! `[0, stream_size)` in an interval set and piggyback a compact NAK list on
//! every feedback message; the sender OR-merges those lists into its own
//! interval set and keeps pumping bytes from the next NAK'ed position,
//! wrapping around the stream. Positive state never needs to be exchanged -
//! an empty set on both ends means the transfer is complete.
//!
//! The sender stays alive as a seeder after receivers finish; receivers that
//! join late (or restart mid-run) synchronize purely through their NAK
//! feedback.
//!
//! ## Channels
//!
//! Three multicast endpoints are derived from one base `ip:port`:
//!
//! * `port`     - control, receivers to sender
//! * `port + 1` - control, sender to receivers
//! * `port + 2` - data
//!
//! ## Wire format
//!
//! All integers little-endian. Control messages:
//!
//! ```ascii
//! 0: protocol version (u8, currently 1)
//! 1: transfer hash id (8 bytes)
//! 9: opcode (u8)
//! 10: opcode-specific body
//! ```
//!
//! To-client opcodes: `Announce(0)` (empty), `RespondMetadataHeader(1)`
//! (section count, u16), `RespondMetadataSection(2)` (section index u16 +
//! opaque bytes), `DeliverDataSection(3)` (reserved). To-server opcodes:
//! `RequestMetadataHeader(0)` (empty), `RequestMetadataSection(1)` (section
//! index u16), `AckDataSection(2)`:
//!
//! ```ascii
//! 0:  last received region start (u64)
//! 8:  last received region end, exclusive (u64)
//! 16: NAK list - (start, end) pairs, each a varuint64, until the datagram
//!     space runs out
//! ```
//!
//! Data messages:
//!
//! ```ascii
//! 0: protocol version (u8)
//! 1: transfer hash id (8 bytes)
//! 9: stream offset (u64)
//! 17: payload, up to `max_message_size - 17` bytes
//! ```
//!
//! The metadata blob (reassembled from its sections in index order) is
//! `stream_size (i64)`, `file_count (u32)`, then per file: length-prefixed
//! path, `size (i64)`, `mode (u32)`, length-prefixed symlink target.
//!
//! ## Flow control
//!
//! The sender's data pump is parked on a latch until receiver feedback
//! arrives; each feedback message buys one `resend_timeout` window of
//! sending. Within a window a token bucket paces datagrams, shrinking 15% on
//! local send-buffer pressure (ENOBUFS) and growing 2.5% on success. The
//! receivers' only liveness mechanism is a single resend deadline that
//! re-asks the current question.

pub mod client;
pub mod config;
pub mod error;
pub mod multicast;
pub mod nak_regions;
pub mod rate;
pub mod server;
pub mod tarball;
pub mod wire;

pub use client::{Client, ClientOptions, ClientState};
pub use config::TransferConfig;
pub use error::{Error, Result};
pub use multicast::{Channel, Datagram, DatagramSender, Multicast};
pub use nak_regions::{NakRegions, Region};
pub use server::Server;
pub use tarball::{FileEntry, TarballOptions, TarballReader, TarballWriter};
pub use wire::HashId;
