//! The sending side: announces the transfer, serves metadata on request,
//! merges receiver NAK feedback and pumps data while at least one receiver
//! keeps asking.
//!
//! Two cooperative tasks make up a sender: the event loop (control messages
//! plus the announce/refresh timers) and the data pump. The interval set,
//! the region cursor and the tarball reader are the only shared state,
//! guarded by one mutex. A sender never finishes on its own - it keeps
//! seeding until it is shut down externally.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::sync::{Mutex, Notify};
use tokio::time::{interval, Instant};
use tracing::{debug, info, trace, warn};

use crate::config::TransferConfig;
use crate::error::{Error, Result};
use crate::multicast::{Channel, Datagram, DatagramSender};
use crate::nak_regions::NakRegions;
use crate::rate::RateLimiter;
use crate::tarball::{encode_metadata, TarballReader};
use crate::wire::{
    AckDataSection, ClientBound, DataSection, HashId, ServerBound, CONTROL_PREFIX_SIZE,
    DATA_PREFIX_SIZE,
};

/// State shared between the event loop (NAK ingestion) and the data pump
/// (transmit bookkeeping). The reader lives here because only the pump uses
/// it and it carries the single-open-file cache.
struct SenderShared {
    nak_regions: NakRegions,
    next_region: i64,
    reader: TarballReader,
    bytes_sent: i64,
}

pub struct Server {
    config: TransferConfig,
    transport: Arc<dyn DatagramSender>,

    hash_id: HashId,
    stream_size: i64,
    metadata_sections: Vec<Vec<u8>>,

    /// payload bytes per data datagram
    region_size: usize,

    shared: Arc<Mutex<SenderShared>>,
    allow_send: Arc<Notify>,

    bytes_sent_last: i64,
    last_report: Instant,
}

impl Server {
    pub fn new(
        reader: TarballReader,
        transport: Arc<dyn DatagramSender>,
        config: TransferConfig,
    ) -> Result<Server> {
        let hash_id = reader.hash_id();
        let stream_size = reader.size();
        let max_message_size = transport.max_message_size();

        let metadata_sections = build_metadata_sections(&reader, max_message_size)?;
        let region_size = max_message_size - DATA_PREFIX_SIZE;

        // a fresh transfer has no outstanding NAKs; resuming receivers
        // repopulate the set through their feedback messages
        let mut nak_regions = NakRegions::new(stream_size);
        nak_regions.ack(0, stream_size)?;

        Ok(Server {
            config,
            transport,
            hash_id,
            stream_size,
            metadata_sections,
            region_size,
            shared: Arc::new(Mutex::new(SenderShared {
                nak_regions,
                next_region: 0,
                reader,
                bytes_sent: 0,
            })),
            allow_send: Arc::new(Notify::new()),
            bytes_sent_last: 0,
            last_report: Instant::now(),
        })
    }

    pub fn hash_id(&self) -> HashId {
        self.hash_id
    }

    /// The event loop. Returns only on a fatal transport or I/O error, or
    /// when the control queue is closed.
    pub async fn run(
        mut self,
        mut ctrl_rx: tokio::sync::mpsc::Receiver<Result<Datagram>>,
    ) -> Result<()> {
        info!(
            "serving {} bytes in {} metadata sections, id {}",
            self.stream_size,
            self.metadata_sections.len(),
            self.hash_id
        );

        let mut pump = tokio::spawn(data_pump(
            self.shared.clone(),
            self.allow_send.clone(),
            self.transport.clone(),
            self.hash_id,
            self.region_size,
            self.config.resend_timeout,
            self.config.initial_send_rate(),
        ));

        let mut announce = interval(self.config.announce_interval);
        let mut refresh = interval(self.config.refresh_interval);

        let result = loop {
            tokio::select! {
                msg = ctrl_rx.recv() => match msg {
                    Some(Ok(datagram)) => {
                        if let Err(e) = self.process_control(&datagram).await {
                            break Err(e);
                        }
                    }
                    Some(Err(e)) => break Err(e),
                    None => break Ok(()),
                },
                _ = announce.tick() => {
                    if let Err(e) = self.announce().await {
                        break Err(e);
                    }
                }
                _ = refresh.tick() => self.report_progress().await,
                pump_result = &mut pump => {
                    break match pump_result {
                        Ok(r) => r,
                        Err(e) => Err(Error::Io(std::io::Error::other(e))),
                    };
                }
            }
        };

        pump.abort();
        result
    }

    async fn announce(&self) -> Result<()> {
        self.send_control(ClientBound::Announce).await
    }

    async fn process_control(&mut self, datagram: &Datagram) -> Result<()> {
        let mut buf = datagram.payload.as_slice();
        let (hash_id, msg) = match ServerBound::deser(&mut buf) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!("dropping undecodable control message from {:?}: {}", datagram.source, e);
                return Ok(());
            }
        };

        if hash_id != self.hash_id {
            trace!("ignoring control message for transfer {}", hash_id);
            return Ok(());
        }

        match msg {
            ServerBound::RequestMetadataHeader => {
                self.send_control(ClientBound::MetadataHeader {
                    section_count: self.metadata_sections.len() as u16,
                })
                .await
            }
            ServerBound::RequestMetadataSection { index } => {
                let Some(payload) = self.metadata_sections.get(index as usize) else {
                    debug!("metadata section {} out of range - ignoring", index);
                    return Ok(());
                };
                self.send_control(ClientBound::MetadataSection {
                    index,
                    payload: payload.clone(),
                })
                .await
            }
            ServerBound::AckDataSection(ack) => {
                self.ingest_feedback(&ack).await;
                Ok(())
            }
        }
    }

    /// Merge a receiver's NAK list into the sender set and open the pump's
    /// send window. The 16-byte last-ack prefix is informational only.
    async fn ingest_feedback(&self, ack: &AckDataSection) {
        let mut shared = self.shared.lock().await;
        for nak in &ack.naks {
            if nak.start < 0 || nak.end_ex > self.stream_size || nak.start >= nak.end_ex {
                warn!("ignoring out-of-range NAK {} from receiver", nak);
                continue;
            }
            shared
                .nak_regions
                .nak(nak.start, nak.end_ex)
                .expect("range was validated");
        }
        drop(shared);

        self.allow_send.notify_one();
    }

    async fn send_control(&self, msg: ClientBound) -> Result<()> {
        let mut buf = BytesMut::new();
        msg.ser(self.hash_id, &mut buf);

        match self.transport.send(Channel::ControlToClient, &buf).await {
            Ok(_) => Ok(()),
            Err(Error::BufferFull) => {
                debug!("control send hit a full buffer - backing off");
                tokio::time::sleep(self.config.buffer_full_backoff).await;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn report_progress(&mut self) {
        let shared = self.shared.lock().await;
        let bytes_sent = shared.bytes_sent;
        let meter = shared.nak_regions.ascii_meter_at(48, shared.next_region);
        drop(shared);

        let now = Instant::now();
        let secs = (now - self.last_report).as_secs_f64();
        let rate = (bytes_sent - self.bytes_sent_last) as f64 / secs.max(1e-9);
        self.bytes_sent_last = bytes_sent;
        self.last_report = now;

        info!("{:>12.0} B/s [{}]", rate, meter);
    }
}

fn build_metadata_sections(reader: &TarballReader, max_message_size: usize) -> Result<Vec<Vec<u8>>> {
    let blob = encode_metadata(reader.file_set());
    let section_size = max_message_size - (CONTROL_PREFIX_SIZE + 2);

    let sections: Vec<Vec<u8>> = blob.chunks(section_size).map(<[u8]>::to_vec).collect();
    if sections.len() > u16::MAX as usize {
        return Err(Error::BadMetadata);
    }
    Ok(sections)
}

/// The data pump: parked on the `allow_send` latch until receiver feedback
/// arrives, then sends NAK'ed regions for one `resend_timeout` window,
/// rate-limited, before parking again.
async fn data_pump(
    shared: Arc<Mutex<SenderShared>>,
    allow_send: Arc<Notify>,
    transport: Arc<dyn DatagramSender>,
    hash_id: HashId,
    region_size: usize,
    resend_timeout: Duration,
    initial_rate: f64,
) -> Result<()> {
    let mut limiter = RateLimiter::new(initial_rate, 20);
    let mut region_buf = vec![0u8; region_size];
    let mut msg_buf = BytesMut::with_capacity(DATA_PREFIX_SIZE + region_size);

    loop {
        allow_send.notified().await;
        trace!("send window opened");

        let deadline = Instant::now() + resend_timeout;
        while Instant::now() < deadline {
            limiter.acquire().await;

            let (offset, n) = {
                let mut shared = shared.lock().await;
                let next_region = shared.next_region;
                let Some(next) = shared.nak_regions.next_nak(next_region) else {
                    // everything acknowledged - park until fresh NAKs arrive
                    break;
                };
                shared.next_region = next;
                let n = shared.reader.read_at(&mut region_buf, next)?;
                (next, n)
            };

            msg_buf.clear();
            DataSection::ser_into(hash_id, offset, &region_buf[..n], &mut msg_buf);

            match transport.send(Channel::Data, &msg_buf).await {
                Ok(_) => {
                    let mut shared = shared.lock().await;
                    let end_ex = offset + n as i64;
                    shared.nak_regions.ack(offset, end_ex)?;
                    shared.bytes_sent += n as i64;
                    shared.next_region = if end_ex >= shared.nak_regions.size() {
                        0
                    } else {
                        end_ex
                    };
                    limiter.scale(1.025);
                }
                Err(Error::BufferFull) => {
                    // cursor untouched: the region goes out again next round
                    trace!("data send hit a full buffer - reducing rate");
                    limiter.scale(0.85);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multicast::MockDatagramSender;
    use crate::nak_regions::Region;
    use crate::tarball::TarballOptions;
    use async_trait::async_trait;
    use std::net::SocketAddr;
    use std::path::Path;
    use tempfile::tempdir;

    const TEST_MSG_SIZE: usize = 1200;

    fn reader_for(dir: &Path, files: &[(&str, &[u8])]) -> TarballReader {
        let mut entries = Vec::new();
        for (name, contents) in files {
            std::fs::write(dir.join(name), contents).unwrap();
            entries.push(crate::tarball::FileEntry {
                path: (*name).to_owned(),
                local_path: dir.join(name),
                size: 0,
                mode: 0,
                symlink_target: String::new(),
            });
        }
        TarballReader::new(entries, TarballOptions::default()).unwrap()
    }

    fn datagram(payload: Vec<u8>) -> Datagram {
        Datagram {
            payload,
            source: SocketAddr::from(([127, 0, 0, 1], 9999)),
        }
    }

    /// Collects everything sent through it, in order.
    struct CollectingSender {
        sent: Mutex<Vec<(Channel, Vec<u8>)>>,
        max_message_size: usize,
    }
    impl CollectingSender {
        fn new(max_message_size: usize) -> CollectingSender {
            CollectingSender {
                sent: Mutex::new(Vec::new()),
                max_message_size,
            }
        }

        async fn sent(&self) -> Vec<(Channel, Vec<u8>)> {
            self.sent.lock().await.clone()
        }
    }
    #[async_trait]
    impl DatagramSender for CollectingSender {
        async fn send(&self, channel: Channel, buf: &[u8]) -> Result<usize> {
            self.sent.lock().await.push((channel, buf.to_vec()));
            Ok(buf.len())
        }

        fn max_message_size(&self) -> usize {
            self.max_message_size
        }
    }

    fn ser_server_bound(msg: ServerBound, hash_id: HashId) -> Vec<u8> {
        let mut buf = BytesMut::new();
        msg.ser(hash_id, &mut buf);
        buf.to_vec()
    }

    #[tokio::test]
    async fn test_metadata_sections_cover_blob() {
        let dir = tempdir().unwrap();
        let reader = reader_for(dir.path(), &[("hello.txt", b"Hello, world!\n")]);
        let blob = encode_metadata(reader.file_set());

        let sections = build_metadata_sections(&reader, TEST_MSG_SIZE).unwrap();
        assert_eq!(sections.concat(), blob);

        // small message size forces multiple sections
        let sections = build_metadata_sections(&reader, CONTROL_PREFIX_SIZE + 2 + 8).unwrap();
        assert!(sections.len() > 1);
        assert!(sections.iter().all(|s| s.len() <= 8));
        assert_eq!(sections.concat(), blob);
    }

    #[tokio::test]
    async fn test_serves_metadata_header_and_sections() {
        let dir = tempdir().unwrap();
        let reader = reader_for(dir.path(), &[("hello.txt", b"Hello, world!\n")]);
        let transport = Arc::new(CollectingSender::new(TEST_MSG_SIZE));
        let mut server =
            Server::new(reader, transport.clone(), TransferConfig::default()).unwrap();
        let hash_id = server.hash_id();
        let sections = server.metadata_sections.clone();

        server
            .process_control(&datagram(ser_server_bound(
                ServerBound::RequestMetadataHeader,
                hash_id,
            )))
            .await
            .unwrap();
        server
            .process_control(&datagram(ser_server_bound(
                ServerBound::RequestMetadataSection { index: 0 },
                hash_id,
            )))
            .await
            .unwrap();

        let sent = transport.sent().await;
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|(c, _)| *c == Channel::ControlToClient));

        let (_, header) = ClientBound::deser(&mut sent[0].1.as_slice()).unwrap();
        assert_eq!(
            header,
            ClientBound::MetadataHeader {
                section_count: sections.len() as u16
            }
        );
        let (_, section) = ClientBound::deser(&mut sent[1].1.as_slice()).unwrap();
        assert_eq!(
            section,
            ClientBound::MetadataSection {
                index: 0,
                payload: sections[0].clone()
            }
        );
    }

    #[tokio::test]
    async fn test_out_of_range_section_request_is_dropped() {
        let dir = tempdir().unwrap();
        let reader = reader_for(dir.path(), &[("a", b"x")]);
        let transport = Arc::new(CollectingSender::new(TEST_MSG_SIZE));
        let mut server =
            Server::new(reader, transport.clone(), TransferConfig::default()).unwrap();
        let hash_id = server.hash_id();

        server
            .process_control(&datagram(ser_server_bound(
                ServerBound::RequestMetadataSection { index: 999 },
                hash_id,
            )))
            .await
            .unwrap();

        assert!(transport.sent().await.is_empty());
    }

    #[tokio::test]
    async fn test_hash_mismatch_is_dropped() {
        let dir = tempdir().unwrap();
        let reader = reader_for(dir.path(), &[("a", b"x")]);
        let transport = Arc::new(CollectingSender::new(TEST_MSG_SIZE));
        let mut server =
            Server::new(reader, transport.clone(), TransferConfig::default()).unwrap();

        let other = HashId::from_bytes([9; 8]);
        server
            .process_control(&datagram(ser_server_bound(
                ServerBound::RequestMetadataHeader,
                other,
            )))
            .await
            .unwrap();

        assert!(transport.sent().await.is_empty());
    }

    #[tokio::test]
    async fn test_nak_ingestion_populates_set() {
        let dir = tempdir().unwrap();
        let reader = reader_for(dir.path(), &[("a", b"0123456789")]);
        let transport = Arc::new(CollectingSender::new(TEST_MSG_SIZE));
        let mut server =
            Server::new(reader, transport.clone(), TransferConfig::default()).unwrap();
        let hash_id = server.hash_id();

        // sender starts fully acked
        assert!(server.shared.lock().await.nak_regions.is_all_acked());

        let ack = AckDataSection {
            last_ack: Region::new(0, 0),
            naks: vec![
                Region::new(0, 4),
                Region::new(6, 8),
                // hostile input: must be skipped, not kill the sender
                Region::new(-3, 2),
                Region::new(5, 99999),
                Region::new(8, 8),
            ],
        };
        server
            .process_control(&datagram(ser_server_bound(
                ServerBound::AckDataSection(ack),
                hash_id,
            )))
            .await
            .unwrap();

        let shared = server.shared.lock().await;
        assert_eq!(
            shared.nak_regions.naks(),
            &[Region::new(0, 4), Region::new(6, 8)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_pump_sends_naked_regions_and_parks() {
        let dir = tempdir().unwrap();
        let reader = reader_for(dir.path(), &[("hello.txt", b"Hello, world!\n")]);
        let transport = Arc::new(CollectingSender::new(TEST_MSG_SIZE));
        let server = Server::new(reader, transport.clone(), TransferConfig::default()).unwrap();
        let hash_id = server.hash_id();
        let stream_size = server.stream_size;

        // simulate receiver feedback: everything is missing
        server
            .shared
            .lock()
            .await
            .nak_regions
            .nak(0, stream_size)
            .unwrap();

        let pump = tokio::spawn(data_pump(
            server.shared.clone(),
            server.allow_send.clone(),
            transport.clone(),
            hash_id,
            server.region_size,
            server.config.resend_timeout,
            server.config.initial_send_rate(),
        ));
        server.allow_send.notify_one();

        // the pump drains the set within one send window
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(server.shared.lock().await.nak_regions.is_all_acked());
        pump.abort();

        let sent = transport.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, Channel::Data);
        let (id, data) = DataSection::deser(&mut sent[0].1.as_slice()).unwrap();
        assert_eq!(id, hash_id);
        assert_eq!(data.offset, 0);
        assert_eq!(data.payload, b"Hello, world!\n\x00");
    }

    #[tokio::test(start_paused = true)]
    async fn test_pump_resumes_from_cursor_and_wraps() {
        let dir = tempdir().unwrap();
        let reader = reader_for(dir.path(), &[("a", b"0123456789")]);
        let transport = Arc::new(CollectingSender::new(TEST_MSG_SIZE));
        let mut config = TransferConfig::default();
        config.datagram_size = TEST_MSG_SIZE;
        let server = Server::new(reader, transport.clone(), config).unwrap();

        {
            let mut shared = server.shared.lock().await;
            shared.nak_regions.nak(0, 3).unwrap();
            shared.nak_regions.nak(8, 11).unwrap();
            shared.next_region = 5;
        }

        let pump = tokio::spawn(data_pump(
            server.shared.clone(),
            server.allow_send.clone(),
            transport.clone(),
            server.hash_id,
            server.region_size,
            server.config.resend_timeout,
            server.config.initial_send_rate(),
        ));
        server.allow_send.notify_one();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(server.shared.lock().await.nak_regions.is_all_acked());
        pump.abort();

        // cursor was at 5: the region at 8 goes first, then the wrap to 0
        let sent = transport.sent().await;
        let offsets: Vec<i64> = sent
            .iter()
            .map(|(_, buf)| DataSection::deser(&mut buf.as_slice()).unwrap().1.offset)
            .collect();
        assert_eq!(offsets, vec![8, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pump_reduces_rate_on_buffer_full() {
        let dir = tempdir().unwrap();
        let reader = reader_for(dir.path(), &[("a", b"abc")]);

        let mut mock = MockDatagramSender::new();
        mock.expect_max_message_size().return_const(TEST_MSG_SIZE);
        // first send fails with a full buffer, the retry succeeds
        let mut seq = mockall::Sequence::new();
        mock.expect_send()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(Error::BufferFull));
        mock.expect_send()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, buf| Ok(buf.len()));
        let transport = Arc::new(mock);

        let server = Server::new(reader, transport.clone(), TransferConfig::default()).unwrap();
        let stream_size = server.stream_size;
        server
            .shared
            .lock()
            .await
            .nak_regions
            .nak(0, stream_size)
            .unwrap();

        let pump = tokio::spawn(data_pump(
            server.shared.clone(),
            server.allow_send.clone(),
            transport,
            server.hash_id,
            server.region_size,
            server.config.resend_timeout,
            server.config.initial_send_rate(),
        ));
        server.allow_send.notify_one();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(server.shared.lock().await.nak_regions.is_all_acked());
        pump.abort();
    }
}
