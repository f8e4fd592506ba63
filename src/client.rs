//! The receiving side: selects an announced transfer, pulls the metadata
//! sections, then consumes data datagrams - answering every one with an
//! `AckDataSection` carrying its current NAK list - until its interval set
//! is empty.
//!
//! One cooperative loop drives everything. Liveness comes from a single
//! replaceable resend deadline: whenever a request goes out, the deadline is
//! re-armed, and on expiry the current question is simply asked again.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::time::{interval, sleep_until, Instant};
use tracing::{debug, info, trace};

use crate::config::TransferConfig;
use crate::error::{Error, Result};
use crate::multicast::{Channel, Datagram, DatagramSender};
use crate::nak_regions::{NakRegions, Region};
use crate::tarball::{decode_metadata, TarballOptions, TarballWriter};
use crate::wire::{AckDataSection, ClientBound, DataSection, HashId, ServerBound};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    ExpectAnnouncement,
    ExpectMetadataHeader,
    ExpectMetadataSections,
    ExpectDataSections,
    Done,
}

#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    /// Only accept announcements for this transfer. `None` binds to the
    /// first announcement seen.
    pub hash_id_filter: Option<HashId>,

    /// Destination directory for the reconstructed files.
    pub root: PathBuf,

    pub tarball: TarballOptions,
}

pub struct Client {
    config: TransferConfig,
    options: ClientOptions,
    transport: Arc<dyn DatagramSender>,

    state: ClientState,
    hash_id: Option<HashId>,

    section_count: u16,
    sections: Vec<Option<Vec<u8>>>,
    next_section: u16,

    writer: Option<TarballWriter>,
    nak_regions: Option<NakRegions>,
    last_ack: Region,

    bytes_received: i64,
    resend_deadline: Option<Instant>,

    bytes_received_last: i64,
    last_report: Instant,
    started: Instant,
}

impl Client {
    pub fn new(
        transport: Arc<dyn DatagramSender>,
        options: ClientOptions,
        config: TransferConfig,
    ) -> Client {
        Client {
            config,
            hash_id: options.hash_id_filter,
            options,
            transport,
            state: ClientState::ExpectAnnouncement,
            section_count: 0,
            sections: Vec::new(),
            next_section: 0,
            writer: None,
            nak_regions: None,
            last_ack: Region::new(0, 0),
            bytes_received: 0,
            resend_deadline: None,
            bytes_received_last: 0,
            last_report: Instant::now(),
            started: Instant::now(),
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn bytes_received(&self) -> i64 {
        self.bytes_received
    }

    /// The main loop: control messages, data datagrams, the resend deadline
    /// and the refresh tick. Returns once the transfer is complete or a
    /// fatal error occurs.
    pub async fn run(
        mut self,
        mut ctrl_rx: tokio::sync::mpsc::Receiver<Result<Datagram>>,
        mut data_rx: tokio::sync::mpsc::Receiver<Result<Datagram>>,
    ) -> Result<()> {
        let mut refresh = interval(self.config.refresh_interval);
        self.started = Instant::now();
        self.last_report = self.started;

        while self.state != ClientState::Done {
            let resend_at = self
                .resend_deadline
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                msg = ctrl_rx.recv() => match msg {
                    Some(Ok(datagram)) => self.process_control(&datagram).await?,
                    Some(Err(e)) => return Err(e),
                    None => return Ok(()),
                },
                msg = data_rx.recv() => match msg {
                    Some(Ok(datagram)) => self.process_data(&datagram).await?,
                    Some(Err(e)) => return Err(e),
                    None => return Ok(()),
                },
                _ = sleep_until(resend_at), if self.resend_deadline.is_some() => {
                    trace!("resend timer fired in state {:?}", self.state);
                    self.ask().await?;
                }
                _ = refresh.tick() => self.report_progress(),
            }
        }

        self.report_progress();
        let elapsed = Instant::now() - self.started;
        info!(
            "transfer complete: {} bytes in {:.1?} ({:.0} B/s avg)",
            self.bytes_received,
            elapsed,
            self.bytes_received as f64 / elapsed.as_secs_f64().max(1e-9)
        );

        if let Some(mut writer) = self.writer.take() {
            writer.close()?;
        }
        Ok(())
    }

    async fn process_control(&mut self, datagram: &Datagram) -> Result<()> {
        let mut buf = datagram.payload.as_slice();
        let (hash_id, msg) = match ClientBound::deser(&mut buf) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!("dropping undecodable control message from {:?}: {}", datagram.source, e);
                return Ok(());
            }
        };

        match (self.state, msg) {
            (ClientState::ExpectAnnouncement, ClientBound::Announce) => {
                match self.hash_id {
                    // no filter: bind to the first transfer announced
                    None => self.hash_id = Some(hash_id),
                    Some(want) if want != hash_id => {
                        trace!("ignoring announcement for {}", hash_id);
                        return Ok(());
                    }
                    Some(_) => {}
                }
                info!("found transfer {}", hash_id);
                self.state = ClientState::ExpectMetadataHeader;
                self.ask().await
            }

            (ClientState::ExpectMetadataHeader, ClientBound::MetadataHeader { section_count }) => {
                if Some(hash_id) != self.hash_id {
                    return Ok(());
                }
                debug!("metadata has {} sections", section_count);
                self.section_count = section_count;
                self.sections = vec![None; section_count as usize];
                self.next_section = 0;
                self.state = ClientState::ExpectMetadataSections;
                self.ask().await
            }

            (
                ClientState::ExpectMetadataSections,
                ClientBound::MetadataSection { index, payload },
            ) => {
                if Some(hash_id) != self.hash_id {
                    return Ok(());
                }
                if index == self.next_section
                    && self
                        .sections
                        .get(index as usize)
                        .is_some_and(|slot| slot.is_none())
                {
                    self.sections[index as usize] = Some(payload);
                    self.next_section += 1;
                }
                if self.next_section >= self.section_count {
                    self.prepare_writer()?;
                    // an empty stream has nothing left to wait for
                    self.state = if self.nak_regions.as_ref().is_some_and(NakRegions::is_all_acked)
                    {
                        ClientState::Done
                    } else {
                        ClientState::ExpectDataSections
                    };
                }
                // either ask for the next section or send the first feedback
                self.ask().await
            }

            (_, msg) => {
                trace!("ignoring {:?} in state {:?}", msg, self.state);
                Ok(())
            }
        }
    }

    /// All metadata sections are in: decode them, build the writer and the
    /// fully-NAK'ed interval set.
    fn prepare_writer(&mut self) -> Result<()> {
        let blob: Vec<u8> = self
            .sections
            .drain(..)
            .map(|s| s.expect("all sections received"))
            .collect::<Vec<_>>()
            .concat();

        let (stream_size, entries) = decode_metadata(&blob)?;
        let writer = TarballWriter::new(entries, &self.options.root, self.options.tarball)?;
        if writer.size() != stream_size {
            debug!(
                "declared stream size {} does not match layout size {}",
                stream_size,
                writer.size()
            );
            return Err(Error::BadMetadata);
        }

        info!("receiving {} files, {} bytes:", writer.file_set().len(), stream_size);
        for entry in writer.file_set().entries() {
            info!("  {:o} {:>12} '{}'", entry.mode, entry.size, entry.path);
        }

        self.nak_regions = Some(NakRegions::new(stream_size));
        self.last_ack = Region::new(0, 0);
        self.writer = Some(writer);
        self.started = Instant::now();
        Ok(())
    }

    async fn process_data(&mut self, datagram: &Datagram) -> Result<()> {
        let Some(naks) = &mut self.nak_regions else {
            trace!("not ready for data yet");
            return Ok(());
        };

        let mut buf = datagram.payload.as_slice();
        let (hash_id, data) = match DataSection::deser(&mut buf) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!("dropping undecodable data message: {}", e);
                return Ok(());
            }
        };
        if Some(hash_id) != self.hash_id {
            trace!("ignoring data for transfer {}", hash_id);
            return Ok(());
        }

        let region = Region::new(data.offset, data.offset + data.payload.len() as i64);
        if region.start < 0 || region.end_ex > naks.size() {
            debug!("dropping data with out-of-range region {}", region);
            return Ok(());
        }

        self.last_ack = region;

        if naks.is_acked(region.start, region.end_ex) {
            // duplicate delivery - skip the write but keep the feedback
            // flowing so the sender's window stays open
            trace!("region {} already acknowledged", region);
        } else {
            naks.ack(region.start, region.end_ex)
                .expect("region was validated");
            self.writer
                .as_mut()
                .expect("writer exists whenever the interval set does")
                .write_at(&data.payload, region.start)?;
            self.bytes_received += region.len();
        }

        if self.nak_regions.as_ref().is_some_and(NakRegions::is_all_acked) {
            self.state = ClientState::Done;
        }
        self.ask().await
    }

    /// (Re-)send the question for the current state and arm the resend
    /// timer. Datagrams are unreliable; this is the only retry mechanism.
    async fn ask(&mut self) -> Result<()> {
        let hash_id = self.hash_id.expect("ask() is never called before a transfer is selected");

        let msg = match self.state {
            ClientState::ExpectMetadataHeader => ServerBound::RequestMetadataHeader,
            ClientState::ExpectMetadataSections => ServerBound::RequestMetadataSection {
                index: self.next_section,
            },
            ClientState::ExpectDataSections | ClientState::Done => {
                let naks = self.nak_regions.as_ref().expect("interval set exists");
                ServerBound::AckDataSection(AckDataSection::for_receiver(
                    self.last_ack,
                    naks.naks(),
                    self.transport.max_message_size(),
                ))
            }
            ClientState::ExpectAnnouncement => return Ok(()),
        };

        let mut buf = BytesMut::new();
        msg.ser(hash_id, &mut buf);
        match self.transport.send(Channel::ControlToServer, &buf).await {
            Ok(_) => {}
            Err(Error::BufferFull) => {
                debug!("control send hit a full buffer - backing off");
                tokio::time::sleep(self.config.buffer_full_backoff).await;
            }
            Err(e) => return Err(e),
        }

        self.resend_deadline = Some(Instant::now() + self.config.resend_timeout);
        Ok(())
    }

    fn report_progress(&mut self) {
        let now = Instant::now();
        let secs = (now - self.last_report).as_secs_f64();
        let rate = (self.bytes_received - self.bytes_received_last) as f64 / secs.max(1e-9);
        self.bytes_received_last = self.bytes_received;
        self.last_report = now;

        if let Some(naks) = &self.nak_regions {
            let pct = if naks.size() > 0 {
                self.bytes_received as f64 * 100.0 / naks.size() as f64
            } else {
                100.0
            };
            info!("{:>12.0} B/s {:6.2}% [{}]", rate, pct, naks.ascii_meter(48));
        } else {
            info!("waiting for transfer metadata");
        }
    }
}
