// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The RTP session runtime.
//!
//! A [`Session`] owns the member database, the RTCP scheduler, the payload
//! (de)packetizer, and the retransmission buffer, and brokers packets
//! between the application and a [`crate::transport::PacketTransport`].
//!
//! Everything runs on one logical task: transport adapters marshal inbound
//! events through a [`SessionHandle`], and [`Session::run`] interleaves them
//! with the RTCP/RTX/BYE timers. All other processing runs to completion
//! without suspending.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, trace, warn};
use pretty_hex::PrettyHex;
use smallvec::SmallVec;
use tokio::sync::mpsc;

use crate::codec::{Depacketizer, GroupPacket, MediaSample, PacketGroup, Packetizer};
use crate::error::ErrorInt;
use crate::rtcp::{self, CompoundWriter};
use crate::rtp::RtpPacket;
use crate::rtx::TransmissionManager;
use crate::transport::{PacketTransport, TransportEvent};
use crate::{Error, PacketContext, WallTime};

pub mod clock;
pub mod member;
pub mod parameters;
mod scheduler;
pub mod state;

use clock::ReferenceClock;
use member::{MemberDb, MemberUpdate};
use parameters::{Profile, SessionParameters, XrMode};
use scheduler::{RtcpScheduler, SchedulerInputs, TimerVerdict, IMMEDIATE_BYE_LIMIT};
use state::SessionState;

/// An incoming RTP packet after member-database processing, as delivered to
/// the application's packet callback.
#[derive(Debug)]
pub struct ReceivedPacket {
    pub packet: RtpPacket,
    pub ctx: PacketContext,
    pub extended_sequence_number: u32,
    pub presentation: WallTime,
    pub source_valid: bool,
    pub rtcp_synchronized: bool,
}

/// Reassembled media samples of one playout group.
#[derive(Debug)]
pub struct SampleBatch {
    pub ssrc: u32,
    pub timestamp: u32,
    pub presentation: WallTime,
    pub source_valid: bool,
    pub rtcp_synchronized: bool,
    pub samples: Vec<MediaSample>,
}

/// Application callbacks. Each borrows only what the session passes it, so
/// no callback can capture the session itself.
#[derive(Default)]
pub struct SessionCallbacks {
    pub on_rtp: Option<Box<dyn FnMut(&ReceivedPacket) + Send>>,
    pub on_samples: Option<Box<dyn FnMut(SampleBatch) + Send>>,
    /// The raw compound RTCP packet, after member-database processing.
    pub on_rtcp: Option<Box<dyn FnMut(&[u8], &PacketContext) + Send>>,
    pub on_member_update: Option<Box<dyn FnMut(MemberUpdate) + Send>>,
    /// Packets whose payload type is not in the session's table; without
    /// this hook they are dropped.
    pub on_unknown_payload: Option<Box<dyn FnMut(&RtpPacket, &PacketContext) + Send>>,
    pub on_transport_error: Option<Box<dyn FnMut(&Error) + Send>>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum RunState {
    Stopped,
    Started,
    ShuttingDown,
}

/// Clonable handle for marshalling transport events onto the session task.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl SessionHandle {
    pub fn incoming_rtp(&self, data: Bytes, ctx: PacketContext) {
        let _ = self.tx.send(TransportEvent::Rtp { data, ctx });
    }

    pub fn incoming_rtcp(&self, data: Bytes, ctx: PacketContext) {
        let _ = self.tx.send(TransportEvent::Rtcp { data, ctx });
    }

    pub fn send_failed(&self, channel: &'static str, description: String) {
        let _ = self.tx.send(TransportEvent::SendFailed {
            channel,
            description,
        });
    }

    pub fn closed(&self) {
        let _ = self.tx.send(TransportEvent::Closed);
    }
}

struct PendingGroup {
    timestamp: u32,
    presentation: WallTime,
    source_valid: bool,
    rtcp_synchronized: bool,
    /// The access unit's final packet has been seen; the group flushes as
    /// soon as it is also gap-free (a retransmission may fill the gap).
    has_marker: bool,
    packets: Vec<GroupPacket>,
}

impl PendingGroup {
    fn is_contiguous(&self) -> bool {
        let mut seqs: Vec<u32> = self
            .packets
            .iter()
            .map(|p| p.extended_sequence_number)
            .collect();
        seqs.sort_unstable();
        seqs.dedup();
        match (seqs.first(), seqs.last()) {
            (Some(first), Some(last)) => last - first + 1 == seqs.len() as u32,
            _ => false,
        }
    }
}

pub struct Session {
    parameters: Arc<SessionParameters>,
    state: SessionState,
    clock: Arc<dyn ReferenceClock>,
    members: MemberDb,
    scheduler: RtcpScheduler,
    packetizer: Packetizer,
    depacketizer: Depacketizer,
    rtx: Option<TransmissionManager>,
    #[cfg(feature = "mprtp")]
    mprtp: Option<crate::mprtp::MpRtpState>,
    transport: Box<dyn PacketTransport>,
    callbacks: SessionCallbacks,
    run_state: RunState,
    groups: HashMap<u32, PendingGroup>,
    /// The most recent non-RTX remote media source, for associating
    /// SSRC-multiplexed retransmissions back onto its playout groups.
    primary_remote_ssrc: Option<u32>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    bye_at: Option<Instant>,
    packets_sent: u32,
    octets_sent: u32,
    rtx_packets_sent: u32,
    rtx_octets_sent: u32,
    last_error: Option<Error>,
}

impl Session {
    pub fn new(
        parameters: SessionParameters,
        transport: Box<dyn PacketTransport>,
        clock: Arc<dyn ReferenceClock>,
        callbacks: SessionCallbacks,
    ) -> Result<Self, Error> {
        let state = SessionState::new(&*clock);
        Self::with_state(parameters, transport, clock, callbacks, state)
    }

    /// As [`Session::new`], with caller-supplied identity (tests).
    #[doc(hidden)]
    pub fn with_state(
        parameters: SessionParameters,
        transport: Box<dyn PacketTransport>,
        clock: Arc<dyn ReferenceClock>,
        callbacks: SessionCallbacks,
        state: SessionState,
    ) -> Result<Self, Error> {
        let now = clock.now();
        let current = parameters.current_payload();
        let packetizer = Packetizer::new(
            parameters.media_type(),
            &current.encoding_name,
            parameters.packetization_mode,
            parameters.payload_budget(),
            parameters.aggregate_stap,
        )
        .map_err(|description| wrap!(ErrorInt::InvalidConfiguration { description }))?;
        let depacketizer = Depacketizer::new(
            parameters.media_type(),
            &current.encoding_name,
            parameters.packetization_mode,
        )
        .map_err(|description| wrap!(ErrorInt::InvalidConfiguration { description }))?;

        #[cfg(feature = "mprtp")]
        let mprtp = if parameters.mprtp_enabled() {
            let id = parameters
                .extension_id(crate::ext::MPRTP_EXTENSION_NAME)
                .ok_or_else(|| {
                    wrap!(ErrorInt::InvalidConfiguration {
                        description: format!(
                            "MPRTP requires an extmap entry for {}",
                            crate::ext::MPRTP_EXTENSION_NAME
                        ),
                    })
                })?;
            Some(crate::mprtp::MpRtpState::new(id))
        } else {
            None
        };
        #[cfg(feature = "mprtp")]
        let subflow_extension_id = mprtp.as_ref().map(|m| m.extension_id());
        #[cfg(not(feature = "mprtp"))]
        let subflow_extension_id = None;

        let rtx = parameters
            .rtx()
            .map(|r| TransmissionManager::new(r.policy, r.payload_type, subflow_extension_id));
        let mut local_ssrcs: SmallVec<[u32; 2]> = SmallVec::new();
        local_ssrcs.push(state.ssrc());
        if rtx.is_some() {
            local_ssrcs.push(state.rtx_ssrc());
        }
        let members = MemberDb::new(
            &local_ssrcs,
            parameters.sdes().cname.len(),
            parameters.xr() != XrMode::None,
            now,
        );
        let scheduler = RtcpScheduler::new(
            now,
            parameters.bandwidth_kbps(),
            parameters.reduced_minimum_rtcp,
        );
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            parameters: Arc::new(parameters),
            state,
            clock,
            members,
            scheduler,
            packetizer,
            depacketizer,
            rtx,
            #[cfg(feature = "mprtp")]
            mprtp,
            transport,
            callbacks,
            run_state: RunState::Stopped,
            groups: HashMap::new(),
            primary_remote_ssrc: None,
            events_tx,
            events_rx: Some(events_rx),
            bye_at: None,
            packets_sent: 0,
            octets_sent: 0,
            rtx_packets_sent: 0,
            rtx_octets_sent: 0,
            last_error: None,
        })
    }

    pub fn parameters(&self) -> &SessionParameters {
        &self.parameters
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// The handle transport adapters use to deliver inbound events.
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            tx: self.events_tx.clone(),
        }
    }

    /// The most recent recovered (non-fatal) error, for observability.
    pub fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }

    fn check_running(&self) -> Result<(), Error> {
        if self.run_state != RunState::Started {
            bail!(ErrorInt::SessionShuttingDown);
        }
        Ok(())
    }

    fn scheduler_inputs(&self) -> SchedulerInputs {
        SchedulerInputs {
            we_sent: self.members.is_local_sender(),
            senders: self.members.senders(),
            members: self.members.active_members(),
            avg_rtcp_size: self.members.avg_rtcp_size(),
        }
    }

    /// Transitions STOPPED → STARTED and schedules the first RTCP report.
    pub fn start(&mut self) -> Result<(), Error> {
        match self.run_state {
            RunState::Started => return Ok(()),
            RunState::ShuttingDown => bail!(ErrorInt::SessionShuttingDown),
            RunState::Stopped => {}
        }
        self.run_state = RunState::Started;
        let now = self.clock.now();
        let inputs = self.scheduler_inputs();
        self.scheduler.schedule_next(now, &inputs);
        debug!(
            "session started: ssrc={:08x} pt={}",
            self.state.ssrc(),
            self.parameters.current_payload().id
        );
        Ok(())
    }

    /// Packetizes one access unit into stamped RTP packets (not sent).
    ///
    /// All packets carry the same RTP timestamp (derived from the reference
    /// clock unless `rtp_timestamp` is given) and strictly consecutive
    /// sequence numbers.
    pub fn packetize(
        &mut self,
        samples: &[MediaSample],
        rtp_timestamp: Option<u32>,
    ) -> Result<Vec<RtpPacket>, Error> {
        self.check_running()?;
        let chunks = self
            .packetizer
            .packetize(samples)
            .map_err(|description| wrap!(ErrorInt::PacketizeError { description }))?;
        let (payload_type, clock_rate) = {
            let current = self.parameters.current_payload();
            (current.id, current.clock_rate)
        };
        let timestamp = match rtp_timestamp {
            Some(ts) => ts,
            None => self.state.media_timestamp(self.clock.now(), clock_rate),
        };
        let ssrc = self.state.ssrc();
        let mut packets = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            packets.push(RtpPacket {
                marker: chunk.marker,
                payload_type,
                sequence_number: self.state.next_sequence_number(),
                timestamp,
                ssrc,
                csrcs: SmallVec::new(),
                extension: None,
                payload: chunk.data,
            });
        }
        Ok(packets)
    }

    /// For each sample given to the last [`Session::packetize`] call, the
    /// indices of the packets it contributed to.
    pub fn last_packetization_info(&self) -> &[Vec<usize>] {
        self.packetizer.last_packetization_info()
    }

    /// Hands one packet to the transport, accounting it against the local
    /// member entry and retaining a copy for retransmission.
    pub fn send(&mut self, packet: RtpPacket, subflow_hint: Option<u16>) -> Result<(), Error> {
        self.check_running()?;
        #[allow(unused_mut)]
        let mut packet = packet;
        #[cfg(feature = "mprtp")]
        if let Some(mp) = self.mprtp.as_mut() {
            mp.stamp(&mut packet, subflow_hint.unwrap_or(0));
        }
        let now = self.clock.now();
        self.members.note_sent_rtp(packet.ssrc, now);
        if self.parameters.is_rtx_payload_type(packet.payload_type) {
            self.rtx_packets_sent = self.rtx_packets_sent.wrapping_add(1);
            self.rtx_octets_sent = self.rtx_octets_sent.wrapping_add(packet.payload.len() as u32);
        } else {
            self.packets_sent = self.packets_sent.wrapping_add(1);
            self.octets_sent = self.octets_sent.wrapping_add(packet.payload.len() as u32);
        }
        if let Some(rtx) = self.rtx.as_mut() {
            rtx.store(&packet, now);
        }
        self.transport.send_rtp(packet.serialize(), subflow_hint);
        Ok(())
    }

    /// Packetizes and sends one access unit; returns the packet count.
    pub fn send_media(&mut self, samples: &[MediaSample]) -> Result<usize, Error> {
        let packets = self.packetize(samples, None)?;
        let n = packets.len();
        for packet in packets {
            self.send(packet, None)?;
        }
        Ok(n)
    }

    /// Sends a generic NACK asking the remote sender to retransmit `seqs`.
    pub fn send_nack(&mut self, media_ssrc: u32, seqs: &[u16]) -> Result<(), Error> {
        self.send_feedback(media_ssrc, seqs, false)
    }

    /// Sends the experimental generic ACK naming delivered `seqs`.
    pub fn send_ack(&mut self, media_ssrc: u32, seqs: &[u16]) -> Result<(), Error> {
        self.send_feedback(media_ssrc, seqs, true)
    }

    fn send_feedback(&mut self, media_ssrc: u32, seqs: &[u16], ack: bool) -> Result<(), Error> {
        self.check_running()?;
        if self.parameters.profile() != Profile::Avpf {
            bail!(ErrorInt::InvalidConfiguration {
                description: "feedback requires the AVPF profile".to_owned(),
            });
        }
        if seqs.is_empty() {
            return Ok(());
        }
        let mut w = CompoundWriter::new();
        w.put_receiver_report(self.state.ssrc(), &[]);
        if ack {
            w.put_ack(self.state.ssrc(), media_ssrc, seqs);
        } else {
            w.put_nack(self.state.ssrc(), media_ssrc, seqs);
        }
        let wire = w.finish();
        self.members.note_rtcp_size(wire.len() + rtcp::IP_UDP_OVERHEAD);
        self.transport.send_rtcp(wire);
        Ok(())
    }

    /// Parses and processes one incoming RTP datagram.
    pub fn on_incoming_rtp(&mut self, data: Bytes, ctx: PacketContext) -> Result<(), Error> {
        if self.run_state == RunState::Stopped {
            return Ok(());
        }
        let packet = RtpPacket::parse(data).map_err(|description| {
            wrap!(ErrorInt::MalformedPacket {
                protocol: "RTP",
                ctx,
                description,
            })
        })?;
        if self.parameters.is_rtx_payload_type(packet.payload_type) {
            let rtx = match self.rtx.as_ref() {
                Some(rtx) => rtx,
                None => {
                    debug!("dropping RTX packet: retransmission is not negotiated");
                    return Ok(());
                }
            };
            let mut recovered = rtx.process_rtx(packet).map_err(|description| {
                wrap!(ErrorInt::MalformedPacket {
                    protocol: "RTX",
                    ctx,
                    description,
                })
            })?;
            // Map the retransmission back onto the primary stream. With
            // SSRC multiplexing the association is per-session.
            recovered.packet.payload_type = self
                .parameters
                .rtx()
                .map(|r| r.associated_payload_type)
                .unwrap_or(recovered.packet.payload_type);
            if let Some(primary) = self.primary_remote_ssrc {
                recovered.packet.ssrc = primary;
            }
            trace!(
                "recovered retransmission of seq={}",
                recovered.original_sequence_number
            );
            return self.accept_rtp(recovered.packet, ctx);
        }
        if self.parameters.clock_rate(packet.payload_type).is_none() {
            if let Some(hook) = self.callbacks.on_unknown_payload.as_mut() {
                hook(&packet, &ctx);
                return Ok(());
            }
            bail!(ErrorInt::UnknownPayloadType {
                pt: packet.payload_type,
                ctx,
            });
        }
        self.primary_remote_ssrc = Some(packet.ssrc);
        self.accept_rtp(packet, ctx)
    }

    fn accept_rtp(&mut self, packet: RtpPacket, ctx: PacketContext) -> Result<(), Error> {
        let clock_rate = self
            .parameters
            .clock_rate(packet.payload_type)
            .unwrap_or_else(|| self.parameters.current_payload().clock_rate);
        let observation = self.members.observe_rtp(&packet, clock_rate, &ctx);
        #[cfg(feature = "mprtp")]
        if let Some(mp) = self.mprtp.as_mut() {
            let arrival_rtp = self.state.media_timestamp(ctx.received(), clock_rate);
            mp.observe(&packet, arrival_rtp, ctx.received());
        }
        if let Some(rtx) = self.rtx.as_mut() {
            rtx.note_arrival(observation.extended_sequence_number, ctx.received());
        }
        let received = ReceivedPacket {
            packet,
            ctx,
            extended_sequence_number: observation.extended_sequence_number,
            presentation: observation.presentation,
            source_valid: observation.source_valid,
            rtcp_synchronized: observation.rtcp_synchronized,
        };
        if let Some(cb) = self.callbacks.on_rtp.as_mut() {
            cb(&received);
        }
        self.enqueue_group(received);
        Ok(())
    }

    /// Queues the packet into its source's playout group (keyed by RTP
    /// timestamp) and flushes completed groups to the depacketizer.
    fn enqueue_group(&mut self, received: ReceivedPacket) {
        let ssrc = received.packet.ssrc;
        let marker = received.packet.marker;
        let timestamp = received.packet.timestamp;
        let needs_flush = match self.groups.get(&ssrc) {
            Some(g) => g.timestamp != timestamp && !g.packets.is_empty(),
            None => false,
        };
        if needs_flush {
            self.flush_group(ssrc);
        }
        let group = self.groups.entry(ssrc).or_insert_with(|| PendingGroup {
            timestamp,
            presentation: received.presentation,
            source_valid: received.source_valid,
            rtcp_synchronized: received.rtcp_synchronized,
            has_marker: false,
            packets: Vec::new(),
        });
        group.timestamp = timestamp;
        group.source_valid = received.source_valid;
        group.rtcp_synchronized = received.rtcp_synchronized;
        group.has_marker |= marker;
        group.packets.push(GroupPacket {
            extended_sequence_number: received.extended_sequence_number,
            marker,
            payload: received.packet.payload,
        });
        if group.has_marker && group.is_contiguous() {
            self.flush_group(ssrc);
        }
    }

    fn flush_group(&mut self, ssrc: u32) {
        let mut group = match self.groups.remove(&ssrc) {
            Some(g) if !g.packets.is_empty() => g,
            _ => return,
        };
        group
            .packets
            .sort_unstable_by_key(|p| p.extended_sequence_number);
        group.packets.dedup_by_key(|p| p.extended_sequence_number);
        let packet_group = PacketGroup {
            ssrc,
            timestamp: group.timestamp,
            packets: group.packets,
        };
        match self.depacketizer.depacketize(&packet_group) {
            Ok(samples) => {
                if samples.is_empty() {
                    return;
                }
                if let Some(cb) = self.callbacks.on_samples.as_mut() {
                    cb(SampleBatch {
                        ssrc,
                        timestamp: group.timestamp,
                        presentation: group.presentation,
                        source_valid: group.source_valid,
                        rtcp_synchronized: group.rtcp_synchronized,
                        samples,
                    });
                }
            }
            Err(e) => {
                // Recovered locally: the group is dropped and counted.
                debug!("dropping group ssrc={:08x} ts={}: {}", ssrc, group.timestamp, e);
                self.last_error = Some(wrap!(ErrorInt::DepacketizeError {
                    ssrc,
                    timestamp: group.timestamp,
                    source: e,
                }));
            }
        }
    }

    /// Parses and processes one incoming compound RTCP packet.
    pub fn on_incoming_rtcp(&mut self, data: Bytes, ctx: PacketContext) -> Result<(), Error> {
        if self.run_state == RunState::Stopped {
            return Ok(());
        }
        let summary = self.members.observe_rtcp(&data, &ctx).map_err(|description| {
            warn!("corrupt RTCP compound packet: {}\n{:#?}", description, data.hex_dump());
            wrap!(ErrorInt::MalformedPacket {
                protocol: "RTCP",
                ctx,
                description,
            })
        })?;
        for update in summary.updates {
            if let Some(cb) = self.callbacks.on_member_update.as_mut() {
                cb(update);
            }
        }
        if summary.byes > 0 {
            let members = self.members.active_members();
            self.scheduler.reverse_reconsider(self.clock.now(), members.max(1));
        }
        self.route_feedback(&data);
        if let Some(cb) = self.callbacks.on_rtcp.as_mut() {
            cb(&data, &ctx);
        }
        Ok(())
    }

    /// Routes NACK/ACK feedback naming a local source to the transmission
    /// manager, retransmitting as needed.
    fn route_feedback(&mut self, data: &[u8]) {
        if self.rtx.is_none() {
            return;
        }
        let mut nacks: Vec<u16> = Vec::new();
        let mut acks: Vec<u16> = Vec::new();
        let mut rest = data;
        while !rest.is_empty() {
            let (pkt, after) = match rtcp::Packet::parse(rest) {
                Ok(x) => x,
                Err(_) => return, // already reported by observe_rtcp
            };
            rest = after;
            if let rtcp::Packet::TransportFeedback(fb) = pkt {
                let ours = fb.media_ssrc() == self.state.ssrc()
                    || fb.media_ssrc() == self.state.rtx_ssrc();
                if !ours {
                    continue;
                }
                match fb.fmt() {
                    rtcp::FMT_GENERIC_NACK => nacks.extend(fb.sequence_numbers()),
                    rtcp::FMT_GENERIC_ACK => acks.extend(fb.sequence_numbers()),
                    #[cfg(feature = "mprtp")]
                    rtcp::FMT_EXTENDED_NACK => {
                        if let (Some(mp), Some((flow, fssns))) =
                            (self.mprtp.as_ref(), fb.extended_nack())
                        {
                            for fssn in fssns {
                                if let Some(seq) = mp.lookup_sequence_number(flow, fssn) {
                                    nacks.push(seq);
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        let now = self.clock.now();
        if !acks.is_empty() {
            if let Some(rtx) = self.rtx.as_mut() {
                rtx.ack(&acks, now);
            }
        }
        if !nacks.is_empty() {
            if let Some(rtx) = self.rtx.as_mut() {
                rtx.nack(&nacks, now);
            }
            for seq in nacks {
                let rtx_packet = match self.rtx.as_ref() {
                    Some(rtx) => rtx.make_rtx(&mut self.state, seq),
                    None => None,
                };
                match rtx_packet {
                    Some(packet) => self.send_rtx_now(packet),
                    // Expired: the NACK is silently dropped here.
                    None => trace!("ignoring NACK for expired seq={}", seq),
                }
            }
        }
    }

    fn send_rtx_now(&mut self, packet: RtpPacket) {
        let now = self.clock.now();
        self.members.note_sent_rtp(packet.ssrc, now);
        self.rtx_packets_sent = self.rtx_packets_sent.wrapping_add(1);
        self.rtx_octets_sent = self.rtx_octets_sent.wrapping_add(packet.payload.len() as u32);
        self.transport.send_rtp(packet.serialize(), None);
    }

    /// Builds and sends one compound RTCP report (optionally terminated by
    /// a BYE), per the composition rules of RFC 3550 §6.4.
    fn transmit_report(&mut self, now: Instant, with_bye: bool) {
        let report = self.members.take_report_data(now);
        let blocks = report.sender_blocks;
        let split = blocks.len().min(31);
        let (first, overflow) = blocks.split_at(split);
        let mut w = CompoundWriter::with_capacity(128 + 24 * blocks.len());
        if report.we_sent {
            let clock_rate = self.parameters.current_payload().clock_rate;
            let ntp = self.clock.now_ntp();
            let rtp_timestamp = self.state.media_timestamp(now, clock_rate);
            w.put_sender_report(
                self.state.ssrc(),
                ntp,
                rtp_timestamp,
                self.packets_sent,
                self.octets_sent,
                first,
            );
            // The retransmission stream reports as its own sender.
            if self.rtx.is_some() && self.rtx_packets_sent > 0 {
                w.put_sender_report(
                    self.state.rtx_ssrc(),
                    ntp,
                    rtp_timestamp,
                    self.rtx_packets_sent,
                    self.rtx_octets_sent,
                    &[],
                );
            }
        } else {
            // Always lead with a report packet, even an empty one.
            w.put_receiver_report(self.state.ssrc(), first);
        }
        for chunk in overflow.chunks(31) {
            w.put_receiver_report(self.state.ssrc(), chunk);
        }
        let items = self.parameters.sdes().items();
        w.put_sdes(self.state.ssrc(), &items);
        match self.parameters.xr() {
            XrMode::ReceiverRtt if !report.we_sent => {
                w.put_xr_receiver_reference_time(self.state.ssrc(), self.clock.now_ntp());
            }
            XrMode::Dlrr if report.we_sent && !report.receiver_dlrr.is_empty() => {
                w.put_xr_dlrr(self.state.ssrc(), &report.receiver_dlrr);
            }
            _ => {}
        }
        #[cfg(feature = "mprtp")]
        if let Some(mp) = self.mprtp.as_mut() {
            // Per-subflow reports, in addition to the aggregate.
            for (_, block) in mp.flow_report_blocks(now) {
                w.put_receiver_report(self.state.ssrc(), &[block]);
            }
        }
        if with_bye {
            let mut ssrcs: SmallVec<[u32; 2]> = SmallVec::new();
            ssrcs.push(self.state.ssrc());
            if self.rtx.is_some() && self.rtx_packets_sent > 0 {
                ssrcs.push(self.state.rtx_ssrc());
            }
            w.put_bye(&ssrcs, None);
        }
        let wire = w.finish();
        self.members.note_rtcp_size(wire.len() + rtcp::IP_UDP_OVERHEAD);
        trace!("sending {}-byte compound RTCP (bye={})", wire.len(), with_bye);
        self.transport.send_rtcp(wire);
    }

    fn rtcp_timer_fired(&mut self, now: Instant) {
        let inputs = self.scheduler_inputs();
        match self.scheduler.on_timer(now, &inputs) {
            TimerVerdict::Reschedule(_) => {}
            TimerVerdict::Send => {
                // The member check must run at least once per interval.
                let td = self.scheduler.deterministic_interval(&inputs);
                self.members.sweep(now, td);
                self.transmit_report(now, false);
                let inputs = self.scheduler_inputs();
                self.scheduler.schedule_next(now, &inputs);
            }
        }
    }

    /// Initiates ordered teardown: retransmission state is dropped and the
    /// terminating BYE is sent, immediately for small sessions or after the
    /// §6.3.7 back-off above [`IMMEDIATE_BYE_LIMIT`] members. Idempotent.
    pub fn stop(&mut self) {
        if self.run_state != RunState::Started {
            return;
        }
        self.run_state = RunState::ShuttingDown;
        let now = self.clock.now();
        let ssrcs: Vec<u32> = self.groups.keys().copied().collect();
        for ssrc in ssrcs {
            self.flush_group(ssrc);
        }
        if let Some(rtx) = self.rtx.as_mut() {
            rtx.stop();
        }
        if self.members.active_members() > IMMEDIATE_BYE_LIMIT {
            let delay = self.scheduler.bye_interval(self.members.avg_rtcp_size());
            debug!("large session: sending RTCP BYE after {:?}", delay);
            self.bye_at = Some(now + delay);
        } else {
            self.finish_bye(now);
        }
    }

    fn finish_bye(&mut self, now: Instant) {
        debug!("shutting down, generating RTCP BYE");
        self.transmit_report(now, true);
        self.transport.shutdown();
        self.bye_at = None;
        self.run_state = RunState::Stopped;
    }

    /// Discards per-run state and picks a fresh identity, returning the
    /// session to STOPPED so it can be started again.
    pub fn reset(&mut self) {
        let now = self.clock.now();
        self.state = SessionState::new(&*self.clock);
        let mut local_ssrcs: SmallVec<[u32; 2]> = SmallVec::new();
        local_ssrcs.push(self.state.ssrc());
        if self.rtx.is_some() {
            local_ssrcs.push(self.state.rtx_ssrc());
        }
        self.members = MemberDb::new(
            &local_ssrcs,
            self.parameters.sdes().cname.len(),
            self.parameters.xr() != XrMode::None,
            now,
        );
        self.scheduler = RtcpScheduler::new(
            now,
            self.parameters.bandwidth_kbps(),
            self.parameters.reduced_minimum_rtcp,
        );
        if let Some(rtx) = self.rtx.as_mut() {
            rtx.stop();
        }
        self.groups.clear();
        self.primary_remote_ssrc = None;
        self.bye_at = None;
        self.packets_sent = 0;
        self.octets_sent = 0;
        self.rtx_packets_sent = 0;
        self.rtx_octets_sent = 0;
        self.run_state = RunState::Stopped;
    }

    fn next_deadline(&self) -> Instant {
        let mut deadline = match self.run_state {
            RunState::Started => self.scheduler.next_deadline(),
            _ => self.clock.now() + Duration::from_secs(3600),
        };
        if let Some(bye) = self.bye_at {
            deadline = deadline.min(bye);
        }
        if let Some(rtx) = &self.rtx {
            if let Some(eviction) = rtx.next_eviction() {
                deadline = deadline.min(eviction);
            }
        }
        deadline
    }

    fn on_deadline(&mut self) {
        let now = self.clock.now();
        if let Some(rtx) = self.rtx.as_mut() {
            rtx.evict_expired(now);
        }
        if let Some(bye) = self.bye_at {
            if now >= bye {
                self.finish_bye(now);
                return;
            }
        }
        if self.run_state == RunState::Started && now >= self.scheduler.next_deadline() {
            self.rtcp_timer_fired(now);
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Rtp { data, ctx } => {
                if let Err(e) = self.on_incoming_rtp(data, ctx) {
                    debug!("{}", e);
                    self.last_error = Some(e);
                }
            }
            TransportEvent::Rtcp { data, ctx } => {
                if let Err(e) = self.on_incoming_rtcp(data, ctx) {
                    debug!("{}", e);
                    self.last_error = Some(e);
                }
            }
            TransportEvent::SendFailed {
                channel,
                description,
            } => {
                let e = wrap!(ErrorInt::TransportFailure {
                    channel,
                    description,
                });
                if let Some(cb) = self.callbacks.on_transport_error.as_mut() {
                    cb(&e);
                }
                self.last_error = Some(e);
            }
            TransportEvent::Closed => self.stop(),
        }
    }

    /// Drives the session until it stops: inbound events interleave with
    /// the RTCP, BYE, and RTX-eviction timers on this one task.
    pub async fn run(&mut self) -> Result<(), Error> {
        self.start()?;
        let mut events = match self.events_rx.take() {
            Some(rx) => rx,
            None => bail!(ErrorInt::InvalidConfiguration {
                description: "session is already being driven".to_owned(),
            }),
        };
        loop {
            if self.run_state == RunState::Stopped {
                break;
            }
            let deadline = tokio::time::Instant::from_std(self.next_deadline());
            tokio::select! {
                biased;
                event = events.recv() => match event {
                    Some(event) => self.handle_transport_event(event),
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline) => self.on_deadline(),
            }
        }
        self.events_rx = Some(events);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DepacketizeError;
    use crate::session::clock::ManualClock;
    use crate::session::parameters::{
        EndpointPair, RtxParameters, RtxPolicy, SdesInfo,
    };
    use std::sync::Mutex;

    const A_SSRC: u32 = 0xAAAA_0001;
    const A_RTX_SSRC: u32 = 0xAAAA_0002;
    const B_SSRC: u32 = 0xBBBB_0001;

    #[derive(Clone, Default)]
    struct Captured {
        rtp: Arc<Mutex<Vec<Bytes>>>,
        rtcp: Arc<Mutex<Vec<Bytes>>>,
        shutdowns: Arc<Mutex<u32>>,
    }

    struct CapturingTransport(Captured);

    impl PacketTransport for CapturingTransport {
        fn send_rtp(&mut self, packet: Bytes, _subflow_hint: Option<u16>) {
            self.0.rtp.lock().unwrap().push(packet);
        }
        fn send_rtcp(&mut self, packet: Bytes) {
            self.0.rtcp.lock().unwrap().push(packet);
        }
        fn shutdown(&mut self) {
            *self.0.shutdowns.lock().unwrap() += 1;
        }
    }

    fn endpoints() -> (EndpointPair, EndpointPair) {
        (
            EndpointPair {
                rtp: "127.0.0.1:5000".parse().unwrap(),
                rtcp: "127.0.0.1:5001".parse().unwrap(),
            },
            EndpointPair {
                rtp: "127.0.0.1:6000".parse().unwrap(),
                rtcp: "127.0.0.1:6001".parse().unwrap(),
            },
        )
    }

    fn params(rtx: bool) -> SessionParameters {
        let (local, remote) = endpoints();
        let mut b = SessionParameters::builder()
            .add_payload_type(96, "h264", 90_000)
            .add_endpoints(local, remote)
            .bandwidth_kbps(1024)
            .sdes(SdesInfo::new("session@test"));
        if rtx {
            b = b.profile(Profile::Avpf).rtx(RtxParameters {
                payload_type: 97,
                associated_payload_type: 96,
                policy: RtxPolicy::NackTimed {
                    window: Duration::from_millis(3000),
                },
            });
        }
        b.build().unwrap()
    }

    fn session(
        ssrc: u32,
        rtx_ssrc: u32,
        start_seq: u16,
        rtx: bool,
        clock: &Arc<ManualClock>,
        callbacks: SessionCallbacks,
    ) -> (Session, Captured) {
        let captured = Captured::default();
        let transport = Box::new(CapturingTransport(captured.clone()));
        let clock2: Arc<dyn ReferenceClock> = clock.clone();
        let state = SessionState::with_identity(ssrc, rtx_ssrc, start_seq, &**clock);
        let session =
            Session::with_state(params(rtx), transport, clock2, callbacks, state).unwrap();
        (session, captured)
    }

    fn nal(size: usize, ty: u8, marker: bool) -> MediaSample {
        let mut data = vec![ty];
        data.extend((1..size).map(|i| (i % 255) as u8));
        MediaSample {
            data: Bytes::from(data),
            marker,
            decoding_order: None,
        }
    }

    fn ctx(clock: &ManualClock) -> PacketContext {
        PacketContext::at(clock.now(), clock.now_wall())
    }

    #[test]
    fn packetize_stamps_uniform_timestamp_and_consecutive_seqs() {
        let clock = Arc::new(ManualClock::new());
        let (mut s, _) = session(A_SSRC, A_RTX_SSRC, 1000, false, &clock, Default::default());
        s.start().unwrap();
        let au = [nal(4000, 0x65, false), nal(20, 0x61, true)];
        let packets = s.packetize(&au, None).unwrap();
        assert!(packets.len() >= 4);
        let ts = packets[0].timestamp;
        for (i, p) in packets.iter().enumerate() {
            assert_eq!(p.timestamp, ts);
            assert_eq!(p.ssrc, A_SSRC);
            assert_eq!(p.payload_type, 96);
            assert_eq!(p.sequence_number, 1000u16.wrapping_add(i as u16));
        }
        assert!(packets.last().unwrap().marker);
        // The packetization info names every produced packet exactly once.
        let info = s.last_packetization_info();
        assert_eq!(info.len(), 2);
        let mut all: Vec<usize> = info.iter().flatten().copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..packets.len()).collect::<Vec<_>>());
    }

    #[test]
    fn loopback_round_trip_delivers_samples() {
        let clock = Arc::new(ManualClock::new());
        let batches: Arc<Mutex<Vec<SampleBatch>>> = Arc::new(Mutex::new(Vec::new()));
        let batches2 = batches.clone();
        let callbacks = SessionCallbacks {
            on_samples: Some(Box::new(move |batch| batches2.lock().unwrap().push(batch))),
            ..Default::default()
        };
        let (mut a, a_out) = session(A_SSRC, A_RTX_SSRC, 5000, false, &clock, Default::default());
        let (mut b, _) = session(B_SSRC, 0, 1, false, &clock, callbacks);
        a.start().unwrap();
        b.start().unwrap();

        let au = [nal(4000, 0x65, false), nal(24, 0x61, true)];
        a.send_media(&au).unwrap();
        for wire in a_out.rtp.lock().unwrap().drain(..) {
            b.on_incoming_rtp(wire, ctx(&clock)).unwrap();
        }
        let batches = batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        let batch = &batches[0];
        assert_eq!(batch.ssrc, A_SSRC);
        assert_eq!(batch.samples.len(), 2);
        assert_eq!(batch.samples[0].data, au[0].data);
        assert_eq!(batch.samples[1].data, au[1].data);
        assert!(batch.source_valid); // enough packets to clear probation
    }

    #[test]
    fn nack_triggers_ssrc_multiplexed_rtx() {
        let clock = Arc::new(ManualClock::new());
        let (mut a, a_out) = session(A_SSRC, A_RTX_SSRC, 1000, true, &clock, Default::default());
        a.start().unwrap();
        a.send_media(&[MediaSample {
            data: Bytes::from_static(&[0x65, b'A', b'B', b'C']),
            marker: true,
            decoding_order: None,
        }])
        .unwrap();
        assert_eq!(a_out.rtp.lock().unwrap().len(), 1);

        clock.advance(Duration::from_millis(500));
        let mut w = CompoundWriter::new();
        w.put_receiver_report(B_SSRC, &[]);
        w.put_nack(B_SSRC, A_SSRC, &[1000]);
        a.on_incoming_rtcp(w.finish(), ctx(&clock)).unwrap();

        let sent = a_out.rtp.lock().unwrap();
        assert_eq!(sent.len(), 2);
        let rtx = RtpPacket::parse(sent[1].clone()).unwrap();
        assert_eq!(rtx.payload_type, 97);
        assert_eq!(rtx.ssrc, A_RTX_SSRC);
        assert_eq!(rtx.sequence_number, 0);
        assert_eq!(&rtx.payload[..], &[0x03, 0xE8, 0x65, b'A', b'B', b'C']);
        let original = RtpPacket::parse(sent[0].clone()).unwrap();
        assert_eq!(rtx.timestamp, original.timestamp);
    }

    #[test]
    fn expired_rtx_window_drops_nack_silently() {
        let clock = Arc::new(ManualClock::new());
        let (mut a, a_out) = session(A_SSRC, A_RTX_SSRC, 1000, true, &clock, Default::default());
        a.start().unwrap();
        a.send_media(&[nal(100, 0x65, true)]).unwrap();

        clock.advance(Duration::from_millis(3001));
        a.on_deadline(); // drains the eviction timer

        let mut w = CompoundWriter::new();
        w.put_receiver_report(B_SSRC, &[]);
        w.put_nack(B_SSRC, A_SSRC, &[1000]);
        a.on_incoming_rtcp(w.finish(), ctx(&clock)).unwrap();
        assert_eq!(a_out.rtp.lock().unwrap().len(), 1); // no retransmission
    }

    #[test]
    fn sender_report_composition() {
        let clock = Arc::new(ManualClock::new());
        let (mut a, a_out) = session(A_SSRC, A_RTX_SSRC, 0, true, &clock, Default::default());
        a.start().unwrap();
        a.send_media(&[nal(50, 0x65, true)]).unwrap();

        // Force a retransmission so the RTX stream is a sender too.
        let mut w = CompoundWriter::new();
        w.put_receiver_report(B_SSRC, &[]);
        w.put_nack(B_SSRC, A_SSRC, &[0]);
        a.on_incoming_rtcp(w.finish(), ctx(&clock)).unwrap();

        let now = clock.now();
        a.transmit_report(now, false);
        let rtcp = a_out.rtcp.lock().unwrap();
        let data = rtcp.last().unwrap();
        let (pkt, rest) = rtcp::Packet::parse(data).unwrap();
        let sr = match pkt {
            rtcp::Packet::SenderReport(sr) => sr,
            o => panic!("expected SR first, got {:?}", o),
        };
        assert_eq!(sr.ssrc(), A_SSRC);
        assert_eq!(sr.sender_packet_count(), 1);
        let (pkt, rest) = rtcp::Packet::parse(rest).unwrap();
        let rtx_sr = match pkt {
            rtcp::Packet::SenderReport(sr) => sr,
            o => panic!("expected RTX SR second, got {:?}", o),
        };
        assert_eq!(rtx_sr.ssrc(), A_RTX_SSRC);
        assert_eq!(rtx_sr.sender_packet_count(), 1);
        let (pkt, _) = rtcp::Packet::parse(rest).unwrap();
        let sdes = match pkt {
            rtcp::Packet::SourceDescription(s) => s,
            o => panic!("expected SDES, got {:?}", o),
        };
        let chunk = sdes.chunks().next().unwrap();
        assert_eq!(chunk.cname(), Some(&b"session@test"[..]));
    }

    #[test]
    fn receiver_report_when_not_a_sender() {
        let clock = Arc::new(ManualClock::new());
        let (mut b, b_out) = session(B_SSRC, 0, 0, false, &clock, Default::default());
        b.start().unwrap();
        let now = clock.now();
        b.transmit_report(now, false);
        let rtcp = b_out.rtcp.lock().unwrap();
        let (pkt, _) = rtcp::Packet::parse(rtcp.last().unwrap()).unwrap();
        assert!(matches!(pkt, rtcp::Packet::ReceiverReport(_)));
    }

    #[test]
    fn stop_sends_bye_and_rejects_further_calls() {
        let clock = Arc::new(ManualClock::new());
        let (mut a, a_out) = session(A_SSRC, A_RTX_SSRC, 0, false, &clock, Default::default());
        a.start().unwrap();
        a.send_media(&[nal(50, 0x65, true)]).unwrap();
        a.stop();
        a.stop(); // idempotent

        assert_eq!(*a_out.shutdowns.lock().unwrap(), 1);
        let rtcp = a_out.rtcp.lock().unwrap();
        assert_eq!(rtcp.len(), 1);
        let mut found_bye = false;
        let mut rest = &rtcp[0][..];
        while !rest.is_empty() {
            let (pkt, after) = rtcp::Packet::parse(rest).unwrap();
            if let rtcp::Packet::Bye(bye) = pkt {
                assert_eq!(bye.ssrcs().collect::<Vec<_>>(), vec![A_SSRC]);
                found_bye = true;
            }
            rest = after;
        }
        assert!(found_bye);

        let err = a.send_media(&[nal(10, 0x61, true)]).unwrap_err();
        assert!(err.is_shutdown());
    }

    #[test]
    fn unknown_payload_goes_to_hook_or_errors() {
        let clock = Arc::new(ManualClock::new());
        let seen: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let callbacks = SessionCallbacks {
            on_unknown_payload: Some(Box::new(move |pkt, _| {
                seen2.lock().unwrap().push(pkt.payload_type)
            })),
            ..Default::default()
        };
        let (mut b, _) = session(B_SSRC, 0, 0, false, &clock, callbacks);
        b.start().unwrap();
        let odd = RtpPacket {
            marker: false,
            payload_type: 111,
            sequence_number: 5,
            timestamp: 0,
            ssrc: 0x7777,
            csrcs: SmallVec::new(),
            extension: None,
            payload: Bytes::from_static(b"x"),
        };
        b.on_incoming_rtp(odd.serialize(), ctx(&clock)).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![111]);

        // Without the hook, the packet is rejected.
        let (mut c, _) = session(0xCCCC_0001, 0, 0, false, &clock, Default::default());
        c.start().unwrap();
        assert!(c.on_incoming_rtp(odd.serialize(), ctx(&clock)).is_err());
    }

    #[test]
    fn malformed_rtp_reports_error_without_member_entry() {
        let clock = Arc::new(ManualClock::new());
        let (mut b, _) = session(B_SSRC, 0, 0, false, &clock, Default::default());
        b.start().unwrap();
        let err = b
            .on_incoming_rtp(Bytes::from_static(&[0x10, 0x00, 0x01]), ctx(&clock))
            .unwrap_err();
        assert!(format!("{}", err).contains("RTP"));
    }

    #[test]
    fn depacketize_gap_is_recovered_locally() {
        let clock = Arc::new(ManualClock::new());
        let (mut a, a_out) = session(A_SSRC, A_RTX_SSRC, 100, false, &clock, Default::default());
        let batches: Arc<Mutex<Vec<SampleBatch>>> = Arc::new(Mutex::new(Vec::new()));
        let batches2 = batches.clone();
        let callbacks = SessionCallbacks {
            on_samples: Some(Box::new(move |batch| batches2.lock().unwrap().push(batch))),
            ..Default::default()
        };
        let (mut b, _) = session(B_SSRC, 0, 0, false, &clock, callbacks);
        a.start().unwrap();
        b.start().unwrap();
        a.send_media(&[nal(4000, 0x65, true)]).unwrap();
        let wires: Vec<Bytes> = a_out.rtp.lock().unwrap().drain(..).collect();
        assert!(wires.len() >= 3);
        for (i, wire) in wires.iter().enumerate() {
            if i == 1 {
                continue; // drop a middle fragment
            }
            b.on_incoming_rtp(wire.clone(), ctx(&clock)).unwrap();
        }
        // The damaged group is held back (a retransmission could still fill
        // it); the next access unit forces it out and surfaces the gap.
        assert!(batches.lock().unwrap().is_empty());
        clock.advance(Duration::from_millis(40));
        let small = nal(20, 0x61, true);
        a.send_media(&[small.clone()]).unwrap();
        for wire in a_out.rtp.lock().unwrap().drain(..) {
            b.on_incoming_rtp(wire, ctx(&clock)).unwrap();
        }
        let batches = batches.lock().unwrap();
        assert_eq!(batches.len(), 1); // only the intact access unit
        assert_eq!(batches[0].samples[0].data, small.data);
        let err = b.last_error().expect("gap recorded");
        assert!(matches!(
            &*err.0,
            ErrorInt::DepacketizeError {
                source: DepacketizeError::GapInFragmentation { .. },
                ..
            }
        ));
    }

    #[test]
    fn bye_from_remote_triggers_reverse_reconsideration() {
        let clock = Arc::new(ManualClock::new());
        let (mut b, _) = session(B_SSRC, 0, 0, false, &clock, Default::default());
        b.start().unwrap();
        // Two remote members join via RTCP.
        for ssrc in [0x1001u32, 0x1002] {
            let mut w = CompoundWriter::new();
            w.put_receiver_report(ssrc, &[]);
            w.put_sdes(ssrc, &[(rtcp::SDES_CNAME, "m@x")]);
            b.on_incoming_rtcp(w.finish(), ctx(&clock)).unwrap();
        }
        let before = b.scheduler.next_deadline();
        // One leaves; the next report moves earlier (or stays, never later).
        let mut w = CompoundWriter::new();
        w.put_receiver_report(0x1001, &[]);
        w.put_bye(&[0x1001], None);
        b.on_incoming_rtcp(w.finish(), ctx(&clock)).unwrap();
        assert!(b.scheduler.next_deadline() <= before);
    }

    #[test]
    fn send_nack_produces_parseable_feedback() {
        let clock = Arc::new(ManualClock::new());
        let (mut a, a_out) = session(A_SSRC, A_RTX_SSRC, 0, true, &clock, Default::default());
        a.start().unwrap();
        a.send_nack(0x9999, &[55, 56, 60]).unwrap();
        let rtcp = a_out.rtcp.lock().unwrap();
        let (pkt, rest) = rtcp::Packet::parse(rtcp.last().unwrap()).unwrap();
        assert!(matches!(pkt, rtcp::Packet::ReceiverReport(_)));
        let (pkt, _) = rtcp::Packet::parse(rest).unwrap();
        let fb = match pkt {
            rtcp::Packet::TransportFeedback(fb) => fb,
            o => panic!("expected feedback, got {:?}", o),
        };
        assert_eq!(fb.fmt(), rtcp::FMT_GENERIC_NACK);
        assert_eq!(fb.media_ssrc(), 0x9999);
        assert_eq!(fb.sequence_numbers(), vec![55, 56, 60]);
    }

    #[tokio::test]
    async fn run_drains_events_and_exits_on_close() {
        let clock = Arc::new(ManualClock::new());
        let batches: Arc<Mutex<Vec<SampleBatch>>> = Arc::new(Mutex::new(Vec::new()));
        let batches2 = batches.clone();
        let callbacks = SessionCallbacks {
            on_samples: Some(Box::new(move |batch| batches2.lock().unwrap().push(batch))),
            ..Default::default()
        };
        let (mut a, a_out) = session(A_SSRC, A_RTX_SSRC, 0, false, &clock, Default::default());
        let (mut b, b_out) = session(B_SSRC, 0, 0, false, &clock, callbacks);
        a.start().unwrap();
        a.send_media(&[nal(100, 0x65, true)]).unwrap();

        let handle = b.handle();
        for wire in a_out.rtp.lock().unwrap().drain(..) {
            handle.incoming_rtp(wire, ctx(&clock));
        }
        handle.closed();
        b.run().await.unwrap();

        assert_eq!(batches.lock().unwrap().len(), 1);
        assert_eq!(*b_out.shutdowns.lock().unwrap(), 1); // BYE path ran
    }

    #[test]
    fn recovered_rtx_completes_group() {
        let clock = Arc::new(ManualClock::new());
        let batches: Arc<Mutex<Vec<SampleBatch>>> = Arc::new(Mutex::new(Vec::new()));
        let batches2 = batches.clone();
        let callbacks = SessionCallbacks {
            on_samples: Some(Box::new(move |batch| batches2.lock().unwrap().push(batch))),
            ..Default::default()
        };
        let (mut a, a_out) = session(A_SSRC, A_RTX_SSRC, 100, true, &clock, Default::default());
        let (mut b, _) = session(B_SSRC, 0xBBBB_0002, 0, true, &clock, callbacks);
        a.start().unwrap();
        b.start().unwrap();
        let sample = nal(4000, 0x65, true);
        a.send_media(&[sample.clone()]).unwrap();
        let wires: Vec<Bytes> = a_out.rtp.lock().unwrap().drain(..).collect();

        // Deliver all but the middle fragment, then its retransmission.
        for (i, wire) in wires.iter().enumerate() {
            if i != 1 {
                b.on_incoming_rtp(wire.clone(), ctx(&clock)).unwrap();
            }
        }
        let mut w = CompoundWriter::new();
        w.put_receiver_report(B_SSRC, &[]);
        w.put_nack(B_SSRC, A_SSRC, &[101]);
        a.on_incoming_rtcp(w.finish(), ctx(&clock)).unwrap();
        // The marker fragment arrived with a gap, so the group was held;
        // the recovered fragment completes it and flushes immediately.
        assert!(batches.lock().unwrap().is_empty());
        let rtx_wire = a_out.rtp.lock().unwrap().last().unwrap().clone();
        b.on_incoming_rtp(rtx_wire, ctx(&clock)).unwrap();

        let batches = batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].samples.len(), 1);
        assert_eq!(batches[0].samples[0].data, sample.data);
    }
}
