//! The FSP Lower-Layer Service: a single `stakker` actor (mirroring the donor's one-actor-per-
//! process `Wireguard` shape) owning the Lower Interface, the Socket Table, and the ALFID/cookie
//! state, with per-connection logic living in plain `SocketItem` structs manipulated through
//! `cx: CX![Fsp]` rather than as separate actors (§2, §5).

pub mod alfid;
pub mod command;
pub mod cookie;
pub mod error;
pub mod icc;
pub mod lower;
pub mod mobility;
pub mod notice;
pub mod packet;
pub mod scb;
#[cfg(test)]
mod scenarios;
pub mod timers;
pub mod tlb;
pub mod window;

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use log::{trace, warn};
use stakker::{Fwd, Instant as StakkerInstant, CX};
use utils::bytes;

use crate::alfid::FiberIdPair;
use crate::command::{dispatch, multiply_context, Command, Emit};
use crate::error::Error;
use crate::icc::{derive_next_key, AeadKey, IccContext};
use crate::lower::LowerInterface;
use crate::notice::Notice;
use crate::packet::{ConnectParam, GapDescriptor, Header, Opcode, PeerSubnets, SelectiveNackHeader, CURRENT_VERSION};
use crate::scb::{ConnectParams, MultiplyHandshake, SocketItem, SocketState};
use crate::tlb::{RemoteTuple, Tlb};
use crate::window::GapRun;

/// How often the reactor drains the Lower Interface's sockets. The donor's `Io` wrapper gets
/// this for free from the OS poll loop; since `LowerInterface` keeps its own sockets (see
/// `lower.rs`'s module doc), this implementation re-arms itself on a short repeating timer
/// instead.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How often the mobility sweep re-enumerates local OS addresses and compares them against the
/// Lower Interface's bound set (§4.8). Coarser than `POLL_INTERVAL` since interface changes are
/// rare compared to packet arrival.
const MOBILITY_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Size, in bytes, of the UDP/IPv4 tunnel framing prefix carrying `(sourceALFID, peerALFID)`
/// ahead of the fixed header (§6).
const FRAME_PREFIX_LEN: usize = 8;

const HEADER_LEN: usize = core::mem::size_of::<Header>();

/// Bytes of the fixed header that authenticate as ICC additional data: everything but the
/// trailing `integrity` field itself, which the ICC computes last (§4.1, §4.5).
const HEADER_AAD_LEN: usize = HEADER_LEN - 8;

pub struct Fsp {
	lower: LowerInterface,
	tlb: Tlb,
	notice: Fwd<Notice>,
	start: StakkerInstant,
	/// The port every configured local address binds to, reused to build mobility-sweep
	/// candidate addresses from freshly enumerated interfaces (§4.8).
	port: u16,
}

impl Fsp {
	pub fn init(cx: CX![], locals: Vec<SocketAddr>, alfid_pool_capacity: usize, notice: Fwd<Notice>) -> Option<Self> {
		let port = locals.first().map(|a| a.port()).unwrap_or(0);
		let lower = LowerInterface::bind(&locals, 0)
			.map_err(|e| warn!("Failed to bind Lower Interface: {e}"))
			.ok()?;

		let this = Self { lower, tlb: Tlb::new(alfid_pool_capacity), notice, start: cx.now(), port };

		let actor = cx.access_actor().clone();
		cx.after(POLL_INTERVAL, move |s| actor.apply(s, |this, cx| this.poll_tick(cx)));

		let actor = cx.access_actor().clone();
		cx.after(MOBILITY_POLL_INTERVAL, move |s| actor.apply(s, |this, cx| this.mobility_tick(cx)));

		Some(this)
	}

	fn now_us(&self, cx: CX![]) -> i64 {
		cx.now().saturating_duration_since(self.start).as_micros() as i64
	}

	/// Drain the Lower Interface and dispatch every inbound datagram, then re-arm (§4.2).
	fn poll_tick(&mut self, cx: CX![]) {
		for inbound in self.lower.poll_recv() {
			self.read_bytes(cx, inbound.local, inbound.remote, &inbound.data);
		}

		self.lower.cookies.maybe_rotate(self.now_us(cx));

		let actor = cx.access_actor().clone();
		cx.after(POLL_INTERVAL, move |s| actor.apply(s, |this, cx| this.poll_tick(cx)));
	}

	/// Re-enumerate local OS addresses and, if the set changed, reconcile the Lower Interface's
	/// bound sockets and nudge every live socket with a `KEEP_ALIVE` to re-validate its peer
	/// address from whichever new local address the reply arrives on (§4.8).
	fn mobility_tick(&mut self, cx: CX![]) {
		if let Some(current) = crate::mobility::local_addresses(self.port) {
			match self.lower.reconcile_addresses(&current) {
				Ok(true) => {
					for alfid in self.tlb.live_alfids() {
						self.emit(alfid, Emit::KeepAlive);
					}
				}
				Ok(false) => {}
				Err(e) => warn!("Mobility reconciliation failed: {e}"),
			}
		}

		let actor = cx.access_actor().clone();
		cx.after(MOBILITY_POLL_INTERVAL, move |s| actor.apply(s, |this, cx| this.mobility_tick(cx)));
	}

	/// Parse and dispatch one already-read datagram. Exposed so integration tests can drive two
	/// in-memory Socket Items without a real socket (§8).
	pub fn read_bytes(&mut self, cx: CX![], local: SocketAddr, remote: SocketAddr, data: &[u8]) {
		if data.len() < FRAME_PREFIX_LEN + HEADER_LEN {
			return trace!("Packet too short from {remote}");
		}

		let sender_alfid = u32::from_be_bytes(data[0..4].try_into().unwrap());
		let local_alfid = u32::from_be_bytes(data[4..8].try_into().unwrap());

		let header_bytes = &data[FRAME_PREFIX_LEN..FRAME_PREFIX_LEN + HEADER_LEN];
		let header: &Header = bytes::cast(header_bytes);

		if header.version != CURRENT_VERSION {
			return trace!("Unsupported version from {remote}");
		}

		let Some(opcode) = Opcode::from_u8(header.opcode) else {
			return trace!("Unknown opcode from {remote}");
		};

		let hsp = header.hsp.get() as usize;
		let payload_start = FRAME_PREFIX_LEN + hsp.max(HEADER_LEN);
		let payload = data.get(payload_start..).unwrap_or_default();
		let aad = &header_bytes[..HEADER_AAD_LEN];
		let mut tag = [0u8; 8];
		tag.copy_from_slice(&header.integrity.get().to_be_bytes());

		match opcode {
			Opcode::InitConnect => self.on_init_connect(remote, sender_alfid, local_alfid, header_bytes),
			Opcode::ConnectRequest => self.on_connect_request(cx, remote, sender_alfid, local_alfid, header, payload),
			Opcode::AckInitConnect => self.on_ack_init_connect(local_alfid, payload),
			Opcode::AckConnectReq => self.on_ack_connect_req(local_alfid, payload),
			Opcode::Reset => self.on_reset(local_alfid),
			Opcode::PureData => self.on_pure_data(remote, local_alfid, header, aad, payload, &tag),
			Opcode::KeepAlive => self.on_keep_alive(remote, local_alfid, header, aad, payload, &tag),
			Opcode::AckFlush => self.on_ack_flush(local_alfid),
			Opcode::Release => self.on_release(local_alfid),
			Opcode::Multiply => self.on_multiply(cx, remote, sender_alfid, local_alfid, header, aad, payload, &tag),
			Opcode::Persist => self.on_multiply_reply(local_alfid, remote, sender_alfid, header, aad, payload, &tag, false),
			Opcode::NulCommit => self.on_multiply_reply(local_alfid, remote, sender_alfid, header, aad, payload, &tag, true),
		}

		let _ = local;
	}

	/// `INIT_CONNECT` is stateless: reply `ACK_INIT_CONNECT` with a fresh cookie, allocating no
	/// Socket Item (§4.2, §4.3 — the cookie defense of end-to-end scenario 4).
	fn on_init_connect(&mut self, remote: SocketAddr, sender_alfid: u32, local_alfid: u32, header_bytes: &[u8]) {
		let pair = FiberIdPair { source: local_alfid, peer: sender_alfid };
		let cookie = self.lower.cookies.generate(pair, header_bytes);

		let mut buf = frame_prefix(local_alfid, sender_alfid);
		buf.extend_from_slice(header_bytes);
		buf.extend_from_slice(&cookie);

		if let Err(e) = self.lower.send(remote, &buf) {
			warn!("Failed to send ACK_INIT_CONNECT to {remote}: {e}");
		}
	}

	/// Responder side of `CONNECT_REQUEST` (§4.3): validate the echoed cookie statelessly, then
	/// allocate a Socket Item in `CHALLENGING`. A replay within the cookie window is idempotent,
	/// since the remote tuple already resolves to the allocated item.
	fn on_connect_request(&mut self, cx: CX![], remote: SocketAddr, sender_alfid: u32, local_alfid: u32, header: &Header, payload: &[u8]) {
		let Some(param) = parse_connect_param(payload) else {
			return trace!("CONNECT_REQUEST from {remote} missing CONNECT_PARAM sub-header");
		};

		let cookie = param.cookie;
		let peer_subnets = param.subnets.prefixes.map(|p| p.get());

		let pair = FiberIdPair { source: local_alfid, peer: sender_alfid };
		let now_us = self.now_us(cx);
		let header_bytes = bytes::as_slice(header);

		if !self.lower.cookies.verify(pair, header_bytes, &cookie, now_us) {
			return trace!("Rejected CONNECT_REQUEST from {remote}: cookie failed verification");
		}

		let tuple = RemoteTuple { remote_host: remote, remote_alfid: sender_alfid, parent_alfid: 0 };

		if self.tlb.find_by_remote(&tuple).is_some() {
			return;
		}

		let new_alfid = self.tlb.allocate_alfid();
		let sn = header.sequence_no.get();
		let item = SocketItem::new(new_alfid, sender_alfid, 0, remote, sn.wrapping_add(1), sn, self.notice.clone());

		if self.tlb.insert(item, Some(tuple)).is_err() {
			return warn!("Socket Table full; rejecting CONNECT_REQUEST from {remote}");
		}

		if let Some(item) = self.tlb.find_by_alfid_mut(new_alfid) {
			item.begin_challenge(ConnectParams { timestamp_us: now_us, cookie, allowed_prefixes: peer_subnets, ..Default::default() });
			let keepalive_ms = item.rtt.keepalive_ms;
			item.timers.arm(cx, keepalive_ms);
		}
	}

	fn on_ack_init_connect(&mut self, local_alfid: u32, payload: &[u8]) {
		if payload.len() < 8 {
			return trace!("ACK_INIT_CONNECT missing cookie");
		}

		let mut cookie = [0u8; 8];
		cookie.copy_from_slice(&payload[..8]);

		if let Some(item) = self.tlb.find_by_alfid_mut(local_alfid) {
			item.timers.note_recv(std::time::Instant::now());
			let _ = item.on_ack_init_connect(cookie);
		}
	}

	fn on_ack_connect_req(&mut self, local_alfid: u32, payload: &[u8]) {
		let allowed_prefixes = parse_connect_param(payload).map(|param| param.subnets.prefixes.map(|p| p.get())).unwrap_or([0; 4]);

		if let Some(item) = self.tlb.find_by_alfid_mut(local_alfid) {
			item.timers.note_recv(std::time::Instant::now());
			let _ = item.on_ack_connect_req(allowed_prefixes);
		}
	}

	fn on_reset(&mut self, local_alfid: u32) {
		if let Some(item) = self.tlb.find_by_alfid_mut(local_alfid) {
			item.on_reset();
		}
	}

	fn on_pure_data(&mut self, remote: SocketAddr, local_alfid: u32, header: &Header, aad: &[u8], payload: &[u8], tag: &[u8; 8]) {
		let now = std::time::Instant::now();
		let Some(item) = self.tlb.find_by_alfid_mut(local_alfid) else { return };

		let sn = header.sequence_no.get();
		let mut body = payload.to_vec();

		if item.icc.open(sn, header.expected_sn.get(), aad, &mut body, tag).is_err() {
			return trace!("ICC validation failed for PURE_DATA from {remote}");
		}

		item.addresses.note_validated_source(remote);
		item.timers.note_recv(now);

		let eot = header.end_of_transaction();
		item.recv.place(sn, Opcode::PureData, body, eot, now);

		if eot {
			item.on_peer_commit();
		}

		if !item.recv.drain_ready().is_empty() {
			let _ = item.notice.fwd(Notice::DataReady);
		}
	}

	fn on_keep_alive(&mut self, remote: SocketAddr, local_alfid: u32, header: &Header, aad: &[u8], payload: &[u8], tag: &[u8; 8]) {
		let now = std::time::Instant::now();
		let Some(item) = self.tlb.find_by_alfid_mut(local_alfid) else { return };

		let sn = header.sequence_no.get();
		let mut body = payload.to_vec();

		if item.icc.open(sn, header.expected_sn.get(), aad, &mut body, tag).is_err() {
			return trace!("ICC validation failed for KEEP_ALIVE from {remote}");
		}

		let Some((expected_sn, gaps)) = parse_snack(&body) else {
			return trace!("Malformed SELECTIVE_NACK in KEEP_ALIVE from {remote}");
		};

		let resend_after = Duration::from_millis((item.rtt.keepalive_ms * 2).max(1));

		for stale_sn in item.send.apply_snack(now, expected_sn, &gaps, resend_after) {
			item.send.clear_sent(stale_sn);
		}

		item.addresses.note_validated_source(remote);
		item.timers.note_recv(now);
	}

	fn on_ack_flush(&mut self, local_alfid: u32) {
		if let Some(item) = self.tlb.find_by_alfid_mut(local_alfid) {
			item.timers.note_recv(std::time::Instant::now());
			item.on_both_commits_acked();
		}
	}

	fn on_release(&mut self, local_alfid: u32) {
		if let Some(item) = self.tlb.find_by_alfid_mut(local_alfid) {
			item.timers.note_recv(std::time::Instant::now());
			item.on_release_acked();
		}
	}

	/// Responder side of `MULTIPLY` (§4.3, §4.5): derive the child key from the parent's current
	/// AEAD key and the `sn1`/`sn2` the initiator carried as a cleartext-but-authenticated prefix,
	/// allocate a new Socket Item keyed by `{remoteHost, remoteALFID, parentALFID}`, and reply
	/// `PERSIST` or `NULCOMMIT`.
	fn on_multiply(&mut self, cx: CX![], remote: SocketAddr, sender_alfid: u32, local_alfid: u32, header: &Header, aad: &[u8], payload: &[u8], tag: &[u8; 8]) {
		if payload.len() < 8 {
			return trace!("MULTIPLY from {remote} missing sn1/sn2 prefix");
		}

		let sn1 = u32::from_be_bytes(payload[0..4].try_into().unwrap());
		let sn2 = u32::from_be_bytes(payload[4..8].try_into().unwrap());

		let child_key = {
			let Some(parent) = self.tlb.find_by_alfid(local_alfid) else {
				return trace!("MULTIPLY against unknown parent ALFID from {remote}");
			};

			if !matches!(parent.state, SocketState::Established | SocketState::Committed) {
				return trace!("MULTIPLY against a parent not yet established, from {remote}");
			}

			let Some(parent_key) = parent.icc.current_aead_key() else {
				return trace!("MULTIPLY requires an AEAD-keyed parent, from {remote}");
			};

			let (id_initiator, id_responder) = multiply_context(sender_alfid, local_alfid);
			derive_next_key(parent_key, sn1, sn2, id_initiator, id_responder, parent_key.key_len())
		};

		let tuple = RemoteTuple { remote_host: remote, remote_alfid: sender_alfid, parent_alfid: local_alfid };

		if self.tlb.find_by_remote(&tuple).is_some() {
			return trace!("Duplicate MULTIPLY collision from {remote}; ignoring");
		}

		let (id_initiator, id_responder) = multiply_context(sender_alfid, local_alfid);
		let Some(handshake_key) = AeadKey::new(&child_key) else {
			return warn!("Derived MULTIPLY key of {} bytes is not AEAD-capable", child_key.len());
		};
		let handshake_pair = FiberIdPair { source: id_initiator, peer: id_responder };

		let mut aad_full = aad.to_vec();
		aad_full.extend_from_slice(&payload[..8]);
		let mut body = payload[8..].to_vec();

		if handshake_key.open(handshake_pair, 0, &aad_full, &mut body, tag).is_err() {
			return trace!("ICC validation failed for MULTIPLY from {remote}");
		}

		let new_alfid = self.tlb.allocate_alfid();
		let mut child = SocketItem::new(new_alfid, sender_alfid, local_alfid, remote, 1, 1, self.notice.clone());

		// The reply (PERSIST/NULCOMMIT) is sealed under the same symmetric handshake key/pair
		// used to validate this inbound MULTIPLY, not under `child.icc`: the initiator cannot
		// construct `child.icc`'s properly-mirrored pair until it has parsed that reply and
		// learned this side's real ALFID (see `on_multiply_reply`). `emit` performs the switch
		// to a mirrored `IccContext` once the reply is on the wire.
		child.addresses.note_validated_source(remote);
		child.state = SocketState::Established;
		child.multiply_handshake = Some(MultiplyHandshake { key: handshake_key, pair: handshake_pair, raw_key: child_key, sn1, sn2 });

		let eot = header.end_of_transaction();
		let now = std::time::Instant::now();
		let is_nulcommit = body.is_empty() && eot;
		child.recv.place(1, Opcode::Multiply, body, eot, now);

		if eot {
			child.on_peer_commit();
		}

		if self.tlb.insert(child, Some(tuple)).is_err() {
			return warn!("Socket Table full; rejecting MULTIPLY from {remote}");
		}

		if let Some(item) = self.tlb.find_by_alfid_mut(new_alfid) {
			let keepalive_ms = item.rtt.keepalive_ms;
			item.timers.arm(cx, keepalive_ms);

			if !item.recv.drain_ready().is_empty() {
				let _ = item.notice.fwd(Notice::DataReady);
			}
		}

		self.emit(new_alfid, if is_nulcommit { Emit::NulCommit } else { Emit::Persist });
	}

	/// Initiator side of a `PERSIST`/`NULCOMMIT` reply to its own `MULTIPLY` (§4.3, §4.5): learn
	/// the child's real remote ALFID, validate under the same handshake key used to send
	/// `MULTIPLY`, then promote the child to a properly mirrored [`IccContext`] for all
	/// subsequent traffic.
	fn on_multiply_reply(&mut self, local_alfid: u32, remote: SocketAddr, sender_alfid: u32, header: &Header, aad: &[u8], payload: &[u8], tag: &[u8; 8], is_nulcommit: bool) {
		let Some(item) = self.tlb.find_by_alfid_mut(local_alfid) else { return };

		if item.state != SocketState::Cloning {
			return trace!("Unexpected {} reply for child ALFID {local_alfid} from {remote}", if is_nulcommit { "NULCOMMIT" } else { "PERSIST" });
		}

		let Some(handshake) = item.multiply_handshake.take() else {
			return trace!("Child ALFID {local_alfid} has no MULTIPLY handshake state to validate a reply against");
		};

		let mut body = payload.to_vec();

		if handshake.key.open(handshake.pair, 0, aad, &mut body, tag).is_err() {
			item.multiply_handshake = Some(handshake);
			return trace!("ICC validation failed for MULTIPLY reply from {remote}");
		}

		item.remote_alfid = sender_alfid;
		item.addresses.note_validated_source(remote);
		item.timers.note_recv(std::time::Instant::now());
		item.icc = IccContext::new_unkeyed(FiberIdPair { source: item.local_alfid, peer: item.remote_alfid });

		if item.icc.install_key(handshake.raw_key, false, 0, 0).is_none() {
			return warn!("Failed to install MULTIPLY key on child ALFID {local_alfid} after reply");
		}

		item.state = SocketState::Established;

		if is_nulcommit {
			item.on_local_commit();
			item.on_peer_commit();
		}
	}

	/// Invoked by [`crate::timers::SocketTimers::arm`]'s `timer_max!` callback (§4.7): decide
	/// what this tick calls for, perform it against the Socket Table and Lower Interface, and
	/// re-arm unless the socket was torn down.
	pub(crate) fn on_timer_tick(&mut self, cx: CX![], local_alfid: u32) {
		use crate::scb::SocketState::*;
		use crate::timers::TickAction;

		let Some(item) = self.tlb.find_by_alfid_mut(local_alfid) else { return };
		let now = std::time::Instant::now();
		let action = item.timers.on_tick(now, item.state);

		match action {
			TickAction::Retransmit => {
				let emit = match item.state {
					ConnectBootstrap => Emit::InitConnect,
					ConnectAffirming => Emit::ConnectRequest,
					Challenging => Emit::AckConnectReq,
					Committing | Committing2 => Emit::AckFlush,
					PreClosed => Emit::Release,
					Cloning => Emit::Multiply { child_alfid: local_alfid },
					_ => Emit::KeepAlive,
				};
				self.emit(local_alfid, emit);
			}
			TickAction::SendKeepAlive => self.emit(local_alfid, Emit::KeepAlive),
			TickAction::Timeout => {
				if let Some(mut item) = self.tlb.remove(local_alfid) {
					item.on_reset();
				}
				return;
			}
			TickAction::ReclaimClosed => {
				self.tlb.remove(local_alfid);
				return;
			}
			TickAction::Idle => {}
		}

		if let Some(item) = self.tlb.find_by_alfid_mut(local_alfid) {
			let keepalive_ms = item.rtt.keepalive_ms;
			item.timers.arm(cx, keepalive_ms);
		}
	}

	/// Entry point for ULA commands (§4.6): dispatch against the Socket Table, then build and
	/// emit whatever packet the resulting [`Emit`] calls for.
	pub fn command(&mut self, cx: CX![], local_alfid: u32, cmd: Command) {
		let emit = match dispatch(&mut self.tlb, cmd, self.notice.clone()) {
			Ok(emit) => emit,
			Err(err) => {
				let notice = match err {
					Error::Notice(notice) => notice,
					Error::Bind => Notice::CannotReturn,
				};

				if let Some(item) = self.tlb.find_by_alfid_mut(local_alfid) {
					let _ = item.notice.fwd(notice);
				}
				return;
			}
		};

		// `Multiply` allocates a fresh child Socket Item distinct from the parent being cloned
		// (§4.3, §4.5); `Connect`/`Listen` allocate (or bind) a brand-new item that has no
		// relation to whatever `local_alfid` the caller passed in (there may be no live item at
		// that ALFID at all yet). Everything downstream — addressing the packet, arming the
		// timer — acts on the item `dispatch` actually produced.
		let target_alfid = match emit {
			Emit::Multiply { child_alfid } => child_alfid,
			Emit::Connect { local_alfid } => local_alfid,
			Emit::Listen { local_alfid } => local_alfid,
			_ => local_alfid,
		};

		self.emit(target_alfid, emit);

		if let Some(item) = self.tlb.find_by_alfid_mut(target_alfid) {
			let keepalive_ms = item.rtt.keepalive_ms;
			item.timers.arm(cx, keepalive_ms);
		}
	}

	fn emit(&mut self, local_alfid: u32, emit: Emit) {
		let Some(item) = self.tlb.find_by_alfid_mut(local_alfid) else { return };
		let Some(dest) = item.addresses.care_of() else { return };

		let opcode = match emit {
			Emit::None => return,
			Emit::Listen { .. } => return,
			Emit::InitConnect | Emit::Connect { .. } => Opcode::InitConnect,
			Emit::ConnectRequest => Opcode::ConnectRequest,
			Emit::AckConnectReq => Opcode::AckConnectReq,
			Emit::Data { .. } => Opcode::PureData,
			Emit::KeepAlive => Opcode::KeepAlive,
			Emit::AckFlush => Opcode::AckFlush,
			Emit::Release => Opcode::Release,
			Emit::Reset => Opcode::Reset,
			Emit::Multiply { .. } => Opcode::Multiply,
			Emit::Persist => Opcode::Persist,
			Emit::NulCommit => Opcode::NulCommit,
		};

		let sn = match emit {
			Emit::Data { sn } => sn,
			_ => item.send.next_sn,
		};

		let mut body = match emit {
			Emit::Data { .. } | Emit::Multiply { .. } => item.send.get(sn).map(|slot| slot.data.clone()).unwrap_or_default(),
			Emit::KeepAlive => {
				let (expected_sn, gaps) = item.recv.generate_snack();
				encode_snack(expected_sn, &gaps)
			}
			// The cookie the responder handed back in ACK_INIT_CONNECT must be echoed so the
			// responder can validate it statelessly (§4.2, §4.3); CONNECT_PARAM carries it
			// alongside this host's own mobility subnets.
			Emit::ConnectRequest => build_connect_param(item.connect.cookie, local_subnet_prefixes(self.lower.local_addresses()), 0, 0),
			// ACK_CONNECT_REQ carries no cookie of its own, only this host's subnets for the
			// initiator's mobility tracking (§4.1, §4.3).
			Emit::AckConnectReq => build_connect_param([0; 8], local_subnet_prefixes(self.lower.local_addresses()), 0, 0),
			_ => Vec::new(),
		};

		let mut buf = frame_prefix(local_alfid, item.remote_alfid);
		let header_start = buf.len();
		buf.resize(header_start + HEADER_LEN, 0);

		{
			let header: &mut Header = bytes::cast_mut(&mut buf[header_start..header_start + HEADER_LEN]);
			header.version = CURRENT_VERSION;
			header.opcode = opcode as u8;
			header.hsp = (HEADER_LEN as u16).into();
			header.sequence_no = sn.into();
			header.expected_sn = item.recv.first_sn.into();
			header.flags_window = Header::flags_window(0, crate::window::WINDOW_CAPACITY as u32);
		}

		let aad = buf[header_start..header_start + HEADER_AAD_LEN].to_vec();

		// MULTIPLY and its PERSIST/NULCOMMIT reply are sealed under the symmetric handshake key
		// derived in `DeriveNextKey` (§4.5), not `item.icc`: neither side can construct the
		// properly-mirrored per-direction pair `item.icc` uses until it has learned the other
		// side's real ALFID from the exchange itself.
		let tag = match emit {
			Emit::Multiply { .. } => {
				let handshake = item.multiply_handshake.as_ref().expect("a Cloning child always carries its MULTIPLY handshake key");
				let mut aad_full = aad.clone();
				aad_full.extend_from_slice(&handshake.sn1.to_be_bytes());
				aad_full.extend_from_slice(&handshake.sn2.to_be_bytes());
				let tag = handshake.key.seal(handshake.pair, 0, &aad_full, &mut body);

				let mut framed = Vec::with_capacity(8 + body.len());
				framed.extend_from_slice(&handshake.sn1.to_be_bytes());
				framed.extend_from_slice(&handshake.sn2.to_be_bytes());
				framed.extend_from_slice(&body);
				body = framed;
				tag
			}
			Emit::Persist | Emit::NulCommit => {
				let handshake = item
					.multiply_handshake
					.take()
					.expect("a just-cloned child carries its MULTIPLY handshake key until its first reply is sent");
				let tag = handshake.key.seal(handshake.pair, 0, &aad, &mut body);

				item.icc = IccContext::new_unkeyed(item.fiber_pair());
				let _ = item.icc.install_key(handshake.raw_key, false, 0, 0);
				tag
			}
			// §4.5: the AEAD XOR-salt carries the 32-bit `expectedSN` field just written into this
			// header, so the same nonce pair can never validate if replayed from the other
			// direction.
			_ => item.icc.seal(sn, item.recv.first_sn, &aad, &mut body),
		};

		{
			let header: &mut Header = bytes::cast_mut(&mut buf[header_start..header_start + HEADER_LEN]);
			header.integrity = u64::from_be_bytes(tag).into();
		}

		buf.extend_from_slice(&body);

		if matches!(emit, Emit::Data { .. } | Emit::Multiply { .. }) {
			item.send.mark_sent(std::time::Instant::now(), sn);
		}

		if let Err(e) = self.lower.send(dest, &buf) {
			warn!("Failed to emit {opcode:?} to {dest}: {e}");
		}
	}
}

fn frame_prefix(source_alfid: u32, peer_alfid: u32) -> Vec<u8> {
	let mut buf = Vec::with_capacity(FRAME_PREFIX_LEN);
	buf.extend_from_slice(&source_alfid.to_be_bytes());
	buf.extend_from_slice(&peer_alfid.to_be_bytes());
	buf
}

/// SELECTIVE_NACK's sub-header (§4.1, §4.4): a fixed [`SelectiveNackHeader`] followed by one
/// [`GapDescriptor`] per reported run, carried as the ICC-protected body of a `KEEP_ALIVE`.
fn encode_snack(expected_sn: u32, gaps: &[GapRun]) -> Vec<u8> {
	let header = SelectiveNackHeader { expected_sn: expected_sn.into(), gap_count: (gaps.len() as u32).into() };
	let mut out = bytes::as_slice::<u8, _>(&header).to_vec();

	for gap in gaps {
		let descriptor = GapDescriptor { gap_width: gap.gap_width.into(), data_length: gap.data_length.into() };
		out.extend_from_slice(bytes::as_slice::<u8, _>(&descriptor));
	}

	out
}

fn parse_snack(payload: &[u8]) -> Option<(u32, Vec<GapRun>)> {
	let header_len = core::mem::size_of::<SelectiveNackHeader>();

	if payload.len() < header_len {
		return None;
	}

	let header: &SelectiveNackHeader = bytes::cast(&payload[..header_len]);
	let expected_sn = header.expected_sn.get();
	let count = header.gap_count.get() as usize;

	let descriptor_len = core::mem::size_of::<GapDescriptor>();
	let mut gaps = Vec::with_capacity(count);
	let mut cursor = header_len;

	for _ in 0..count {
		if payload.len() < cursor + descriptor_len {
			return None;
		}

		let descriptor: &GapDescriptor = bytes::cast(&payload[cursor..cursor + descriptor_len]);
		gaps.push(GapRun { gap_width: descriptor.gap_width.get(), data_length: descriptor.data_length.get() });
		cursor += descriptor_len;
	}

	Some((expected_sn, gaps))
}

/// CONNECT_PARAM's sub-header (§4.1, §4.3), carried on `CONNECT_REQUEST` and `ACK_CONNECT_REQ`:
/// the cookie (meaningful only on `CONNECT_REQUEST`) plus this host's mobility subnets.
fn build_connect_param(cookie: [u8; 8], subnets: [u64; 4], listener_alfid: u32, time_delta: u32) -> Vec<u8> {
	let param = ConnectParam { subnets: PeerSubnets { prefixes: subnets.map(Into::into) }, listener_alfid: listener_alfid.into(), time_delta: time_delta.into(), cookie };
	bytes::as_slice::<u8, _>(&param).to_vec()
}

fn parse_connect_param(payload: &[u8]) -> Option<&ConnectParam> {
	if payload.len() < core::mem::size_of::<ConnectParam>() {
		return None;
	}

	Some(bytes::cast(payload))
}

/// This host's bound local addresses, reduced to the coarse per-interface prefixes CONNECT_PARAM
/// carries (§4.8): the IPv4 address itself, or an IPv6 address's /64 network prefix. Slots beyond
/// [`crate::scb::MAX_PHY_INTERFACES`] are dropped; unfilled slots stay zero.
fn local_subnet_prefixes(addrs: impl Iterator<Item = SocketAddr>) -> [u64; 4] {
	let mut prefixes = [0u64; 4];

	for (slot, addr) in prefixes.iter_mut().zip(addrs) {
		*slot = match addr.ip() {
			IpAddr::V4(v4) => u32::from(v4) as u64,
			IpAddr::V6(v6) => u64::from_be_bytes(v6.octets()[..8].try_into().unwrap()),
		};
	}

	prefixes
}
