//! The per-connection Control Block and Socket Item state machine (§3, §4.3).
//!
//! The "shared memory" boundary between ULA and LLS described in §3 is represented here as an
//! ordinary Rust struct owned by the Socket Item, since the out-of-core IPC shell is not built in
//! this implementation; the ring slots and sequence-space fields are kept exactly as specified so
//! a future IPC shell could be laid directly over this struct's memory.

use std::net::SocketAddr;
use std::time::Instant;

use stakker::Fwd;

use crate::alfid::FiberIdPair;
use crate::icc::{AeadKey, IccContext};
use crate::notice::Notice;
use crate::timers::SocketTimers;
use crate::window::{RecvWindow, SendWindow};

/// Upper bound on the number of remote addresses a Socket Item tracks (§3).
pub const MAX_PHY_INTERFACES: usize = 4;

/// Floor on the keep-alive/retransmit tempo, below which the EWMA in [`RttEstimator`] is not
/// allowed to push the socket (§4.4 leaves this a deployment constant).
pub const KEEPALIVE_FLOOR_MS: u64 = 100;

/// The 17 states of §4.3. `NON_EXISTENT` is both the initial and, after teardown, the terminal
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
	NonExistent,
	Listening,
	ConnectBootstrap,
	ConnectAffirming,
	Challenging,
	Established,
	Committing,
	Committing2,
	PeerCommit,
	Committed,
	Closable,
	PreClosed,
	Closed,
	Cloning,
	Resuming,
	QuasiActive,
}

impl SocketState {
	/// Whether the timer wheel drives this state on the transient-timeout cadence rather than
	/// the data-state cadence (§4.7).
	pub fn is_transient(self) -> bool {
		matches!(
			self,
			Self::ConnectBootstrap
				| Self::ConnectAffirming | Self::Challenging
				| Self::Committing | Self::Committing2
				| Self::PreClosed | Self::Cloning
				| Self::Resuming | Self::QuasiActive
		)
	}
}

/// The ordered remote-address list of §3: index 0 is the preferred "care-of" address, the last
/// occupied slot is the home address. `sentinel` holds the source of the most recently validated
/// packet, used to auto-promote a new care-of address on mobility (§4.8).
#[derive(Default)]
pub struct AddressSet {
	slots: [Option<SocketAddr>; MAX_PHY_INTERFACES],
	sentinel: Option<SocketAddr>,
}

impl AddressSet {
	pub fn new(home: SocketAddr) -> Self {
		let mut slots = [None; MAX_PHY_INTERFACES];
		slots[0] = Some(home);
		Self { slots, sentinel: Some(home) }
	}

	pub fn care_of(&self) -> Option<SocketAddr> {
		self.slots[0]
	}

	/// Record the source address of a packet that has already passed ICC validation, promoting
	/// it to the care-of slot if it differs from the current one (§4.8's `ChangeRemoteValidatedIP`).
	pub fn note_validated_source(&mut self, addr: SocketAddr) {
		self.sentinel = Some(addr);

		if self.slots[0] == Some(addr) {
			return;
		}

		if let Some(pos) = self.slots.iter().position(|s| *s == Some(addr)) {
			self.slots[0..=pos].rotate_right(1);
		} else {
			self.slots.rotate_right(1);
			self.slots[0] = Some(addr);
		}
	}
}

/// Connect-handshake parameters retained across CONNECT_BOOTSTRAP/CHALLENGING (§3).
#[derive(Clone, Copy, Default)]
pub struct ConnectParams {
	pub init_check_code: u64,
	pub salt: u32,
	pub cookie: [u8; 8],
	pub timestamp_us: i64,
	pub allowed_prefixes: [u64; 4],
	pub parent_alfid: u32,
}

/// EWMA round-trip estimator driving the keep-alive/retransmit tempo (§4.4). Uses plain unsigned
/// 64-bit microsecond arithmetic, per SPEC_FULL §4.4's resolution of the donor's
/// division-avoidance bit tricks being a compiler workaround rather than a protocol invariant.
pub struct RttEstimator {
	rtt_avg_us: u64,
	pub keepalive_ms: u64,
}

impl RttEstimator {
	pub fn new() -> Self {
		Self { rtt_avg_us: 0, keepalive_ms: KEEPALIVE_FLOOR_MS }
	}

	pub fn sample(&mut self, raw_us: u64) {
		let rtt_sample = (raw_us + 3) >> 2;
		self.rtt_avg_us = (self.rtt_avg_us >> 1) + (rtt_sample >> 1);
		self.keepalive_ms = (self.keepalive_ms >> 1).max(self.rtt_avg_us / 512).max(KEEPALIVE_FLOOR_MS);
	}
}

impl Default for RttEstimator {
	fn default() -> Self {
		Self::new()
	}
}

/// Transient handshake-only key material for a `Cloning` child (§4.3, §4.5). Until both sides
/// have learned each other's freshly-allocated ALFID, `MULTIPLY`/`PERSIST`/`NULCOMMIT` cannot be
/// sealed under the item's own (not yet mirrored) [`IccContext`] — the remote side of the pair is
/// exactly the thing being exchanged. They are instead sealed directly under this raw derived key
/// with the order-independent symmetric pair from `multiply_context` (§4.5's `(idInitiator,
/// idResponder)`), which both ends can compute the moment either ALFID is known from the wire.
/// Dropped in favor of a properly mirrored `IccContext` once the handshake completes.
pub struct MultiplyHandshake {
	pub key: AeadKey,
	pub pair: FiberIdPair,
	pub raw_key: Vec<u8>,
	/// The parent's `send.next_sn`/`recv.first_sn` at the moment of cloning (§4.5's nonce for
	/// `DeriveNextKey`), carried as cleartext-but-authenticated AAD on the wire so the responder
	/// can derive the same child key before it has anything else to key a decryption with.
	pub sn1: u32,
	pub sn2: u32,
}

/// The per-connection Control Block plus FSM: the Socket Item of §3/§4.3.
pub struct SocketItem {
	pub local_alfid: u32,
	pub remote_alfid: u32,
	pub parent_alfid: u32,
	pub addresses: AddressSet,
	pub state: SocketState,
	pub send: SendWindow,
	pub recv: RecvWindow,
	pub icc: IccContext,
	pub rtt: RttEstimator,
	pub connect: ConnectParams,
	/// Set when an error inside the socket's logical mutex must complete on release rather than
	/// immediately (§4.6, §7); the command dispatcher checks this before servicing new commands.
	pub reset_pending: bool,
	pub notice: Fwd<Notice>,
	pub timers: SocketTimers,
	/// Present only while a `MULTIPLY` child is bootstrapping (§4.3, §4.5); see
	/// [`MultiplyHandshake`].
	pub multiply_handshake: Option<MultiplyHandshake>,
}

impl SocketItem {
	pub fn new(local_alfid: u32, remote_alfid: u32, parent_alfid: u32, home: SocketAddr, initial_send_sn: u32, initial_recv_sn: u32, notice: Fwd<Notice>) -> Self {
		let pair = FiberIdPair { source: local_alfid, peer: remote_alfid };

		Self {
			local_alfid,
			remote_alfid,
			parent_alfid,
			addresses: AddressSet::new(home),
			state: SocketState::NonExistent,
			send: SendWindow::new(initial_send_sn),
			recv: RecvWindow::new(initial_recv_sn),
			icc: IccContext::new_unkeyed(pair),
			rtt: RttEstimator::new(),
			connect: ConnectParams::default(),
			reset_pending: false,
			notice,
			timers: SocketTimers::new(local_alfid, Instant::now()),
			multiply_handshake: None,
		}
	}

	pub fn fiber_pair(&self) -> FiberIdPair {
		FiberIdPair { source: self.local_alfid, peer: self.remote_alfid }
	}

	/// Initiator side: `NON_EXISTENT` → `CONNECT_BOOTSTRAP` on a ULA `Connect` command (§4.3).
	pub fn begin_connect(&mut self) -> Result<(), ()> {
		if self.state != SocketState::NonExistent {
			return Err(());
		}

		self.state = SocketState::ConnectBootstrap;
		Ok(())
	}

	/// Initiator side: `CONNECT_BOOTSTRAP` → `CONNECT_AFFIRMING` on receipt of
	/// `ACK_INIT_CONNECT` carrying a cookie (§4.3).
	pub fn on_ack_init_connect(&mut self, cookie: [u8; 8]) -> Result<(), ()> {
		if self.state != SocketState::ConnectBootstrap {
			return Err(());
		}

		self.connect.cookie = cookie;
		self.state = SocketState::ConnectAffirming;
		Ok(())
	}

	/// Initiator side: `CONNECT_AFFIRMING` → `ESTABLISHED` on receipt of `ACK_CONNECT_REQ`
	/// carrying the peer's allowed prefixes (§4.3).
	pub fn on_ack_connect_req(&mut self, allowed_prefixes: [u64; 4]) -> Result<(), ()> {
		if self.state != SocketState::ConnectAffirming {
			return Err(());
		}

		self.connect.allowed_prefixes = allowed_prefixes;
		self.state = SocketState::Established;
		Ok(())
	}

	/// Responder side: a validated `CONNECT_REQUEST` allocates this Socket Item already in
	/// `CHALLENGING`, awaiting the ULA's `Accept` (§4.3).
	pub fn begin_challenge(&mut self, params: ConnectParams) {
		self.connect = params;
		self.state = SocketState::Challenging;
	}

	/// Responder side: `CHALLENGING` → `ESTABLISHED` on a ULA `Accept` command, having sent
	/// `ACK_CONNECT_REQ` (§4.3).
	pub fn accept(&mut self) -> Result<(), ()> {
		if self.state != SocketState::Challenging {
			return Err(());
		}

		self.state = SocketState::Established;
		Ok(())
	}

	/// A packet carrying `EndOfTransaction` has been received (§4.3): `ESTABLISHED` →
	/// `PEER_COMMIT`, `COMMITTING` → `COMMITTING2`.
	pub fn on_peer_commit(&mut self) {
		self.state = match self.state {
			SocketState::Established => SocketState::PeerCommit,
			SocketState::Committing => SocketState::Committing2,
			other => other,
		};

		let _ = self.notice.fwd(Notice::ToCommit);
	}

	/// A `Commit` command marks the local tail `EndOfTransaction` (§4.3, §4.6): `ESTABLISHED` →
	/// `COMMITTING`, `PEER_COMMIT` → `COMMITTING2`.
	pub fn on_local_commit(&mut self) {
		self.state = match self.state {
			SocketState::Established => SocketState::Committing,
			SocketState::PeerCommit => SocketState::Committing2,
			other => other,
		};
	}

	/// Both the local commit and the peer's commit have been acknowledged (§4.3):
	/// `COMMITTING2` → `CLOSABLE`.
	pub fn on_both_commits_acked(&mut self) {
		if self.state == SocketState::Committing2 {
			self.state = SocketState::Closable;
		}
	}

	/// A graceful shutdown emits `RELEASE` (§4.3): `CLOSABLE` → `PRE_CLOSED`.
	pub fn send_release(&mut self) -> Result<(), ()> {
		if self.state != SocketState::Closable {
			return Err(());
		}

		self.state = SocketState::PreClosed;
		Ok(())
	}

	/// `RELEASE` has been acknowledged (§4.3): `PRE_CLOSED` → `CLOSED`.
	pub fn on_release_acked(&mut self) {
		if self.state == SocketState::PreClosed {
			self.state = SocketState::Closed;
		}
	}

	/// `RESET` always terminates the socket, regardless of current state (§4.3, §8: "after
	/// `RESET` validated, the socket ends in `NON_EXISTENT`").
	pub fn on_reset(&mut self) {
		self.state = SocketState::NonExistent;
		let _ = self.notice.fwd(Notice::Reset);
	}

	/// A timer-wheel deadline expired with no peer activity to show for it (§4.7): transition to
	/// `NON_EXISTENT` and notify `Timeout`, distinct from a peer-initiated `RESET`.
	pub fn on_timeout(&mut self) {
		self.state = SocketState::NonExistent;
		let _ = self.notice.fwd(Notice::Timeout);
	}

	/// Raise a fatal control-block invariant violation (§7): transition to `NON_EXISTENT` and
	/// notify `MemoryCorruption` rather than `Reset`, so the caller can distinguish a local bug
	/// from a peer-initiated abort.
	pub fn on_memory_corruption(&mut self) {
		self.state = SocketState::NonExistent;
		let _ = self.notice.fwd(Notice::MemoryCorruption);
	}

	/// Deterministic MULTIPLY collision tie-break (SPEC_FULL §9 resolution): the side with the
	/// numerically smaller `(parentALFID, localALFID)` tuple wins and proceeds; the loser should
	/// send `RESET` with a collision reason and let the caller drop its half-built Socket Item.
	pub fn wins_multiply_collision(local_parent: u32, local_new: u32, remote_parent: u32, remote_new: u32) -> bool {
		(local_parent, local_new) < (remote_parent, remote_new)
	}
}
