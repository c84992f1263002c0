//! Command Dispatch (§4.6): the small set of commands ULA posts to a Socket Item, and the IPC
//! record shapes of §6 those commands correspond to on the wire of a future shared-memory shell.
//!
//! In this single-process implementation the "socket mutex" of §4.6/§5 is realized structurally:
//! each Socket Item is manipulated only from within the one `Fsp` actor's method calls, so one
//! command completes before the next is dispatched with no separate lock to acquire. `dispatch`
//! below is pure bookkeeping against the Control Block; it returns an [`Emit`] describing what
//! the caller (the `Fsp` actor in `lib.rs`, which alone holds the Lower Interface and ICC keys
//! needed to build and seal a packet) must now put on the wire.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use stakker::Fwd;

use crate::error::Error;
use crate::icc::derive_next_key;
use crate::notice::Notice;
use crate::packet::Opcode;
use crate::scb::{MultiplyHandshake, SocketItem, SocketState};
use crate::tlb::Tlb;

/// The commands of §4.6, keyed by the local ALFID of the Socket Item they target (except
/// `Connect`, which has none yet — `dispatch` allocates one).
pub enum Command {
	/// Start listening on a well-known ALFID the ULA already chose (§3: IDs at or below
	/// [`crate::alfid::LAST_WELL_KNOWN_ALFID`] are never handed out by the pool, reserving them
	/// for exactly this — a rendezvous point a peer's `Connect` dials by number, the way a TCP
	/// listener binds a fixed port instead of an ephemeral one).
	Listen { local_alfid: u32 },
	/// Start a new outbound session toward `remote_alfid` at `remote` (typically a peer's
	/// well-known listening ALFID). `dispatch` allocates the local ALFID.
	Connect { remote: SocketAddr, remote_alfid: u32 },
	Accept { local_alfid: u32 },
	Send { local_alfid: u32, opcode: Opcode, data: Vec<u8>, end_of_transaction: bool },
	Commit { local_alfid: u32 },
	Shutdown { local_alfid: u32 },
	Multiply { local_alfid: u32, data: Vec<u8>, end_of_transaction: bool },
	InstallKey { local_alfid: u32, raw_key: Vec<u8>, no_encrypt: bool, next_send_sn: u32, next_recv_sn: u32 },
	AdRecvWindow { local_alfid: u32 },
	Reject { local_alfid: u32, reason: u8 },
	Recycle { local_alfid: u32 },
}

/// The IPC command records of §6, preserved as named structs so a future shared-memory shell has
/// a precise contract to serialize even though no transport carries them across a process
/// boundary in this implementation.
pub struct CommandNewSession {
	pub process_id: u32,
	pub fiber_id: u32,
	pub shm_handle: u64,
	pub shm_size: u32,
	pub event_name: String,
}

pub struct CommandInstallKey {
	pub next_send_sn: u32,
	pub key_life: u32,
}

pub struct CommandReject {
	pub reason_code: u8,
}

/// What the caller must now emit on the wire, or deliver to ULA, as a result of a dispatched
/// command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emit {
	None,
	InitConnect,
	ConnectRequest,
	AckConnectReq,
	Data { sn: u32 },
	KeepAlive,
	AckFlush,
	Release,
	Reset,
	/// A freshly forked child (§4.3, §4.5) has its own ALFID, distinct from the command's
	/// `local_alfid` (the parent being cloned) — the caller must address the packet, and re-arm
	/// the timer, against `child_alfid` instead.
	Multiply { child_alfid: u32 },
	Persist,
	NulCommit,
	/// A freshly-created initiator session (ULA `Connect`): the caller must address
	/// `INIT_CONNECT`, and re-arm the timer, against `local_alfid` — the ALFID `dispatch` just
	/// allocated, not whatever the command itself carried in.
	Connect { local_alfid: u32 },
	/// A freshly-created listening session. No packet goes on the wire, but the caller still
	/// needs `local_alfid` to report the new session back to ULA and arm its timer.
	Listen { local_alfid: u32 },
}

/// Order-independent pairing for `MULTIPLY` key derivation and ICC handshake nonces (§4.5): both
/// ends compute the same `(idInitiator, idResponder)` the moment either ALFID is known from the
/// wire, regardless of which one is locally "ours".
pub fn multiply_context(a: u32, b: u32) -> (u32, u32) {
	if a <= b {
		(a, b)
	} else {
		(b, a)
	}
}

/// Dispatch one command against the Socket Table, per §4.6's table of opcode → method. Returns
/// the notice to deliver to ULA on failure (`CannotReturn` is the default seeded at command
/// entry per §7, overwritten by the specific cause below).
pub fn dispatch(tlb: &mut Tlb, cmd: Command, notice: Fwd<Notice>) -> Result<Emit, Error> {
	match cmd {
		Command::Listen { local_alfid } => {
			if tlb.find_by_alfid(local_alfid).is_some() {
				return Err(Notice::CannotReturn.into());
			}

			// No peer has reached out yet, so there is no home address to seed `AddressSet`
			// with; the placeholder is overwritten the moment any packet validates against this
			// item (`AddressSet::note_validated_source`), which for a listener never happens
			// directly — the responder path always allocates its own fresh item instead — but
			// keeps the field meaningful rather than guessing at a real peer.
			let unspecified = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
			let mut item = SocketItem::new(local_alfid, 0, 0, unspecified, 1, 1, notice);
			item.state = SocketState::Listening;
			let _ = item.notice.fwd(Notice::Listening);

			tlb.insert(item, None).map_err(|_| Notice::CannotReturn)?;
			Ok(Emit::Listen { local_alfid })
		}

		Command::Connect { remote, remote_alfid } => {
			let local_alfid = tlb.allocate_alfid();
			let mut item = SocketItem::new(local_alfid, remote_alfid, 0, remote, 1, 1, notice);
			item.begin_connect().map_err(|_| Notice::CannotReturn)?;

			tlb.insert(item, None).map_err(|_| Notice::CannotReturn)?;
			Ok(Emit::Connect { local_alfid })
		}

		Command::Accept { local_alfid } => {
			let item = tlb.find_by_alfid_mut(local_alfid).ok_or(Notice::CannotReturn)?;
			item.accept().map_err(|_| Notice::CannotReturn)?;
			Ok(Emit::AckConnectReq)
		}

		Command::Send { local_alfid, opcode, data, end_of_transaction } => {
			let item = tlb.find_by_alfid_mut(local_alfid).ok_or(Notice::CannotReturn)?;

			if !matches!(item.state, SocketState::Established | SocketState::PeerCommit) {
				return Err(Notice::CannotReturn.into());
			}

			let sn = item.send.enqueue(opcode, data, end_of_transaction).ok_or(Notice::CannotReturn)?;

			if end_of_transaction {
				item.on_local_commit();
			}

			Ok(Emit::Data { sn })
		}

		Command::Commit { local_alfid } => {
			let item = tlb.find_by_alfid_mut(local_alfid).ok_or(Notice::CannotReturn)?;

			if !matches!(item.state, SocketState::Established | SocketState::PeerCommit) {
				return Err(Notice::CannotReturn.into());
			}

			item.on_local_commit();
			Ok(Emit::KeepAlive)
		}

		Command::Shutdown { local_alfid } => {
			let item = tlb.find_by_alfid_mut(local_alfid).ok_or(Notice::CannotReturn)?;
			item.send_release().map_err(|_| Notice::CannotReturn)?;
			Ok(Emit::Release)
		}

		Command::Multiply { local_alfid, data, end_of_transaction } => {
			let parent = tlb.find_by_alfid(local_alfid).ok_or(Notice::CannotReturn)?;

			if !matches!(parent.state, SocketState::Established | SocketState::Committed) {
				return Err(Notice::CannotReturn.into());
			}

			let parent_key = parent.icc.current_aead_key().ok_or(Notice::CannotReturn)?;
			let sn1 = parent.send.next_sn;
			let sn2 = parent.recv.first_sn;
			let parent_remote_alfid = parent.remote_alfid;
			let home = parent.addresses.care_of().ok_or(Notice::CannotReturn)?;
			let notice = parent.notice.clone();

			let child_alfid = tlb.allocate_alfid();
			let (id_initiator, id_responder) = multiply_context(child_alfid, parent_remote_alfid);
			let key_len = parent_key.key_len();
			let raw_key = derive_next_key(parent_key, sn1, sn2, id_initiator, id_responder, key_len);
			let pair = crate::alfid::FiberIdPair { source: id_initiator, peer: id_responder };
			let handshake_key = crate::icc::AeadKey::new(&raw_key).ok_or(Notice::CannotReturn)?;

			// Addressed at the parent's remote ALFID until the reply teaches us the child's real
			// one (§4.3 edge case (g)); `frame_prefix`/`emit` need no special-casing since this is
			// exactly the ordinary `remote_alfid` field every other opcode already addresses by.
			let mut child = SocketItem::new(child_alfid, parent_remote_alfid, local_alfid, home, 1, 1, notice);
			child.state = SocketState::Cloning;
			child.multiply_handshake = Some(MultiplyHandshake { key: handshake_key, pair, raw_key, sn1, sn2 });

			let enqueued_sn = child.send.enqueue(Opcode::Multiply, data, end_of_transaction).ok_or(Notice::CannotReturn)?;
			debug_assert_eq!(enqueued_sn, 1);

			tlb.insert(child, None).map_err(|_| Notice::CannotReturn)?;

			Ok(Emit::Multiply { child_alfid })
		}

		Command::InstallKey { local_alfid, raw_key, no_encrypt, next_send_sn, next_recv_sn } => {
			let item = tlb.find_by_alfid_mut(local_alfid).ok_or(Notice::CannotReturn)?;
			item.icc.install_key(raw_key, no_encrypt, next_send_sn, next_recv_sn).ok_or(Notice::CannotReturn)?;
			Ok(Emit::None)
		}

		Command::AdRecvWindow { local_alfid } => {
			let item = tlb.find_by_alfid_mut(local_alfid).ok_or(Notice::CannotReturn)?;

			Ok(if matches!(item.state, SocketState::Committing | SocketState::Committing2 | SocketState::PeerCommit) {
				Emit::AckFlush
			} else {
				Emit::KeepAlive
			})
		}

		Command::Reject { local_alfid, reason: _ } => {
			let item = tlb.find_by_alfid_mut(local_alfid).ok_or(Notice::CannotReturn)?;
			item.on_reset();
			Ok(Emit::Reset)
		}

		Command::Recycle { local_alfid } => {
			tlb.remove(local_alfid).ok_or(Notice::CannotReturn)?;
			Ok(Emit::None)
		}
	}
}

#[cfg(test)]
mod tests {
	use std::net::{Ipv4Addr, SocketAddrV4};

	use stakker::Fwd;

	use super::*;
	use crate::scb::SocketItem;

	fn addr() -> std::net::SocketAddr {
		std::net::SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 4000))
	}

	fn test_notice() -> Fwd<Notice> {
		Fwd::new(|_| {})
	}

	fn tlb_with_one() -> (Tlb, u32) {
		let mut tlb = Tlb::new(16);
		let alfid = tlb.allocate_alfid();
		let item = SocketItem::new(alfid, 1, 0, addr(), 1, 1, test_notice());
		tlb.insert(item, None).unwrap();
		(tlb, alfid)
	}

	#[test]
	fn connect_command_allocates_a_new_item_and_emits_init_connect() {
		let mut tlb = Tlb::new(16);
		let emit = dispatch(&mut tlb, Command::Connect { remote: addr(), remote_alfid: 1 }, test_notice()).unwrap();
		let Emit::Connect { local_alfid } = emit else { panic!("expected Emit::Connect, got {emit:?}") };

		let item = tlb.find_by_alfid(local_alfid).unwrap();
		assert_eq!(item.state, SocketState::ConnectBootstrap);
		assert_eq!(item.remote_alfid, 1);
	}

	#[test]
	fn listen_command_creates_a_listening_item_at_the_well_known_alfid() {
		let mut tlb = Tlb::new(16);
		let emit = dispatch(&mut tlb, Command::Listen { local_alfid: 42 }, test_notice()).unwrap();
		assert_eq!(emit, Emit::Listen { local_alfid: 42 });
		assert_eq!(tlb.find_by_alfid(42).unwrap().state, SocketState::Listening);
	}

	#[test]
	fn listen_command_rejects_a_second_bind_to_the_same_alfid() {
		let mut tlb = Tlb::new(16);
		dispatch(&mut tlb, Command::Listen { local_alfid: 42 }, test_notice()).unwrap();
		let err = dispatch(&mut tlb, Command::Listen { local_alfid: 42 }, test_notice());
		assert_eq!(err.unwrap_err(), Error::Notice(Notice::CannotReturn));
	}

	#[test]
	fn send_before_established_is_rejected() {
		let (mut tlb, alfid) = tlb_with_one();
		let err = dispatch(&mut tlb, Command::Send { local_alfid: alfid, opcode: Opcode::PureData, data: vec![1], end_of_transaction: false }, test_notice());
		assert_eq!(err.unwrap_err(), Error::Notice(Notice::CannotReturn));
	}

	#[test]
	fn send_with_eot_commits_locally() {
		let (mut tlb, alfid) = tlb_with_one();
		tlb.find_by_alfid_mut(alfid).unwrap().state = SocketState::Established;

		let emit = dispatch(&mut tlb, Command::Send { local_alfid: alfid, opcode: Opcode::PureData, data: vec![1], end_of_transaction: true }, test_notice()).unwrap();
		assert_eq!(emit, Emit::Data { sn: 1 });
		assert_eq!(tlb.find_by_alfid(alfid).unwrap().state, SocketState::Committing);
	}

	#[test]
	fn recycle_removes_from_table() {
		let (mut tlb, alfid) = tlb_with_one();
		dispatch(&mut tlb, Command::Recycle { local_alfid: alfid }, test_notice()).unwrap();
		assert!(tlb.find_by_alfid(alfid).is_none());
	}
}
