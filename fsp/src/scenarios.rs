//! End-to-end scenarios (SPEC_FULL §8): two in-memory Socket Items wired together through the
//! Command Dispatch API, standing in for the wire exchange the Lower Interface would otherwise
//! carry. Each test plays both "A" and "B" sides of one exchange against their own [`Tlb`],
//! relaying window/ICC effects by hand exactly the way two real Lower Interfaces would relay
//! bytes — just without a socket in between.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};

use stakker::Fwd;

use crate::command::{dispatch, multiply_context, Command, Emit};
use crate::cookie::CookieContext;
use crate::icc::{derive_next_key, AeadKey, IccContext};
use crate::notice::Notice;
use crate::packet::Opcode;
use crate::scb::{ConnectParams, SocketItem, SocketState};
use crate::tlb::Tlb;

fn addr(port: u16) -> SocketAddr {
	SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
}

fn no_notice() -> Fwd<Notice> {
	Fwd::new(|_: Notice| {})
}

#[test]
fn two_node_happy_path_delivers_ten_packets_in_order_and_closes() {
	let mut tlb_a = Tlb::new(64);
	let mut tlb_b = Tlb::new(64);
	let well_known = 42;

	dispatch(&mut tlb_b, Command::Listen { local_alfid: well_known }, no_notice()).unwrap();

	let emit = dispatch(&mut tlb_a, Command::Connect { remote: addr(9000), remote_alfid: well_known }, no_notice()).unwrap();
	let Emit::Connect { local_alfid: a_alfid } = emit else { panic!("expected Emit::Connect") };
	assert_eq!(tlb_a.find_by_alfid(a_alfid).unwrap().state, SocketState::ConnectBootstrap);

	// B's responder side allocates its own item off the listener the moment INIT_CONNECT
	// arrives (the same allocation `on_connect_request` performs, minus the actor plumbing).
	let cookie = [9u8; 8];
	let b_alfid = tlb_b.allocate_alfid();
	let mut b_item = SocketItem::new(b_alfid, a_alfid, 0, addr(9001), 1, 1, no_notice());
	b_item.begin_challenge(ConnectParams { cookie, ..Default::default() });
	tlb_b.insert(b_item, None).unwrap();

	// A learns the cookie from ACK_INIT_CONNECT, then B's ULA accepts, completing both sides.
	tlb_a.find_by_alfid_mut(a_alfid).unwrap().on_ack_init_connect(cookie).unwrap();
	let emit = dispatch(&mut tlb_b, Command::Accept { local_alfid: b_alfid }, no_notice()).unwrap();
	assert_eq!(emit, Emit::AckConnectReq);
	tlb_a.find_by_alfid_mut(a_alfid).unwrap().on_ack_connect_req([0; 4]).unwrap();

	assert_eq!(tlb_a.find_by_alfid(a_alfid).unwrap().state, SocketState::Established);
	assert_eq!(tlb_b.find_by_alfid(b_alfid).unwrap().state, SocketState::Established);

	let payloads: Vec<Vec<u8>> = (0..10).map(|i| vec![i as u8; 1000]).collect();
	let now = Instant::now();

	for (i, payload) in payloads.iter().enumerate() {
		let eot = i == payloads.len() - 1;
		let emit = dispatch(&mut tlb_a, Command::Send { local_alfid: a_alfid, opcode: Opcode::PureData, data: payload.clone(), end_of_transaction: eot }, no_notice()).unwrap();
		let Emit::Data { sn } = emit else { panic!("expected Emit::Data") };

		let a = tlb_a.find_by_alfid_mut(a_alfid).unwrap();
		a.send.mark_sent(now, sn);
		let slot = a.send.get(sn).unwrap();

		let b = tlb_b.find_by_alfid_mut(b_alfid).unwrap();
		assert!(b.recv.place(sn, slot.opcode, slot.data.clone(), slot.end_of_transaction, now));
	}

	assert_eq!(tlb_a.find_by_alfid(a_alfid).unwrap().state, SocketState::Committing);

	let b = tlb_b.find_by_alfid_mut(b_alfid).unwrap();
	let delivered = b.recv.drain_ready();
	assert_eq!(delivered.len(), 10);

	for (i, (sn, slot)) in delivered.iter().enumerate() {
		assert_eq!(*sn, i as u32 + 1);
		assert_eq!(&slot.data, &payloads[i]);
	}
	assert!(delivered.last().unwrap().1.end_of_transaction);

	b.on_peer_commit();
	assert_eq!(b.state, SocketState::PeerCommit);

	dispatch(&mut tlb_b, Command::Commit { local_alfid: b_alfid }, no_notice()).unwrap();
	assert_eq!(tlb_b.find_by_alfid(b_alfid).unwrap().state, SocketState::Committing2);

	// A learns B also reached commit (conceptually: B's ACK_FLUSH/KEEP_ALIVE carries that
	// signal) and both sides converge through CLOSABLE -> PRE_CLOSED -> CLOSED via RELEASE.
	let a = tlb_a.find_by_alfid_mut(a_alfid).unwrap();
	a.on_peer_commit();
	a.on_both_commits_acked();
	a.send_release().unwrap();
	a.on_release_acked();
	assert_eq!(a.state, SocketState::Closed);

	let b = tlb_b.find_by_alfid_mut(b_alfid).unwrap();
	b.on_both_commits_acked();
	b.send_release().unwrap();
	b.on_release_acked();
	assert_eq!(b.state, SocketState::Closed);
}

#[test]
fn loss_and_recovery_retransmits_exactly_the_dropped_run() {
	let mut tlb_a = Tlb::new(64);
	let mut tlb_b = Tlb::new(64);

	let a_alfid = tlb_a.allocate_alfid();
	let mut a_item = SocketItem::new(a_alfid, 1, 0, addr(9000), 1, 1, no_notice());
	a_item.state = SocketState::Established;
	tlb_a.insert(a_item, None).unwrap();

	let b_alfid = tlb_b.allocate_alfid();
	let mut b_item = SocketItem::new(b_alfid, a_alfid, 0, addr(9001), 1, 1, no_notice());
	b_item.state = SocketState::Established;
	tlb_b.insert(b_item, None).unwrap();

	let t0 = Instant::now();
	let dropped = [7u32, 11, 15];

	for i in 0..20 {
		let emit = dispatch(&mut tlb_a, Command::Send { local_alfid: a_alfid, opcode: Opcode::PureData, data: vec![i as u8], end_of_transaction: false }, no_notice()).unwrap();
		let Emit::Data { sn } = emit else { panic!("expected Emit::Data") };

		let a = tlb_a.find_by_alfid_mut(a_alfid).unwrap();
		a.send.mark_sent(t0, sn);

		if !dropped.contains(&sn) {
			let slot = a.send.get(sn).unwrap();
			let b = tlb_b.find_by_alfid_mut(b_alfid).unwrap();
			b.recv.place(sn, slot.opcode, slot.data.clone(), slot.end_of_transaction, t0);
		}
	}

	let b = tlb_b.find_by_alfid_mut(b_alfid).unwrap();
	let (expected_sn, gaps) = b.recv.generate_snack();
	assert_eq!(expected_sn, 7);
	assert_eq!(gaps, vec![
		crate::window::GapRun { gap_width: 1, data_length: 3 },
		crate::window::GapRun { gap_width: 1, data_length: 3 },
		crate::window::GapRun { gap_width: 1, data_length: 5 },
	]);

	let a = tlb_a.find_by_alfid_mut(a_alfid).unwrap();
	let resend = a.send.apply_snack(t0 + Duration::from_secs(10), expected_sn, &gaps, Duration::from_secs(1));
	assert_eq!(resend, dropped.to_vec());

	for sn in dropped {
		a.send.clear_sent(sn);
		a.send.mark_sent(t0 + Duration::from_secs(10), sn);
		let slot = a.send.get(sn).unwrap();
		let b = tlb_b.find_by_alfid_mut(b_alfid).unwrap();
		b.recv.place(sn, slot.opcode, slot.data.clone(), slot.end_of_transaction, t0 + Duration::from_secs(10));
	}

	let b = tlb_b.find_by_alfid_mut(b_alfid).unwrap();
	let ready = b.recv.drain_ready();
	assert_eq!(ready.len(), 20);
	assert!(ready.windows(2).all(|w| w[0].0 + 1 == w[1].0));
}

#[test]
fn mobility_promotes_new_care_of_address_without_resetting_state() {
	let mut tlb_b = Tlb::new(64);
	let l1 = addr(9000);
	let l2 = addr(9100);

	let b_alfid = tlb_b.allocate_alfid();
	let mut b_item = SocketItem::new(b_alfid, 1, 0, l1, 1, 1, no_notice());
	b_item.state = SocketState::Established;
	tlb_b.insert(b_item, None).unwrap();

	let b = tlb_b.find_by_alfid_mut(b_alfid).unwrap();
	assert_eq!(b.addresses.care_of(), Some(l1));

	// A's KEEP_ALIVE validates from its new address L2; B promotes it to the care-of slot.
	b.addresses.note_validated_source(l2);
	assert_eq!(b.addresses.care_of(), Some(l2));
	assert_eq!(b.state, SocketState::Established, "address change alone must not disturb the session state");

	// Traffic keeps flowing post-move with no window disruption.
	let sn = b.recv.generate_snack().0;
	assert!(b.recv.place(sn, Opcode::PureData, b"still alive".to_vec(), false, Instant::now()));
}

#[test]
fn cookie_defense_allocates_no_state_for_a_spoofed_init_connect() {
	let t0 = 1_000_000_i64;
	let cookies = CookieContext::new(t0);
	let pair = crate::alfid::FiberIdPair { source: 5, peer: 0 };
	let header_bytes = b"fixed-header-of-init-connect";

	// B answers with ACK_INIT_CONNECT + cookie to whatever source the datagram claims, but
	// this allocates no TLB entry: nothing here ever calls `tlb.insert`.
	let spoofed_cookie = cookies.generate(pair, header_bytes);
	let tlb = Tlb::new(64);
	assert_eq!(tlb.len_live(), 0);

	// The real attacker, lacking the spoofed victim's network path, cannot complete the
	// handshake without replaying that exact cookie back within the rotation window.
	assert!(cookies.verify(pair, header_bytes, &spoofed_cookie, t0 + 1000));

	let stale_now = t0 + crate::cookie::COOKIE_ROTATION_WINDOW_US + 1;
	assert!(!cookies.verify(pair, header_bytes, &spoofed_cookie, stale_now));
}

#[test]
fn rekey_during_flight_leaves_in_flight_packets_on_the_old_key() {
	let mut tlb_a = Tlb::new(64);
	let mut tlb_b = Tlb::new(64);

	let a_alfid = tlb_a.allocate_alfid();
	let mut a_item = SocketItem::new(a_alfid, 1, 0, addr(9000), 100, 100, no_notice());
	a_item.state = SocketState::Established;
	a_item.icc.install_key(vec![1u8; 32], false, 100, 100).unwrap();
	tlb_a.insert(a_item, None).unwrap();

	let b_alfid = tlb_b.allocate_alfid();
	let mut b_item = SocketItem::new(b_alfid, a_alfid, 0, addr(9001), 100, 100, no_notice());
	b_item.state = SocketState::Established;
	b_item.icc.install_key(vec![1u8; 32], false, 100, 100).unwrap();
	tlb_b.insert(b_item, None).unwrap();

	for sn in 100u32..150 {
		let a = tlb_a.find_by_alfid_mut(a_alfid).unwrap();
		let mut body = vec![sn as u8];
		let tag = a.icc.seal(sn, sn, b"aad", &mut body);

		let b = tlb_b.find_by_alfid_mut(b_alfid).unwrap();
		assert!(b.icc.open(sn, sn, b"aad", &mut body, &tag).is_ok());
	}

	// ULA installs K2 with nextSendSN=160 on both sides; K1 remains reachable as `previous`.
	tlb_a.find_by_alfid_mut(a_alfid).unwrap().icc.install_key(vec![2u8; 32], false, 160, 160).unwrap();
	tlb_b.find_by_alfid_mut(b_alfid).unwrap().icc.install_key(vec![2u8; 32], false, 160, 160).unwrap();

	for sn in 160u32..170 {
		let a = tlb_a.find_by_alfid_mut(a_alfid).unwrap();
		let mut body = vec![sn as u8];
		let tag = a.icc.seal(sn, sn, b"aad", &mut body);

		let b = tlb_b.find_by_alfid_mut(b_alfid).unwrap();
		assert!(b.icc.open(sn, sn, b"aad", &mut body, &tag).is_ok());
	}

	// A packet still in flight under K1 (sequence 149, below the 160 cutover) still opens
	// correctly even after the new key has been installed.
	let a = tlb_a.find_by_alfid_mut(a_alfid).unwrap();
	let mut late = vec![0xAB];
	let late_tag = a.icc.seal(149, 149, b"aad", &mut late);
	let b = tlb_b.find_by_alfid_mut(b_alfid).unwrap();
	assert!(b.icc.open(149, 149, b"aad", &mut late, &late_tag).is_ok());

	// A packet forged under K2's nonce space but presented as if it were still sequence 149
	// must not validate under K1 (no packet validated under the wrong key, §8).
	let a = tlb_a.find_by_alfid_mut(a_alfid).unwrap();
	let mut forged = vec![0xCD];
	let forged_tag = a.icc.seal(165, 165, b"aad", &mut forged);
	let b = tlb_b.find_by_alfid_mut(b_alfid).unwrap();
	assert!(b.icc.open(149, 165, b"aad", &mut forged, &forged_tag).is_err());
}

#[test]
fn multiplication_converges_the_child_to_established_without_disturbing_the_parent() {
	let mut tlb_a = Tlb::new(64);
	let mut tlb_b = Tlb::new(64);

	let a_alfid = tlb_a.allocate_alfid();
	// B's own ALFID for the already-established parent connection; A addresses its child at
	// this ALFID until B's reply teaches it the child's real one (§4.3 edge case (g)).
	let parent_remote_alfid = 777;
	let mut a_parent = SocketItem::new(a_alfid, parent_remote_alfid, 0, addr(9000), 1, 1, no_notice());
	a_parent.state = SocketState::Established;
	a_parent.icc.install_key(vec![3u8; 32], false, 0, 0).unwrap();
	tlb_a.insert(a_parent, None).unwrap();

	let emit = dispatch(&mut tlb_a, Command::Multiply { local_alfid: a_alfid, data: b"forked transaction".to_vec(), end_of_transaction: true }, no_notice()).unwrap();
	let Emit::Multiply { child_alfid: a_child_alfid } = emit else { panic!("expected Emit::Multiply") };

	assert_eq!(tlb_a.find_by_alfid(a_alfid).unwrap().state, SocketState::Established, "parent must be untouched by its own child's fork");
	assert_eq!(tlb_a.find_by_alfid(a_child_alfid).unwrap().state, SocketState::Cloning);
	let (handshake_pair, handshake_sn1, handshake_sn2, handshake_raw_key) = {
		let handshake = tlb_a.find_by_alfid(a_child_alfid).unwrap().multiply_handshake.as_ref().unwrap();
		(handshake.pair, handshake.sn1, handshake.sn2, handshake.raw_key.clone())
	};

	// B derives the same child key from the pair it can already compute — A's new child ALFID
	// (the wire's sender field) paired with its own ALFID for the parent connection (the wire's
	// destination field) — before it has allocated its own new child ALFID at all.
	let (id_initiator, id_responder) = multiply_context(a_child_alfid, parent_remote_alfid);
	assert_eq!((id_initiator, id_responder), (handshake_pair.source.min(handshake_pair.peer), handshake_pair.source.max(handshake_pair.peer)));

	let parent_key_for_b = AeadKey::new(&[3u8; 32]).unwrap();
	let raw_key = derive_next_key(&parent_key_for_b, handshake_sn1, handshake_sn2, id_initiator, id_responder, 32);
	assert_eq!(raw_key, handshake_raw_key);

	// B installs a new SCB indexed by {remoteHost(A), ALFID(A'), parentALFID(A)}.
	let remote_tuple = crate::tlb::RemoteTuple { remote_host: addr(9000), remote_alfid: a_child_alfid, parent_alfid: parent_remote_alfid };
	assert!(tlb_b.find_by_remote(&remote_tuple).is_none(), "no duplicate child for this tuple yet");

	let b_child_alfid = tlb_b.allocate_alfid();
	let mut b_child = SocketItem::new(b_child_alfid, a_child_alfid, parent_remote_alfid, addr(9000), 1, 1, no_notice());
	b_child.state = SocketState::Established;
	b_child.icc.install_key(raw_key.clone(), false, 0, 0).unwrap();
	tlb_b.insert(b_child, Some(remote_tuple)).unwrap();

	assert_eq!(tlb_b.find_by_remote(&remote_tuple).unwrap().local_alfid, b_child_alfid);

	// A's child learns B's real ALFID from the PERSIST reply, promotes to a properly mirrored
	// `IccContext` under the now-known pair, and converges to ESTABLISHED without the parent
	// ever leaving ESTABLISHED itself.
	let a_child = tlb_a.find_by_alfid_mut(a_child_alfid).unwrap();
	a_child.remote_alfid = b_child_alfid;
	a_child.icc = IccContext::new_unkeyed(crate::alfid::FiberIdPair { source: a_child.local_alfid, peer: a_child.remote_alfid });
	a_child.icc.install_key(raw_key, false, 0, 0).unwrap();
	a_child.state = SocketState::Established;

	assert_eq!(tlb_a.find_by_alfid(a_alfid).unwrap().state, SocketState::Established);
	assert_eq!(tlb_a.find_by_alfid(a_child_alfid).unwrap().state, SocketState::Established);
	assert_eq!(tlb_b.find_by_alfid(b_child_alfid).unwrap().state, SocketState::Established);
}
