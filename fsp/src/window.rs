//! Send/receive sliding windows and the SELECTIVE_NACK gap-run logic that drives
//! retransmission (§4.4).
//!
//! Each ring is a [`collections::sparse::Ring`] of fixed capacity [`WINDOW_CAPACITY`], the same
//! fixed-capacity pool primitive the donor TLB uses for its socket-item arena, generalized here
//! to hold per-sequence-number packet slots instead of per-ALFID connection state.

use std::time::{Duration, Instant};

use collections::sparse::Ring;

use crate::packet::Opcode;

/// Ring capacity for both the send and receive window of a Socket Item. The spec leaves
/// `ringSize` as a deployment constant; this implementation fixes it so the window ring can be
/// sized at compile time.
pub const WINDOW_CAPACITY: usize = 256;

/// A gap descriptor in native form, alternating "missing" and "received" run lengths above
/// `expectedSN` (§4.4). Converted to/from the wire [`crate::packet::GapDescriptor`] at the
/// packet-assembly boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GapRun {
	pub gap_width: u16,
	pub data_length: u16,
}

/// Upper bound on the number of gap runs a single SELECTIVE_NACK sub-header can carry while
/// staying within [`crate::packet::MAX_LLS_BLOCK_SIZE`].
pub const MAX_GAP_RUNS: usize = 64;

/// One ring slot: opcode, payload, and the four completion flags of §3.
pub struct Slot {
	pub opcode: Opcode,
	pub data: Vec<u8>,
	pub end_of_transaction: bool,
	pub completed: bool,
	pub sent: bool,
	pub acknowledged: bool,
	pub time_sent: Option<Instant>,
	pub time_recv: Option<Instant>,
}

impl Slot {
	fn produced(opcode: Opcode, data: Vec<u8>, end_of_transaction: bool) -> Self {
		Self {
			opcode,
			data,
			end_of_transaction,
			completed: true,
			sent: false,
			acknowledged: false,
			time_sent: None,
			time_recv: None,
		}
	}

	fn received(opcode: Opcode, data: Vec<u8>, end_of_transaction: bool, now: Instant) -> Self {
		Self {
			opcode,
			data,
			end_of_transaction,
			completed: true,
			sent: false,
			acknowledged: false,
			time_sent: None,
			time_recv: Some(now),
		}
	}
}

fn slot_index(sn: u32) -> usize {
	(sn % WINDOW_CAPACITY as u32) as usize
}

/// The outbound sliding window: `[sendWindowFirstSN, sendWindowLimitSN)` (§4.4).
pub struct SendWindow {
	pub first_sn: u32,
	pub next_sn: u32,
	pub buffer_next_sn: u32,
	pub limit_sn: u32,
	ring: Ring<Slot, WINDOW_CAPACITY>,
}

impl SendWindow {
	pub fn new(initial_sn: u32) -> Self {
		Self {
			first_sn: initial_sn,
			next_sn: initial_sn,
			buffer_next_sn: initial_sn,
			limit_sn: initial_sn.wrapping_add(WINDOW_CAPACITY as u32),
			ring: Ring::default(),
		}
	}

	fn assert_invariant(&self) {
		debug_assert!(self.first_sn <= self.next_sn, "sendWindowFirstSN <= sendWindowNextSN");
		debug_assert!(self.next_sn <= self.buffer_next_sn, "sendWindowNextSN <= sendBufferNextSN");
		debug_assert!(self.buffer_next_sn <= self.limit_sn, "sendBufferNextSN <= sendWindowLimitSN");
	}

	/// Reserve the next sequence number for a packet produced by a `Send`/`Commit` command,
	/// marking it IS_COMPLETED immediately since the whole payload is handed over at once.
	/// Returns `None` if the send window is full.
	pub fn enqueue(&mut self, opcode: Opcode, data: Vec<u8>, end_of_transaction: bool) -> Option<u32> {
		if self.buffer_next_sn >= self.limit_sn {
			return None;
		}

		let sn = self.buffer_next_sn;
		self.buffer_next_sn += 1;
		self.ring.insert(slot_index(sn), Slot::produced(opcode, data, end_of_transaction));
		self.assert_invariant();
		Some(sn)
	}

	/// The next packet ready for emission, if any: completed, and within
	/// `min(sendBufferNextSN, sendWindowLimitSN)` (§4.4). Does not mark it sent.
	pub fn ready_to_emit(&self) -> Option<u32> {
		if self.next_sn >= self.buffer_next_sn.min(self.limit_sn) {
			return None;
		}

		self.ring.get(slot_index(self.next_sn)).filter(|s| s.completed).map(|_| self.next_sn)
	}

	pub fn get(&self, sn: u32) -> Option<&Slot> {
		self.ring.get(slot_index(sn))
	}

	/// Mark `sn` sent, recording the send timestamp and advancing `sendWindowNextSN` if it was
	/// the packet at the head of the unsent run.
	pub fn mark_sent(&mut self, now: Instant, sn: u32) {
		if let Some(slot) = self.ring.get_mut(slot_index(sn)) {
			slot.sent = true;
			slot.time_sent = Some(now);
		}

		if sn == self.next_sn {
			self.next_sn += 1;
		}

		self.assert_invariant();
	}

	/// Mark `sn` acknowledged. A packet may only become IS_ACKNOWLEDGED if IS_SENT was set
	/// (§8); returns the observed round-trip time when the packet carried a send timestamp.
	pub fn ack(&mut self, now: Instant, sn: u32) -> Option<Duration> {
		let slot = self.ring.get_mut(slot_index(sn))?;

		if !slot.sent {
			return None;
		}

		slot.acknowledged = true;
		slot.time_sent.map(|t| now.saturating_duration_since(t))
	}

	/// Slide `sendWindowFirstSN` past a contiguous run of acknowledged packets at the head,
	/// freeing their slots. Returns the number of packets the window advanced by.
	pub fn slide(&mut self) -> u32 {
		let before = self.first_sn;

		while self.first_sn < self.next_sn {
			let idx = slot_index(self.first_sn);

			match self.ring.get(idx) {
				Some(slot) if slot.acknowledged => {
					self.ring.remove(idx);
					self.first_sn += 1;
				}
				_ => break,
			}
		}

		self.first_sn - before
	}

	/// Apply an inbound SELECTIVE_NACK (§4.4): acknowledge everything implied received, and
	/// return the sequence numbers whose "missing" runs are older than `resend_after` and
	/// should be retransmitted with a fresh ICC.
	pub fn apply_snack(&mut self, now: Instant, expected_sn: u32, gaps: &[GapRun], resend_after: Duration) -> Vec<u32> {
		let mut sn = self.first_sn;

		while sn < expected_sn && sn < self.next_sn {
			self.ack(now, sn);
			sn += 1;
		}

		let mut resend = Vec::new();
		let mut cursor = expected_sn;

		for gap in gaps {
			for missing in cursor..cursor.wrapping_add(gap.gap_width as u32) {
				if let Some(slot) = self.ring.get(slot_index(missing)) {
					if slot.sent && !slot.acknowledged {
						let stale = slot.time_sent.map_or(true, |t| now.saturating_duration_since(t) >= resend_after);

						if stale {
							resend.push(missing);
						}
					}
				}
			}

			cursor = cursor.wrapping_add(gap.gap_width as u32);

			for received in cursor..cursor.wrapping_add(gap.data_length as u32) {
				self.ack(now, received);
			}

			cursor = cursor.wrapping_add(gap.data_length as u32);
		}

		self.slide();
		resend
	}

	/// Refresh a stale slot's payload ahead of a resend triggered by [`Self::apply_snack`]; the
	/// ICC is recomputed by the caller at emission time since the key context lives outside the
	/// window.
	pub fn clear_sent(&mut self, sn: u32) {
		if let Some(slot) = self.ring.get_mut(slot_index(sn)) {
			slot.sent = false;
			slot.time_sent = None;
		}
	}
}

/// The inbound sliding window: `[recvWindowFirstSN, recvWindowFirstSN + capacity)` (§4.4).
pub struct RecvWindow {
	pub first_sn: u32,
	highest: Option<u32>,
	ring: Ring<Slot, WINDOW_CAPACITY>,
}

impl RecvWindow {
	pub fn new(initial_sn: u32) -> Self {
		Self { first_sn: initial_sn, highest: None, ring: Ring::default() }
	}

	/// Place an inbound packet at sequence `sn`. Returns `false` if `sn` falls outside the
	/// window and was dropped (§4.4).
	pub fn place(&mut self, sn: u32, opcode: Opcode, data: Vec<u8>, end_of_transaction: bool, now: Instant) -> bool {
		if sn < self.first_sn || sn >= self.first_sn.wrapping_add(WINDOW_CAPACITY as u32) {
			return false;
		}

		self.ring.insert(slot_index(sn), Slot::received(opcode, data, end_of_transaction, now));
		self.highest = Some(self.highest.map_or(sn, |h| h.max(sn)));
		true
	}

	/// Drain the contiguous run of completed slots starting at `recvWindowFirstSN`, in order,
	/// advancing the window past them (§4.4: "a completed transaction head is delivered to ULA
	/// in order").
	pub fn drain_ready(&mut self) -> Vec<(u32, Slot)> {
		let mut out = Vec::new();

		loop {
			let idx = slot_index(self.first_sn);

			match self.ring.remove(idx) {
				Some(slot) => {
					out.push((self.first_sn, slot));
					self.first_sn += 1;
				}
				None => break,
			}
		}

		out
	}

	/// Build the SELECTIVE_NACK gap list: `expectedSN` is the smallest unreceived sequence,
	/// and the run list alternates missing/received lengths up to the highest sequence seen so
	/// far, bounded to [`MAX_GAP_RUNS`] runs (§4.4).
	pub fn generate_snack(&self) -> (u32, Vec<GapRun>) {
		let Some(highest) = self.highest else {
			return (self.first_sn, Vec::new());
		};

		let mut gaps = Vec::new();
		let mut sn = self.first_sn;

		while sn <= highest && gaps.len() < MAX_GAP_RUNS {
			let gap_start = sn;

			while sn <= highest && self.ring.get(slot_index(sn)).is_none() {
				sn += 1;
			}

			let gap_width = sn - gap_start;
			let data_start = sn;

			while sn <= highest && self.ring.get(slot_index(sn)).is_some() {
				sn += 1;
			}

			let data_length = sn - data_start;

			if gap_width == 0 && data_length == 0 {
				break;
			}

			gaps.push(GapRun {
				gap_width: gap_width.min(u16::MAX as u32) as u16,
				data_length: data_length.min(u16::MAX as u32) as u16,
			});
		}

		(self.first_sn, gaps)
	}
}
