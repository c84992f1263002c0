//! ALFID allocation: a pre-filled ring of random 32-bit identifiers with circular reuse,
//! giving a monotonic "freshness" bound on reissue (§3, §4.2).

use rand::RngCore;

/// Identifiers at or below this value are "well-known" and never handed out by [`AlfidPool`].
pub const LAST_WELL_KNOWN_ALFID: u32 = 1024;

/// {source, peer} ALFID pair tagging one session for a given remote host (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberIdPair {
	pub source: u32,
	pub peer: u32,
}

impl FiberIdPair {
	pub fn reversed(self) -> Self {
		Self { source: self.peer, peer: self.source }
	}

	pub fn to_bytes(self) -> [u8; 8] {
		let mut buf = [0u8; 8];
		buf[0..4].copy_from_slice(&self.source.to_be_bytes());
		buf[4..8].copy_from_slice(&self.peer.to_be_bytes());
		buf
	}
}

/// A fixed-capacity circular pool of pre-generated ALFIDs (§4.2).
///
/// `RandALFID` pops the head of the ring and pushes it back onto the tail, so an identifier is
/// never reissued until every other slot in the ring has cycled through - a freshness bound
/// against accidental or malicious collision with a recently retired session.
pub struct AlfidPool {
	ring: Vec<u32>,
	head: usize,
}

impl AlfidPool {
	pub fn new(capacity: usize) -> Self {
		let mut pool = Self { ring: Vec::with_capacity(capacity), head: 0 };
		let mut rng = rand::thread_rng();

		while pool.ring.len() < capacity {
			let candidate = rng.next_u32();

			if candidate > LAST_WELL_KNOWN_ALFID {
				pool.ring.push(candidate);
			}
		}

		pool
	}

	/// Allocate a fresh ALFID, optionally hinting at an address to bias selection
	/// (the donor's `RandALFID(hintAddr)` path); this implementation does not use the hint
	/// since promiscuous per-ALFID address registration (§4.2) is out of scope here.
	pub fn allocate(&mut self) -> u32 {
		let id = self.ring[self.head];

		// Replace the slot we just handed out with a freshly generated value before advancing,
		// so the ring keeps producing unseen identifiers rather than a fixed permutation.
		self.ring[self.head] = rand_above_well_known();
		self.head = (self.head + 1) % self.ring.len();

		id
	}
}

fn rand_above_well_known() -> u32 {
	let mut rng = rand::thread_rng();

	loop {
		let candidate = rng.next_u32();

		if candidate > LAST_WELL_KNOWN_ALFID {
			return candidate;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn allocated_ids_are_never_well_known() {
		let mut pool = AlfidPool::new(64);

		for _ in 0..1000 {
			assert!(pool.allocate() > LAST_WELL_KNOWN_ALFID);
		}
	}

	#[test]
	fn fiber_id_pair_reverses() {
		let pair = FiberIdPair { source: 1, peer: 2 };
		assert_eq!(pair.reversed(), FiberIdPair { source: 2, peer: 1 });
	}
}
