//! Socket Table (TLB): the fixed-capacity pool of Socket Items, indexed by near-end ALFID and by
//! the `(remote-host, remote-ALFID, parent-ALFID)` tuple MULTIPLY needs (§3, §9 "arena-plus-index").
//!
//! [`collections::sparse::Slab`] is the arena a Socket Item's table index refers into;
//! [`collections::map::Map`] provides each secondary lookup, holding only the key plus the slot
//! index rather than a second copy of the item, mirroring the donor's `Map`-as-index usage.

use std::collections::VecDeque;
use std::net::SocketAddr;

use collections::map::{Filled, Key, Map};
use collections::sparse::Slab;

use crate::alfid::AlfidPool;
use crate::scb::SocketItem;

/// Fixed TLB capacity. Must be a power of two for [`collections::map::Index`] to be valid.
pub const TLB_CAPACITY: usize = 1024;

struct AlfidEntry {
	alfid: u32,
	slot: usize,
	/// The item's own `by_remote` key, if it has one, carried here so `remove()` can delete that
	/// second index entry too instead of leaking it.
	remote: Option<RemoteTuple>,
}

impl Key for AlfidEntry {
	type Type = u32;

	fn key(&self) -> &u32 {
		&self.alfid
	}
}

/// The key MULTIPLY's responder side looks a child session up by (§4.3): the parent's remote
/// host and ALFID, plus the parent session's own local ALFID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoteTuple {
	pub remote_host: SocketAddr,
	pub remote_alfid: u32,
	pub parent_alfid: u32,
}

struct RemoteEntry {
	tuple: RemoteTuple,
	slot: usize,
}

impl Key for RemoteEntry {
	type Type = RemoteTuple;

	fn key(&self) -> &RemoteTuple {
		&self.tuple
	}
}

/// The Socket Table (§3): owns every live Socket Item, the ALFID allocation ring, and the
/// reserved-but-unused LRU list consulted when the free list is exhausted.
pub struct Tlb {
	items: Slab<SocketItem, TLB_CAPACITY>,
	by_alfid: Map<AlfidEntry, TLB_CAPACITY>,
	by_remote: Map<RemoteEntry, TLB_CAPACITY>,
	alfids: AlfidPool,
	/// Reserved-but-unused items (ALFID assigned, no peer traffic yet), oldest first; consulted
	/// for reclaim when the Slab is full (§3).
	reserved_lru: VecDeque<usize>,
}

impl Tlb {
	pub fn new(alfid_pool_capacity: usize) -> Self {
		Self {
			items: Slab::new(),
			by_alfid: Map::default(),
			by_remote: Map::default(),
			alfids: AlfidPool::new(alfid_pool_capacity),
			reserved_lru: VecDeque::new(),
		}
	}

	/// `RandALFID`, guarded against a collision with any ALFID currently live in the table
	/// (§8: "the ALFID pool never yields a value currently present in the TLB").
	pub fn allocate_alfid(&mut self) -> u32 {
		loop {
			let candidate = self.alfids.allocate();

			if self.by_alfid.find(&candidate).is_none() {
				return candidate;
			}
		}
	}

	/// Insert a freshly-allocated Socket Item, indexing it by its own ALFID and, for a MULTIPLY
	/// child or an initiated connection, by its remote tuple.
	pub fn insert(&mut self, item: SocketItem, remote: Option<RemoteTuple>) -> Result<u32, SocketItem> {
		let alfid = item.local_alfid;

		let slot = match self.items.insert(item) {
			Ok(slot) => slot,
			Err(item) => return Err(item),
		};

		self.by_alfid.insert_unique(&alfid).insert(AlfidEntry { alfid, slot, remote });

		if let Some(tuple) = remote {
			self.by_remote.insert_unique(&tuple).insert(RemoteEntry { tuple, slot });
		}

		self.reserved_lru.push_back(slot);
		Ok(alfid)
	}

	pub fn find_by_alfid(&self, alfid: u32) -> Option<&SocketItem> {
		let slot = self.by_alfid.find(&alfid)?.slot;
		self.items.get(slot)
	}

	pub fn find_by_alfid_mut(&mut self, alfid: u32) -> Option<&mut SocketItem> {
		let slot = self.by_alfid.find(&alfid)?.slot;
		self.items.get_mut(slot)
	}

	pub fn find_by_remote(&self, tuple: &RemoteTuple) -> Option<&SocketItem> {
		let slot = self.by_remote.find(tuple)?.slot;
		self.items.get(slot)
	}

	/// Remove a Socket Item by ALFID, freeing its arena slot and both index entries.
	pub fn remove(&mut self, alfid: u32) -> Option<SocketItem> {
		let entry = self.by_alfid.find_entry(&alfid).filled()?;
		let slot = entry.slot;
		let remote = entry.remote;
		entry.remove();

		if let Some(tuple) = remote {
			self.by_remote.find_entry(&tuple).filled().map(Filled::remove);
		}

		self.reserved_lru.retain(|&s| s != slot);
		Some(self.items.remove(slot))
	}

	pub fn len_live(&self) -> usize {
		self.reserved_lru.len()
	}

	/// Every currently live Socket Item's ALFID (§4.8's mobility sweep, which must revalidate
	/// every open connection against a reconciled local address, not just one).
	pub fn live_alfids(&self) -> Vec<u32> {
		self.reserved_lru.iter().filter_map(|&slot| self.items.get(slot)).map(|item| item.local_alfid).collect()
	}
}

#[cfg(test)]
mod tests {
	use std::net::{Ipv4Addr, SocketAddrV4};

	use stakker::Fwd;

	use super::*;
	use crate::notice::Notice;

	fn addr(port: u16) -> SocketAddr {
		SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
	}

	fn item(local: u32, remote: u32) -> SocketItem {
		SocketItem::new(local, remote, 0, addr(1), 1, 1, Fwd::new(|_: Notice| {}))
	}

	#[test]
	fn insert_then_find_by_alfid() {
		let mut tlb = Tlb::new(64);
		let alfid = tlb.allocate_alfid();
		tlb.insert(item(alfid, 5), None).unwrap();

		assert_eq!(tlb.find_by_alfid(alfid).unwrap().local_alfid, alfid);
	}

	#[test]
	fn find_by_remote_tuple_resolves_multiply_child() {
		let mut tlb = Tlb::new(64);
		let tuple = RemoteTuple { remote_host: addr(1), remote_alfid: 7, parent_alfid: 9 };

		let alfid = tlb.allocate_alfid();
		tlb.insert(item(alfid, 7), Some(tuple)).unwrap();

		assert_eq!(tlb.find_by_remote(&tuple).unwrap().local_alfid, alfid);
	}

	#[test]
	fn remove_clears_both_indices() {
		let mut tlb = Tlb::new(64);
		let alfid = tlb.allocate_alfid();
		let tuple = RemoteTuple { remote_host: addr(1), remote_alfid: 7, parent_alfid: 9 };
		tlb.insert(item(alfid, 7), Some(tuple)).unwrap();

		assert!(tlb.remove(alfid).is_some());
		assert!(tlb.find_by_alfid(alfid).is_none());
		assert!(tlb.find_by_remote(&tuple).is_none());
	}

	#[test]
	fn removed_items_remote_tuple_does_not_resolve_after_slot_reuse() {
		let mut tlb = Tlb::new(64);
		let tuple = RemoteTuple { remote_host: addr(1), remote_alfid: 7, parent_alfid: 9 };

		let old_alfid = tlb.allocate_alfid();
		tlb.insert(item(old_alfid, 7), Some(tuple)).unwrap();
		tlb.remove(old_alfid).unwrap();

		// Reinsert with no `by_remote` entry at all; a stale `by_remote` leak would still
		// resolve `tuple` to this freshly-occupied slot.
		let new_alfid = tlb.allocate_alfid();
		tlb.insert(item(new_alfid, 1), None).unwrap();

		assert!(tlb.find_by_remote(&tuple).is_none());
	}

	#[test]
	fn allocated_alfid_never_collides_with_a_live_one() {
		let mut tlb = Tlb::new(8);
		let mut seen = Vec::new();

		for _ in 0..8 {
			let alfid = tlb.allocate_alfid();
			tlb.insert(item(alfid, 1), None).unwrap();
			assert!(!seen.contains(&alfid));
			seen.push(alfid);
		}
	}
}
