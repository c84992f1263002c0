use super::inner::Core;

/// A fixed-capacity slot pool with O(1) allocate/free via an intrusively-threaded free list.
///
/// Vacant slots store the index of the next vacant slot (`B = usize`); `head` points at the
/// first vacant slot, or `N` once the pool is exhausted.
pub struct Slab<T, const N: usize> {
	head: usize,
	core: Core<T, usize, N>,
}

impl<T, const N: usize> Slab<T, N> {
	#[must_use]
	pub fn new() -> Self {
		Self {
			head: 0,
			core: Core::new(|i| i + 1),
		}
	}

	#[inline]
	pub fn is_full(&self) -> bool {
		self.head == N
	}

	/// Allocate a slot for `t`, returning its index, or give `t` back if the pool is exhausted.
	pub fn insert(&mut self, t: T) -> Result<usize, T> {
		if self.is_full() {
			return Err(t);
		}

		let idx = self.head;

		// SAFETY: `idx` is either 0 (the initial head) or was previously returned as a vacant
		// slot's `next` pointer, so it is in-bounds and currently vacant.
		self.head = unsafe { self.core.take_b(idx, t) };

		Ok(idx)
	}

	/// Free the slot at `idx`, returning its value. `idx` must currently be occupied.
	pub fn remove(&mut self, idx: usize) -> T {
		// SAFETY: caller guarantees `idx` is occupied.
		let t = unsafe { self.core.take_a(idx, self.head) };
		self.head = idx;
		t
	}

	#[inline]
	pub fn contains(&self, idx: usize) -> bool {
		idx < N && unsafe { self.core.is_a(idx) }
	}

	#[inline]
	pub fn get(&self, idx: usize) -> Option<&T> {
		self.contains(idx).then(|| unsafe { self.core.get_a(idx) })
	}

	#[inline]
	pub fn get_mut(&mut self, idx: usize) -> Option<&mut T> {
		self.contains(idx).then(|| unsafe { self.core.get_a_mut(idx) })
	}
}

impl<T, const N: usize> Default for Slab<T, N> {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::Slab;

	#[test]
	fn allocate_and_free_reuses_slots() {
		let mut slab = Slab::<u32, 4>::new();

		let a = slab.insert(1).unwrap();
		let b = slab.insert(2).unwrap();
		let c = slab.insert(3).unwrap();
		let d = slab.insert(4).unwrap();

		assert!(slab.is_full());
		assert!(slab.insert(5).is_err());

		assert_eq!(slab.remove(b), 2);
		assert!(!slab.is_full());

		let e = slab.insert(6).unwrap();
		assert_eq!(e, b);

		assert_eq!(*slab.get(a).unwrap(), 1);
		assert_eq!(*slab.get(c).unwrap(), 3);
		assert_eq!(*slab.get(d).unwrap(), 4);
		assert_eq!(*slab.get(e).unwrap(), 6);
	}

	#[test]
	fn get_on_vacant_slot_is_none() {
		let mut slab = Slab::<u32, 2>::new();
		let a = slab.insert(10).unwrap();
		slab.remove(a);
		assert!(slab.get(a).is_none());
	}
}
