//! The per-connection Integrity Check Code context (§3, §4.5): dispatches each packet to one of
//! four regimes by sequence number, and carries the {current, previous} key rotation needed for
//! seamless rekeying.

pub mod aead;
pub mod crc64;
pub mod mac;

use std::mem;

pub use aead::{derive_next_key, AeadKey};

use crate::alfid::FiberIdPair;

/// A connection's session key, retained in both its raw and (where applicable) AEAD-ready form.
///
/// `noEncrypt` connections only ever need the raw bytes (BLAKE2b-keyed MAC, regime 3); AEAD
/// connections additionally need an [`AeadKey`] (regime 4). A `MULTIPLY`-derived 384-bit key is
/// only valid under the MAC regime, since AES-GCM has no 384-bit variant (§4.5).
pub enum KeyMaterial {
	Aead { raw: Vec<u8>, aead: AeadKey },
	MacOnly { raw: Vec<u8> },
}

impl KeyMaterial {
	pub fn new(raw: Vec<u8>, no_encrypt: bool) -> Option<Self> {
		Some(if no_encrypt {
			Self::MacOnly { raw }
		} else {
			let aead = AeadKey::new(&raw)?;
			Self::Aead { raw, aead }
		})
	}

	fn raw(&self) -> &[u8] {
		match self {
			Self::Aead { raw, .. } => raw,
			Self::MacOnly { raw } => raw,
		}
	}
}

enum Regime {
	/// Regime 1 (and, as `previous`, regime 2 — the saved-CRC fallback): the pre-keyed CRC64
	/// seed computed independently for each direction.
	PreKeyed { send_seed: u64, recv_seed: u64 },
	/// Regimes 3 and 4: a real session key, BLAKE2b-MAC'd or AEAD-sealed depending on
	/// `noEncrypt`.
	Keyed(KeyMaterial),
}

/// LLS-private per-connection ICC state (§3).
pub struct IccContext {
	pair: FiberIdPair,
	no_encrypt: bool,
	current: Regime,
	previous: Option<Regime>,
	sn_first_send_with_curr_key: u32,
	sn_first_recv_with_curr_key: u32,
	/// Key-life counter in packets (§3); tracked for the ULA's rekey-scheduling policy, which
	/// is out of core — this context only counts, it does not itself decide to rekey.
	packets_since_rekey: u64,
}

impl IccContext {
	/// The initial context for a connection that has not yet completed a key exchange:
	/// `CONNECT_REQUEST` through `ACK_CONNECT_REQ` validate under regime 1 (§4.5).
	pub fn new_unkeyed(pair: FiberIdPair) -> Self {
		Self {
			pair,
			no_encrypt: false,
			current: Regime::PreKeyed { send_seed: crc64::seed(pair), recv_seed: crc64::seed(pair.reversed()) },
			previous: None,
			sn_first_send_with_curr_key: 0,
			sn_first_recv_with_curr_key: 0,
			packets_since_rekey: 0,
		}
	}

	/// `InstallKey`: atomically promote `current` to `previous` and install the new key,
	/// recording the first sequence number on each side that authenticates under it (§4.5,
	/// §4.6). The receive-side snapshot stands in for the control-block field
	/// `nextKey$initialSN` of the donor (§4.5).
	pub fn install_key(&mut self, raw_key: Vec<u8>, no_encrypt: bool, next_send_sn: u32, next_recv_sn: u32) -> Option<()> {
		let material = KeyMaterial::new(raw_key, no_encrypt)?;
		let old = mem::replace(&mut self.current, Regime::Keyed(material));
		self.previous = Some(old);
		self.no_encrypt = no_encrypt;
		self.sn_first_send_with_curr_key = next_send_sn;
		self.sn_first_recv_with_curr_key = next_recv_sn;
		self.packets_since_rekey = 0;
		Some(())
	}

	/// Whether the original CRC64 seeds are still reachable as `previous`, i.e. no real key
	/// has yet been installed twice (§3's `savedCRC`).
	pub fn saved_crc(&self) -> bool {
		matches!(self.previous, Some(Regime::PreKeyed { .. }))
	}

	/// The current session's AEAD key, if this connection is keyed and not running under
	/// `noEncrypt`. `MULTIPLY` requires this (§4.3 edge case (h)): a BLAKE2b-MAC-only parent has
	/// no AEAD key to derive a child strength from.
	pub fn current_aead_key(&self) -> Option<&AeadKey> {
		match &self.current {
			Regime::Keyed(KeyMaterial::Aead { aead, .. }) => Some(aead),
			_ => None,
		}
	}

	fn regime_for_send(&self, seq_no: u32) -> &Regime {
		if seq_no >= self.sn_first_send_with_curr_key {
			&self.current
		} else {
			self.previous.as_ref().unwrap_or(&self.current)
		}
	}

	fn regime_for_recv(&self, seq_no: u32) -> &Regime {
		if seq_no >= self.sn_first_recv_with_curr_key {
			&self.current
		} else {
			self.previous.as_ref().unwrap_or(&self.current)
		}
	}

	/// Seal `payload` in place for outbound sequence `seq_no`, returning the 8-byte integrity
	/// tag for the fixed header's `integrity` field (§4.5).
	pub fn seal(&mut self, seq_no: u32, salt: u32, aad: &[u8], payload: &mut Vec<u8>) -> [u8; 8] {
		self.packets_since_rekey += 1;
		let pair = self.pair;

		match self.regime_for_send(seq_no) {
			Regime::PreKeyed { send_seed, .. } => pre_keyed_checksum(*send_seed, aad, payload),
			Regime::Keyed(material) => seal_keyed(material, self.no_encrypt, pair, salt, aad, payload),
		}
	}

	/// Validate and, for AEAD connections, decrypt `payload` in place against inbound sequence
	/// `seq_no`. Returns `Err(())` on any mismatch — the caller silently drops the packet (§7).
	pub fn open(&self, seq_no: u32, salt: u32, aad: &[u8], payload: &mut Vec<u8>, tag: &[u8; 8]) -> Result<(), ()> {
		let pair = self.pair.reversed();

		match self.regime_for_recv(seq_no) {
			Regime::PreKeyed { recv_seed, .. } => {
				if pre_keyed_checksum(*recv_seed, aad, payload) == *tag {
					Ok(())
				} else {
					Err(())
				}
			}
			Regime::Keyed(material) => open_keyed(material, self.no_encrypt, pair, salt, aad, payload, tag),
		}
	}
}

fn pre_keyed_checksum(seed: u64, aad: &[u8], payload: &[u8]) -> [u8; 8] {
	let mut data = Vec::with_capacity(aad.len() + payload.len());
	data.extend_from_slice(aad);
	data.extend_from_slice(payload);
	crc64::checksum(seed, &data).to_be_bytes()
}

fn seal_keyed(material: &KeyMaterial, no_encrypt: bool, pair: FiberIdPair, salt: u32, aad: &[u8], payload: &mut Vec<u8>) -> [u8; 8] {
	if no_encrypt {
		mac::mac(material.raw(), &[aad, payload])
	} else {
		let KeyMaterial::Aead { aead, .. } = material else {
			unreachable!("noEncrypt=false connections always install an AEAD-capable key")
		};
		aead.seal(pair, salt, aad, payload)
	}
}

fn open_keyed(material: &KeyMaterial, no_encrypt: bool, pair: FiberIdPair, salt: u32, aad: &[u8], payload: &mut Vec<u8>, tag: &[u8; 8]) -> Result<(), ()> {
	if no_encrypt {
		if mac::mac(material.raw(), &[aad, payload]) == *tag {
			Ok(())
		} else {
			Err(())
		}
	} else {
		let KeyMaterial::Aead { aead, .. } = material else {
			return Err(());
		};
		aead.open(pair, salt, aad, payload, tag)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn pair() -> FiberIdPair {
		FiberIdPair { source: 1, peer: 2 }
	}

	#[test]
	fn unkeyed_seal_then_open_round_trips() {
		let send = IccContext::new_unkeyed(pair());
		let recv = IccContext::new_unkeyed(pair().reversed());

		let mut buf = b"hello".to_vec();
		let tag = send.regime_for_send(0);
		let _ = tag;

		let mut send = send;
		let mac = send.seal(5, 0, b"aad", &mut buf);
		assert!(recv.open(5, 0, b"aad", &mut buf, &mac).is_ok());
	}

	#[test]
	fn rekey_switches_regime_at_threshold() {
		let mut send = IccContext::new_unkeyed(pair());
		let mut recv = IccContext::new_unkeyed(pair().reversed());

		send.install_key(vec![7u8; 32], false, 100, 100).unwrap();
		recv.install_key(vec![7u8; 32], false, 100, 100).unwrap();

		assert!(send.saved_crc());

		// Sequence 50 predates the rotation: still validated by the saved CRC64 (regime 2).
		let mut old = b"late arrival".to_vec();
		let old_tag = send.seal(50, 0, b"aad", &mut old);
		assert!(recv.open(50, 0, b"aad", &mut old, &old_tag).is_ok());

		// Sequence 150 uses the new AEAD key (regime 4).
		let mut fresh = b"in flight".to_vec();
		let fresh_tag = send.seal(150, 0, b"aad", &mut fresh);
		assert!(recv.open(150, 0, b"aad", &mut fresh, &fresh_tag).is_ok());
	}

	#[test]
	fn no_encrypt_leaves_payload_in_cleartext() {
		let mut send = IccContext::new_unkeyed(pair());
		let recv = {
			let mut r = IccContext::new_unkeyed(pair().reversed());
			r.install_key(vec![9u8; 32], true, 0, 0).unwrap();
			r
		};
		send.install_key(vec![9u8; 32], true, 0, 0).unwrap();

		let mut buf = b"visible payload".to_vec();
		let tag = send.seal(1, 0, b"aad", &mut buf);

		assert_eq!(&buf, b"visible payload");
		assert!(recv.open(1, 0, b"aad", &mut buf, &tag).is_ok());
	}
}
