//! BLAKE2b-keyed MAC, regime 3 of the ICC (§4.5): used when the connection's ICC context has
//! `noEncrypt=true`. Authenticates the header, optional sub-headers and the plaintext payload;
//! the payload itself is never enciphered.

use blake2::digest::consts::U8;
use blake2::digest::{KeyInit, Mac, Update};
use blake2::Blake2bMac;

/// Compute the 8-byte truncated BLAKE2b-keyed MAC over `chunks`, in order.
pub fn mac(key: &[u8], chunks: &[&[u8]]) -> [u8; 8] {
	let mut mac = Blake2bMac::<U8>::new_from_slice(key).expect("BLAKE2b accepts keys up to 64 bytes");

	for chunk in chunks {
		Mac::update(&mut mac, chunk);
	}

	let mut out = [0u8; 8];
	out.copy_from_slice(&mac.finalize().into_bytes());
	out
}
