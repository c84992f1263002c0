//! Pre-keyed CRC64, regime 1 of the ICC (§4.5): the initial check code before any real key
//! material has been installed, and the fallback used briefly after a rotation (regime 2).

use crc::{Crc, CRC_64_XZ};

use crate::alfid::FiberIdPair;

static CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);

/// Fixed key material mixed into the pre-keyed CRC64 seed. Stands in for the connection's
/// static pre-shared secret, which the out-of-core ULA layer is responsible for supplying; a
/// constant placeholder keeps this primitive exercisable without that layer.
const FIXED_KEY_MATERIAL: &[u8] = b"fsp-lls-pre-keyed-crc64-seed";

/// Precompute the CRC64 seed used to authenticate packets before a session key exists, over
/// `pair` concatenated with the fixed key material (§4.5 regime 1).
///
/// Send-side and receive-side each call this with a differently-directed [`FiberIdPair`] (the
/// pair as transmitted, and its reverse), yielding the two independent seeds the spec calls for.
pub fn seed(pair: FiberIdPair) -> u64 {
	let mut digest = CRC64.digest();
	digest.update(&pair.to_bytes());
	digest.update(FIXED_KEY_MATERIAL);
	digest.finalize()
}

/// Compute the truncated (64-bit) integrity code for `data` under a precomputed `seed`.
pub fn checksum(seed: u64, data: &[u8]) -> u64 {
	let mut digest = CRC64.digest();
	digest.update(&seed.to_be_bytes());
	digest.update(data);
	digest.finalize()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn send_and_receive_seeds_differ() {
		let pair = FiberIdPair { source: 1, peer: 2 };
		assert_ne!(seed(pair), seed(pair.reversed()));
	}

	#[test]
	fn checksum_is_deterministic() {
		let s = seed(FiberIdPair { source: 10, peer: 20 });
		assert_eq!(checksum(s, b"hello"), checksum(s, b"hello"));
		assert_ne!(checksum(s, b"hello"), checksum(s, b"world"));
	}
}
