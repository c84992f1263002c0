//! Stateless cookie defense against connect-flood DoS (§3, §4.2).
//!
//! Two rolling {timestamp, AEAD key} contexts are retained so a cookie issued just before a
//! rotation still validates afterwards; `INIT_CONNECT`/`ACK_INIT_CONNECT` never allocate a
//! Socket Item, so the attacker gets no state-exhaustion amplification from a spoofed source.

use std::mem;

use rand::RngCore;

use crate::alfid::FiberIdPair;
use crate::icc::aead::{self, AeadKey};

/// Resolves the open question in SPEC_FULL §9: the donor compares
/// `(int64_t)(t1 - cookieContext.timeStamp) < INT_MAX` microseconds (~35.8 minutes). This
/// implementation performs the same comparison as a checked `i64` subtraction with no
/// signed-overflow reinterpretation.
pub const COOKIE_ROTATION_WINDOW_US: i64 = i32::MAX as i64;

struct Rolling {
	timestamp_us: i64,
	key: AeadKey,
}

impl Rolling {
	fn fresh(now_us: i64) -> Self {
		let mut raw = [0u8; 32];
		rand::thread_rng().fill_bytes(&mut raw);
		Self { timestamp_us: now_us, key: AeadKey::new(&raw).expect("32-byte key is valid for AES-256-GCM") }
	}
}

/// The rolling pair of cookie contexts a Lower Interface maintains (§3).
pub struct CookieContext {
	current: Rolling,
	previous: Option<Rolling>,
}

impl CookieContext {
	pub fn new(now_us: i64) -> Self {
		Self { current: Rolling::fresh(now_us), previous: None }
	}

	/// Rotate in a fresh context once the current one has been live for more than
	/// [`COOKIE_ROTATION_WINDOW_US`]; the outgoing context is kept as `previous` so cookies
	/// issued just before the rotation still validate.
	pub fn maybe_rotate(&mut self, now_us: i64) {
		if now_us.saturating_sub(self.current.timestamp_us) > COOKIE_ROTATION_WINDOW_US {
			self.previous = Some(mem::replace(&mut self.current, Rolling::fresh(now_us)));
		}
	}

	/// Compute the cookie for an `ACK_INIT_CONNECT` reply to `pair`'s `INIT_CONNECT`, over the
	/// requester's fixed header bytes, under the current rolling key (§4.2).
	pub fn generate(&self, pair: FiberIdPair, header_bytes: &[u8]) -> [u8; 8] {
		cookie_tag(&self.current, pair, header_bytes)
	}

	/// Validate a cookie echoed back on `CONNECT_REQUEST`, accepting it under either rolling
	/// context provided its issuing timestamp is still within the rotation window of `now_us`
	/// (§8: "verifies iff `|Δ| ≤ INT_MAX`").
	pub fn verify(&self, pair: FiberIdPair, header_bytes: &[u8], cookie: &[u8; 8], now_us: i64) -> bool {
		for ctx in [Some(&self.current), self.previous.as_ref()].into_iter().flatten() {
			let delta = now_us.wrapping_sub(ctx.timestamp_us);

			if delta.unsigned_abs() > COOKIE_ROTATION_WINDOW_US as u64 {
				continue;
			}

			if cookie_tag(ctx, pair, header_bytes) == *cookie {
				return true;
			}
		}

		false
	}
}

fn cookie_tag(ctx: &Rolling, pair: FiberIdPair, header_bytes: &[u8]) -> [u8; 8] {
	let mut aad = Vec::with_capacity(header_bytes.len() + 8);
	aad.extend_from_slice(header_bytes);
	aad.extend_from_slice(&ctx.timestamp_us.to_be_bytes());

	let full = aead::gcm_secure_hash(&ctx.key, pair, ctx.timestamp_us as u32, &aad);

	let mut out = [0u8; 8];
	out.copy_from_slice(&full[..8]);
	out
}
