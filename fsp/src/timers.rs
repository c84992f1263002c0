//! The per-socket timer wheel (§4.7): one coalescable callback re-armed as `tKeepAlive_ms`
//! evolves, driving retransmit, keep-alive, transient-state timeout, and session-life timeout.
//!
//! Grounded on the donor's `tunnel::timers::Timers`, generalized from the two-timer
//! (rekey/keepalive) wireguard handshake cadence to the single re-armed tick this protocol uses.

use std::time::{Duration, Instant};

use stakker::{timer_max, Cx, MaxTimerKey};

use crate::scb::SocketState;
use crate::Fsp;

/// A transient state aborts if it has not progressed in this long (§4.7).
pub const TRANSIENT_STATE_TIMEOUT: Duration = Duration::from_secs(30);

/// A data-state socket that has not heard from its peer in this long falls back to the
/// transient-timeout cadence (§4.7).
pub const SCAVENGE_THRESHOLD: Duration = Duration::from_secs(60);

/// Absolute ceiling on a session's lifetime, regardless of activity (§4.7).
pub const MAXIMUM_SESSION_LIFE: Duration = Duration::from_secs(24 * 3600);

/// A closed socket is reclaimed after this much additional idle time (§4.7).
pub const CLOSED_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-socket timer bookkeeping. `tick` re-arms itself every call; callers drive state-specific
/// behavior (retransmit, keep-alive, teardown) from the outcome of [`SocketTimers::on_tick`].
pub struct SocketTimers {
	wheel: MaxTimerKey,
	session_begin: Instant,
	last_recv: Instant,
	local_alfid: u32,
}

/// What the timer wheel decided a socket should do on this tick; the caller (the `Fsp` actor)
/// performs the actual packet emission or teardown, since that requires the Lower Interface and
/// TLB the timer module itself does not own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickAction {
	Retransmit,
	SendKeepAlive,
	Timeout,
	ReclaimClosed,
	Idle,
}

impl SocketTimers {
	pub fn new(local_alfid: u32, now: Instant) -> Self {
		Self { wheel: MaxTimerKey::default(), session_begin: now, last_recv: now, local_alfid }
	}

	pub fn note_recv(&mut self, now: Instant) {
		self.last_recv = now;
	}

	/// Arm (or re-arm) the wheel to fire after `keepalive_ms`, coalescing with any
	/// already-pending timer for this socket (§4.7).
	pub fn arm(&mut self, cx: &mut Cx<Fsp>, keepalive_ms: u64) {
		let alfid = self.local_alfid;
		timer_max!(&mut self.wheel, cx.now() + Duration::from_millis(keepalive_ms), [cx], on_timer_tick(alfid));
	}

	pub fn cancel(&mut self, cx: &mut Cx<Fsp>) {
		cx.timer_max_del(self.wheel);
	}

	/// Decide what this tick should do, given the socket's current state (§4.7).
	pub fn on_tick(&self, now: Instant, state: SocketState) -> TickAction {
		match state {
			SocketState::Closed => {
				if now.saturating_duration_since(self.last_recv) > CLOSED_IDLE_TIMEOUT {
					TickAction::ReclaimClosed
				} else {
					TickAction::Idle
				}
			}
			_ if state.is_transient() => {
				if now.saturating_duration_since(self.session_begin) > TRANSIENT_STATE_TIMEOUT {
					TickAction::Timeout
				} else {
					TickAction::Retransmit
				}
			}
			SocketState::Established | SocketState::Committed => {
				if now.saturating_duration_since(self.session_begin) > MAXIMUM_SESSION_LIFE {
					TickAction::Timeout
				} else if now.saturating_duration_since(self.last_recv) > SCAVENGE_THRESHOLD {
					TickAction::Timeout
				} else {
					TickAction::SendKeepAlive
				}
			}
			SocketState::PeerCommit => TickAction::Idle,
			_ => TickAction::Idle,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn established_within_budget_sends_keepalive() {
		let now = Instant::now();
		let timers = SocketTimers::new(1, now);
		assert_eq!(timers.on_tick(now, SocketState::Established), TickAction::SendKeepAlive);
	}

	#[test]
	fn transient_state_past_timeout_fires_timeout() {
		let t0 = Instant::now();
		let timers = SocketTimers::new(1, t0);
		let later = t0 + TRANSIENT_STATE_TIMEOUT + Duration::from_secs(1);
		assert_eq!(timers.on_tick(later, SocketState::ConnectBootstrap), TickAction::Timeout);
	}

	#[test]
	fn established_scavenged_after_silence() {
		let t0 = Instant::now();
		let timers = SocketTimers::new(1, t0);
		let later = t0 + SCAVENGE_THRESHOLD + Duration::from_secs(1);
		assert_eq!(timers.on_tick(later, SocketState::Established), TickAction::Timeout);
	}

	#[test]
	fn closed_socket_reclaimed_after_idle() {
		let t0 = Instant::now();
		let timers = SocketTimers::new(1, t0);
		let later = t0 + CLOSED_IDLE_TIMEOUT + Duration::from_secs(1);
		assert_eq!(timers.on_tick(later, SocketState::Closed), TickAction::ReclaimClosed);
	}
}
