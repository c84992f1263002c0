//! Typed error surface at the command-dispatch and daemon-bootstrap boundary (§1.1).
//!
//! Hot-path packet validation (ICC mismatch, malformed header) stays a log-and-discard
//! `Result<T, ()>` per §7 — there is no caller there to hand a typed error to, and the protocol
//! deliberately gives an attacker no oracle. `Error` is for the two places a caller outside that
//! hot loop needs to distinguish *why* something failed: issuing a [`crate::command::Command`],
//! and standing the daemon itself up.

use std::fmt;

use crate::notice::Notice;

/// Everything [`crate::command::dispatch`] and daemon bootstrap can fail with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
	/// The command failed for one of the reasons already named by [`Notice`].
	Notice(Notice),
	/// The Lower Interface could not bind its local sockets.
	Bind,
}

impl From<Notice> for Error {
	fn from(notice: Notice) -> Self {
		Self::Notice(notice)
	}
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Notice(notice) => write!(f, "command rejected: {notice:?}"),
			Self::Bind => write!(f, "failed to bind Lower Interface"),
		}
	}
}

impl std::error::Error for Error {}
