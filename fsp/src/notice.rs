//! The `FSP_Notify*` / `FSP_IPC_*` error-kind enum of §7, represented in-process as a single
//! [`Notice`] delivered to callers through a `stakker::Fwd` channel (§1.1).

/// One of the outcomes a Socket Item or the command dispatcher reports back to its caller.
///
/// Hot-path validation failures (a malformed packet, an ICC mismatch) are logged and discarded
/// inline rather than routed through `Notice` — see §7: "silently dropped... no oracle for the
/// attacker".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
	/// Transient-state or session-life timeout elapsed. Non-recoverable.
	Timeout,
	/// ICC mismatch on RESET, peer-initiated abort, memory corruption, or operator Reject.
	/// Non-recoverable.
	Reset,
	/// A completed transaction head is ready to be read from the receive ring.
	DataReady,
	/// The peer has marked its side of the transaction complete (PEER_COMMIT entered).
	ToCommit,
	/// A `Listen` command succeeded and the socket is accepting connections.
	Listening,
	/// Seeded into the notice slot at command entry; overwritten if the command succeeds
	/// (§6, `FSP_IPC_CannotReturn`).
	CannotReturn,
	/// A Control Block invariant was violated; raised just before the socket resets.
	MemoryCorruption,
	/// `Connect`'s address resolution failed.
	NameResolutionFailed,
}
