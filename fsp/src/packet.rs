//! Wire format: the 24-byte fixed header shared by every opcode, plus the optional
//! trailing sub-header chain (§4.1).

use utils::bytes::Cast;
use utils::endian::{u32be, u64be};

/// Offset of the end-of-header / start-of-payload point must be a multiple of this.
pub const HEADER_ALIGN: usize = 8;

/// Upper bound on the size of any on-wire FSP block (header + sub-headers + payload).
pub const MAX_LLS_BLOCK_SIZE: usize = 1472;

/// Opcodes carried in the fixed header (§4.1). Values are arbitrary but stable within this
/// implementation; they are not required to match the donor project's numbering since no
/// interop with it is in scope.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
	InitConnect = 1,
	AckInitConnect = 2,
	ConnectRequest = 3,
	AckConnectReq = 4,
	Reset = 5,
	Persist = 6,
	PureData = 7,
	KeepAlive = 8,
	AckFlush = 9,
	Release = 10,
	Multiply = 11,
	NulCommit = 12,
}

impl Opcode {
	pub fn from_u8(v: u8) -> Option<Self> {
		Some(match v {
			1 => Self::InitConnect,
			2 => Self::AckInitConnect,
			3 => Self::ConnectRequest,
			4 => Self::AckConnectReq,
			5 => Self::Reset,
			6 => Self::Persist,
			7 => Self::PureData,
			8 => Self::KeepAlive,
			9 => Self::AckFlush,
			10 => Self::Release,
			11 => Self::Multiply,
			12 => Self::NulCommit,
			_ => return None,
		})
	}
}

/// Flag bits packed into the top byte of the fourth header word, alongside the advertised
/// receive-window size in the remaining 24 bits.
pub mod flags {
	pub const END_OF_TRANSACTION: u32 = 1 << 31;
	/// Mask of the advertised receive-window size, in pages, occupying the low 24 bits.
	pub const WINDOW_MASK: u32 = (1 << 24) - 1;
}

/// The 24-byte fixed header present on every FSP packet, in network byte order.
#[repr(C)]
#[derive(Cast)]
pub struct Header {
	pub version: u8,
	pub opcode: u8,
	/// Offset in bytes from the start of the fixed header to the start of the payload.
	/// Must be a multiple of [`HEADER_ALIGN`] and no greater than [`MAX_LLS_BLOCK_SIZE`].
	pub hsp: utils::endian::u16be,
	pub sequence_no: u32be,
	pub expected_sn: u32be,
	/// High bit is [`flags::END_OF_TRANSACTION`]; low 24 bits are the advertised receive window.
	pub flags_window: u32be,
	/// 64-bit truncated MAC (ICC), computed last over everything preceding it.
	pub integrity: u64be,
}

pub const CURRENT_VERSION: u8 = 1;

impl Header {
	pub fn flags_window(flags: u32, window_pages: u32) -> u32be {
		(flags | (window_pages & flags::WINDOW_MASK)).into()
	}

	pub fn end_of_transaction(&self) -> bool {
		self.flags_window.get() & flags::END_OF_TRANSACTION != 0
	}

	pub fn window_pages(&self) -> u32 {
		self.flags_window.get() & flags::WINDOW_MASK
	}
}

/// Four 64-bit subnet prefixes describing the sender's other interfaces, for mobility (§4.8).
/// Carried inside [`ConnectParam`] rather than as a free-standing sub-header, since every opcode
/// that needs one carries at most one (§4.1's general offset-chained sub-header list collapses to
/// a single fixed slot per opcode in this implementation — the opcode itself already says which
/// one to expect, so no chain-of-trailers bookkeeping is needed to disambiguate it).
#[repr(C)]
#[derive(Cast, Clone, Copy)]
pub struct PeerSubnets {
	pub prefixes: [u64be; 4],
}

/// One run-length pair in a [`SelectiveNack`] gap list: `gap_width` missing packets followed
/// by `data_length` received packets.
#[repr(C)]
#[derive(Cast, Clone, Copy)]
pub struct GapDescriptor {
	pub gap_width: utils::endian::u16be,
	pub data_length: utils::endian::u16be,
}

/// Fixed prefix of a SELECTIVE_NACK sub-header; the gap descriptor array follows in the
/// remaining sub-header bytes (§4.4).
#[repr(C)]
#[derive(Cast, Clone, Copy)]
pub struct SelectiveNackHeader {
	pub expected_sn: u32be,
	pub gap_count: u32be,
}

/// CONNECT_PARAM sub-header, carried on CONNECT_REQUEST and ACK_CONNECT_REQ (§4.1, §4.3).
#[repr(C)]
#[derive(Cast, Clone, Copy)]
pub struct ConnectParam {
	pub subnets: PeerSubnets,
	pub listener_alfid: u32be,
	pub time_delta: u32be,
	pub cookie: [u8; 8],
}
