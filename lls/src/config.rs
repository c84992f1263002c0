//! Daemon configuration (§1.1, §9): a flat CLI-parsed struct, no external config file format,
//! consistent with the donor's own lack of one.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use clap::Parser;

/// Default UDP tunnel port this implementation binds to when `--bind` carries no explicit port.
/// The specification leaves the concrete value unspecified (§4.1 just names `DEFAULT_FSP_UDPPORT`);
/// this is an implementation choice, recorded in DESIGN.md.
pub const DEFAULT_FSP_UDPPORT: u16 = 6530;

/// Upper bound on the number of local addresses a Socket Item's `AddressSet` remembers at once
/// (§3, §4.8).
pub const MAX_PHY_INTERFACES: usize = 4;

#[derive(Parser, Debug)]
#[command(name = "lls", about = "Flexible Session Protocol lower-layer service daemon")]
pub struct Config {
	/// Local address(es) to bind the UDP/IPv4 tunnel to. May be repeated; defaults to the
	/// wildcard address on `DEFAULT_FSP_UDPPORT`.
	#[arg(long = "bind", value_name = "ADDR")]
	bind: Vec<SocketAddr>,

	/// Capacity of the ALFID allocation ring and Socket Table (§3: `TLB_CAPACITY`-scale knob).
	#[arg(long, default_value_t = 1024)]
	pub alfid_pool_capacity: usize,

	/// Logging verbosity.
	#[arg(long, value_enum, default_value = "info")]
	pub log_level: LogLevel,
}

impl Config {
	/// Fully resolved bind addresses, falling back to the wildcard address on
	/// [`DEFAULT_FSP_UDPPORT`] when none were given on the command line.
	pub fn bind_addresses(&self) -> Vec<SocketAddr> {
		if self.bind.is_empty() {
			vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_FSP_UDPPORT)]
		} else {
			self.bind.clone()
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
	Trace,
	Debug,
	Info,
	Warn,
	Error,
}

impl From<LogLevel> for log::LevelFilter {
	fn from(level: LogLevel) -> Self {
		match level {
			LogLevel::Trace => log::LevelFilter::Trace,
			LogLevel::Debug => log::LevelFilter::Debug,
			LogLevel::Info => log::LevelFilter::Info,
			LogLevel::Warn => log::LevelFilter::Warn,
			LogLevel::Error => log::LevelFilter::Error,
		}
	}
}
