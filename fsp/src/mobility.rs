//! Local-address enumeration for the mobility sweep of §4.8: watching the OS for
//! address-add/remove so a session survives a local network change without a state reset.
//!
//! Grounded on the same `cfg(unix)`/`cfg(windows)` split the donor `runtime` crate uses for its
//! `AsRawFd` abstraction (`runtime/src/lib.rs`'s `sys` module): one syscall-backed implementation
//! behind a thin, always-available function, rather than pulling in a netlink crate for what §6
//! already treats as an abstracted OS dependency ("register a callback for unicast-address-change").

use std::net::SocketAddr;

/// Enumerate this host's current non-loopback unicast addresses, paired with `port`, the same
/// port the Lower Interface binds every configured local address to. Returns `None` where the
/// host has no supported enumeration mechanism, in which case the mobility sweep is a no-op
/// rather than mistaking "unsupported" for "every address withdrawn".
#[cfg(unix)]
pub fn local_addresses(port: u16) -> Option<Vec<SocketAddr>> {
	use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

	let mut head: *mut libc::ifaddrs = std::ptr::null_mut();

	if unsafe { libc::getifaddrs(&mut head) } != 0 {
		return None;
	}

	let mut out = Vec::new();
	let mut cur = head;

	while !cur.is_null() {
		let ifa = unsafe { &*cur };

		if !ifa.ifa_addr.is_null() {
			let family = unsafe { (*ifa.ifa_addr).sa_family } as libc::c_int;

			let ip = if family == libc::AF_INET {
				let sa = unsafe { *(ifa.ifa_addr as *const libc::sockaddr_in) };
				Some(IpAddr::V4(Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr))))
			} else if family == libc::AF_INET6 {
				let sa = unsafe { *(ifa.ifa_addr as *const libc::sockaddr_in6) };
				Some(IpAddr::V6(Ipv6Addr::from(sa.sin6_addr.s6_addr)))
			} else {
				None
			};

			if let Some(ip) = ip {
				if !ip.is_loopback() {
					let addr = SocketAddr::new(ip, port);

					if !out.contains(&addr) {
						out.push(addr);
					}
				}
			}
		}

		cur = ifa.ifa_next;
	}

	unsafe { libc::freeifaddrs(head) };
	Some(out)
}

#[cfg(not(unix))]
pub fn local_addresses(_port: u16) -> Option<Vec<SocketAddr>> {
	None
}
