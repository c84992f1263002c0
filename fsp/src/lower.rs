//! Lower Interface (§4.2): the set of bound local sockets, the unbound send socket, and the
//! rolling cookie contexts.
//!
//! The donor's `runtime::Io<T>` wraps a single *connected* socket and delivers reads through a
//! `Fwd<Slice>` registered once with the reactor's poll loop (`recv()`/`send()` over a fixed
//! peer). FSP's Lower Interface instead multiplexes many peers over one unconnected bound UDP
//! socket per local address and needs the source address of every datagram, which a connected
//! `recv()` cannot report. Rather than stretch `Io` to a shape it does not fit, this module keeps
//! its own minimal non-blocking `recv_from`/`send_to` pair directly over `std::net::UdpSocket`,
//! drained by an explicit `poll_recv` the `Fsp` actor calls from a short repeating timer — still
//! single-threaded and still cooperating with the same `stakker` reactor, just without `Io`'s
//! per-fd poll registration. See DESIGN.md for the full grounding note on this deviation.

use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};

use log::{trace, warn};

use crate::cookie::CookieContext;

/// One inbound datagram, with the local address it arrived on (needed to answer from the same
/// interface) and the address it came from (the mobility/cookie source).
pub struct Inbound {
	pub local: SocketAddr,
	pub remote: SocketAddr,
	pub data: Vec<u8>,
}

/// Owns one non-blocking bound `UdpSocket` per configured local address, plus the unbound send
/// socket and the rolling cookie contexts (§3, §4.2).
pub struct LowerInterface {
	bound: Vec<(SocketAddr, UdpSocket)>,
	send_socket: UdpSocket,
	pub cookies: CookieContext,
}

impl LowerInterface {
	pub fn bind(locals: &[SocketAddr], now_us: i64) -> std::io::Result<Self> {
		let mut bound = Vec::with_capacity(locals.len());

		for &addr in locals {
			let socket = UdpSocket::bind(addr)?;
			socket.set_nonblocking(true)?;
			bound.push((addr, socket));
		}

		let send_socket = UdpSocket::bind(match locals.first() {
			Some(SocketAddr::V6(_)) => "[::]:0".parse().unwrap(),
			_ => "0.0.0.0:0".parse().unwrap(),
		})?;
		send_socket.set_nonblocking(true)?;

		Ok(Self { bound, send_socket, cookies: CookieContext::new(now_us) })
	}

	pub fn local_addresses(&self) -> impl Iterator<Item = SocketAddr> + '_ {
		self.bound.iter().map(|(addr, _)| *addr)
	}

	/// Re-enumerate bound sockets against `current`: drop any no longer present, bind any new
	/// one. Returns whether the set actually changed, which is the mobility trigger of §4.8.
	pub fn reconcile_addresses(&mut self, current: &[SocketAddr]) -> std::io::Result<bool> {
		let mut changed = false;

		self.bound.retain(|(addr, _)| {
			let keep = current.contains(addr);
			changed |= !keep;
			keep
		});

		for &addr in current {
			if !self.bound.iter().any(|(a, _)| *a == addr) {
				let socket = UdpSocket::bind(addr)?;
				socket.set_nonblocking(true)?;
				self.bound.push((addr, socket));
				changed = true;
			}
		}

		Ok(changed)
	}

	/// Drain every bound socket of whatever is immediately available, without blocking.
	/// Oversize datagrams are truncated by the OS and handled as malformed by the packet parser;
	/// genuine I/O errors are logged and the socket skipped for this pass (§4.2: "dispatch...
	/// Oversize and malformed packets are dropped silently").
	pub fn poll_recv(&self) -> Vec<Inbound> {
		let mut out = Vec::new();

		for (local, socket) in &self.bound {
			let mut buf = [0u8; crate::packet::MAX_LLS_BLOCK_SIZE];

			loop {
				match socket.recv_from(&mut buf) {
					Ok((n, remote)) => out.push(Inbound { local: *local, remote, data: buf[..n].to_vec() }),
					Err(e) if e.kind() == ErrorKind::WouldBlock => break,
					Err(e) => {
						warn!("Lower Interface read failed on {local}: {e}");
						break;
					}
				}
			}
		}

		out
	}

	pub fn send(&self, dest: SocketAddr, buf: &[u8]) -> std::io::Result<()> {
		trace!("sending {} bytes to {dest}", buf.len());
		self.send_socket.send_to(buf, dest).map(|_| ())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn local(port: u16) -> SocketAddr {
		format!("127.0.0.1:{port}").parse().unwrap()
	}

	#[test]
	fn bind_and_send_round_trips_a_datagram() {
		let a = LowerInterface::bind(&[local(18901)], 0).unwrap();
		let b = LowerInterface::bind(&[local(18902)], 0).unwrap();

		a.send(local(18902), b"hello").unwrap();

		// Give the kernel a moment to deliver the loopback datagram.
		std::thread::sleep(std::time::Duration::from_millis(20));

		let inbound = b.poll_recv();
		assert_eq!(inbound.len(), 1);
		assert_eq!(inbound[0].data, b"hello");
	}

	#[test]
	fn reconcile_detects_address_removal() {
		let mut iface = LowerInterface::bind(&[local(18903), local(18904)], 0).unwrap();
		assert!(iface.reconcile_addresses(&[local(18903)]).unwrap());
		assert_eq!(iface.local_addresses().count(), 1);
	}
}
