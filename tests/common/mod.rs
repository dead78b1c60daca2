//! Shared plumbing for the integration tests: scripted buses and
//! canned status packets.
#![allow(dead_code)]

use std::sync::Arc;

use dynamixel::bus::BusConfig;
use dynamixel::devices::ax12a::Ax12a;
use dynamixel::devices::xl430::Xl430;
use dynamixel::mock::MockBus;
use dynamixel::protocol::v1::Protocol1;
use dynamixel::protocol::v2::{Protocol2, crc16};

pub fn v1_bus(link: &MockBus) -> Arc<Protocol1<MockBus, MockBus>> {
	Arc::new(Protocol1::new(
		link.clone(),
		link.clone(),
		BusConfig::default(),
	))
}

pub fn v2_bus(link: &MockBus) -> Arc<Protocol2<MockBus, MockBus>> {
	Arc::new(Protocol2::new(
		link.clone(),
		link.clone(),
		BusConfig::default(),
	))
}

pub fn ax12a(link: &MockBus, id: u8) -> Ax12a<MockBus, MockBus> {
	Ax12a::new("ax", id, v1_bus(link))
}

pub fn xl430(link: &MockBus, id: u8) -> Xl430<MockBus, MockBus> {
	Xl430::new("xl", id, v2_bus(link))
}

/// A v2 status packet for `id` carrying `params`, CRC appended.
pub fn v2_status(id: u8, err: u8, params: &[u8]) -> Vec<u8> {
	let mut packet = vec![0xFF, 0xFF, 0xFD, 0x00, id];
	let length = (params.len() + 4) as u16;
	packet.extend_from_slice(&length.to_le_bytes());
	packet.push(0x55);
	packet.push(err);
	packet.extend_from_slice(params);
	let crc = crc16(&packet);
	packet.extend_from_slice(&crc.to_le_bytes());
	packet
}

/// A v1 status packet for `id` carrying `params`, checksum appended.
pub fn v1_status(id: u8, err: u8, params: &[u8]) -> Vec<u8> {
	let mut packet = vec![0xFF, 0xFF, id, (params.len() + 2) as u8, err];
	packet.extend_from_slice(params);
	let sum: u8 = packet[2..]
		.iter()
		.fold(0u8, |acc, &byte| acc.wrapping_add(byte));
	packet.push(!sum);
	packet
}

/// Poll the executor until `done` holds; panics after too many passes.
pub fn run_until(mut done: impl FnMut() -> bool) {
	for _ in 0..1_000 {
		if done() {
			return;
		}
		dynamixel::executor::run();
	}
	panic!("executor did not converge");
}
