//! Protocol 1.0 codec.
//!
//! The legacy framing, still spoken by the AX series:
//!
//! ```text
//! 0xFF 0xFF <id> <len> <instr> <params…> <chk>
//! ```
//!
//! `len` counts the instruction byte, the parameters and the checksum;
//! `chk` is the inverted 8-bit sum of everything from the id through the
//! last parameter. Status packets replace the instruction byte with an
//! error bitmask. There is no byte stuffing and no reserved byte — the
//! price is that `FF FF` payload bytes can masquerade as headers, which
//! the resynchronization below has to live with.

use alloc::vec::Vec;

use bitflags::bitflags;
use smallvec::SmallVec;

use crate::bus::{Bus, BusConfig, BusGuard, BusTransport, Delay};
use crate::protocol::{
	BROADCAST_ID, DeviceError, DeviceErrors, Instruction, PacketStatus, Payload, ProtocolVersion,
	ResetScope, Response, TransportError, Wire, bytes_value, value_bytes,
};

const HEADER: [u8; 2] = [0xFF, 0xFF];
/// Header, id and the length byte.
const FIXED_OVERHEAD: usize = 4;
/// Smallest well-formed status packet (no parameters).
const MIN_STATUS_PACKET: usize = 6;
const RESYNC_PASSES: usize = 8;

bitflags! {
	/// Status-packet error byte.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	struct StatusBits: u8 {
		const INSTRUCTION = 1 << 0;
		const OVERLOAD = 1 << 1;
		const CHECKSUM = 1 << 2;
		const RANGE = 1 << 3;
		const OVERHEATING = 1 << 4;
		const ANGLE_LIMIT = 1 << 5;
		const INPUT_VOLTAGE = 1 << 6;
	}
}

const STATUS_ERRORS: [(StatusBits, DeviceError); 7] = [
	(StatusBits::INSTRUCTION, DeviceError::InstrError),
	(StatusBits::OVERLOAD, DeviceError::Overload),
	(StatusBits::CHECKSUM, DeviceError::Crc),
	(StatusBits::RANGE, DeviceError::Range),
	(StatusBits::OVERHEATING, DeviceError::Overheating),
	(StatusBits::ANGLE_LIMIT, DeviceError::Angle),
	(StatusBits::INPUT_VOLTAGE, DeviceError::InputVoltage),
];

fn decode_status(byte: u8) -> DeviceErrors {
	let bits = StatusBits::from_bits_truncate(byte);
	STATUS_ERRORS
		.iter()
		.filter(|(flag, _)| bits.contains(*flag))
		.map(|(_, error)| *error)
		.collect()
}

/// Inverted 8-bit sum over the id, length and body bytes.
pub fn checksum(packet: &[u8]) -> u8 {
	!packet[2..]
		.iter()
		.fold(0u8, |acc, &byte| acc.wrapping_add(byte))
}

/// Offsets of every plausible packet start. A third `0xFF` cannot begin
/// an id, so a header match inside a run of `0xFF` noise is skipped.
fn find_headers(buffer: &[u8]) -> Vec<usize> {
	buffer
		.windows(3)
		.enumerate()
		.filter(|(_, window)| window[..2] == HEADER && window[2] != 0xFF)
		.map(|(offset, _)| offset)
		.collect()
}

fn validate(packet: &[u8]) -> PacketStatus {
	if packet.len() < MIN_STATUS_PACKET {
		return PacketStatus::Transport(TransportError::TruncatedPacket);
	}
	let (body, tail) = packet.split_at(packet.len() - 1);
	if tail[0] != checksum(body) {
		return PacketStatus::Transport(TransportError::ChecksumMismatch);
	}
	let err = packet[4];
	if err == 0 {
		PacketStatus::Ok
	} else {
		PacketStatus::Device(decode_status(err))
	}
}

fn split_packets(buffer: &[u8]) -> Response {
	let offsets = find_headers(buffer);
	let mut packets = Vec::with_capacity(offsets.len());
	let mut status = SmallVec::new();
	for (i, &start) in offsets.iter().enumerate() {
		let end = offsets.get(i + 1).copied().unwrap_or(buffer.len());
		let packet = buffer[start..end].to_vec();
		status.push(validate(&packet));
		packets.push(packet);
	}
	Response {
		data: Payload::Packets(packets),
		status,
	}
}

/// Protocol 1.0 instance, one per physical bus.
pub struct Protocol1<T, D> {
	bus: Bus<T, D>,
}

impl<T: BusTransport, D: Delay> Protocol1<T, D> {
	pub fn new(transport: T, delay: D, config: BusConfig) -> Self {
		Self {
			bus: Bus::new(transport, delay, config),
		}
	}

	fn build(&self, id: u8, instruction: Instruction, params: &[u8]) -> Vec<u8> {
		// Length covers the instruction, the parameters and the checksum.
		let length = (params.len() + 2) as u8;
		let mut packet = Vec::with_capacity(params.len() + 6);
		packet.extend_from_slice(&HEADER);
		packet.push(id);
		packet.push(length);
		packet.push(instruction.into());
		packet.extend_from_slice(params);
		packet.push(checksum(&packet));
		packet
	}

	async fn transfer(&self, packet: Vec<u8>) -> Response {
		trace!("tx {packet:02X?}");
		let mut bus = self.bus.lock().await;
		bus.begin_tx().await;
		if let Err(err) = bus.write(&packet) {
			warn!("bus write failed: {err:?}");
			return Response::transport(TransportError::Io, Payload::Empty);
		}
		bus.end_tx().await;
		let response = self.receive(&mut bus).await;
		bus.clear_input();
		if !response.ok() {
			debug!("rx not ok: {:?}", response.status);
		}
		response
	}

	/// Receive-side decision procedure, the v1 rendition: 2-byte header,
	/// 1-byte length, `len + 4` total bytes.
	async fn receive(&self, bus: &mut BusGuard<'_, T, D>) -> Response {
		let mut buffer = match bus.drain().await {
			Ok(bytes) => bytes,
			Err(err) => {
				warn!("bus drain failed: {err:?}");
				return Response::transport(TransportError::Io, Payload::Empty);
			}
		};
		for _ in 0..RESYNC_PASSES {
			if buffer.is_empty() {
				return Response::transport(TransportError::Timeout, Payload::Empty);
			}
			if buffer.starts_with(&HEADER) {
				if buffer.len() < FIXED_OVERHEAD {
					let needed = MIN_STATUS_PACKET - buffer.len();
					match self.top_up(bus, &mut buffer, needed).await {
						Ok(()) => continue,
						Err(response) => return response,
					}
				}
				let length = usize::from(buffer[3]);
				let total = length + FIXED_OVERHEAD;
				if total == buffer.len() {
					// A complete packet; late bytes belong to the next
					// packet and are left for the post-transaction
					// flush.
					let status = validate(&buffer);
					return Response::new(Payload::Packet(buffer), status);
				}
				if total < buffer.len() {
					return split_packets(&buffer);
				}
				let missing = MIN_STATUS_PACKET.saturating_sub(length + 1);
				if let Err(response) = self.top_up(bus, &mut buffer, missing).await {
					return response;
				}
				let status = validate(&buffer);
				return Response::new(Payload::Packet(buffer), status);
			}
			match find_headers(&buffer).first() {
				Some(&offset) => {
					buffer.drain(..offset);
				}
				None if bus.bytes_available() == 0 => {
					return Response::transport(TransportError::NoResponse, Payload::Packet(buffer));
				}
				None => {
					buffer = match bus.drain().await {
						Ok(bytes) => bytes,
						Err(err) => {
							warn!("bus drain failed: {err:?}");
							return Response::transport(TransportError::Io, Payload::Empty);
						}
					};
				}
			}
		}
		Response::transport(TransportError::Garbled, Payload::Empty)
	}

	async fn top_up(
		&self,
		bus: &mut BusGuard<'_, T, D>,
		buffer: &mut Vec<u8>,
		missing: usize,
	) -> Result<(), Response> {
		if missing > 0 {
			let mut chunk = vec![0u8; missing];
			match bus.read(&mut chunk).await {
				Ok(0) => {
					return Err(Response::transport(
						TransportError::TruncatedPacket,
						Payload::Empty,
					));
				}
				Ok(n) => buffer.extend_from_slice(&chunk[..n]),
				Err(err) => {
					warn!("bus read failed: {err:?}");
					return Err(Response::transport(TransportError::Io, Payload::Empty));
				}
			}
		}
		match bus.drain().await {
			Ok(rest) => buffer.extend_from_slice(&rest),
			Err(err) => {
				warn!("bus drain failed: {err:?}");
				return Err(Response::transport(TransportError::Io, Payload::Empty));
			}
		}
		Ok(())
	}

	fn extract_value(response: Response) -> Response {
		if !response.ok() {
			return response;
		}
		let Payload::Packet(bytes) = &response.data else {
			return response;
		};
		let params = &bytes[5..bytes.len() - 1];
		if params.len() <= 4 {
			Response {
				data: Payload::Value(bytes_value(params)),
				status: response.status,
			}
		} else {
			Response {
				data: Payload::Packet(params.to_vec()),
				status: response.status,
			}
		}
	}

	pub async fn ping(&self, id: u8) -> Response {
		self.transfer(self.build(id, Instruction::Ping, &[])).await
	}

	pub async fn read(&self, id: u8, address: u8, length: u8) -> Response {
		let response = self
			.transfer(self.build(id, Instruction::Read, &[address, length]))
			.await;
		Self::extract_value(response)
	}

	pub async fn write(&self, id: u8, address: u8, data: &[u8]) -> Response {
		let mut params = Vec::with_capacity(1 + data.len());
		params.push(address);
		params.extend_from_slice(data);
		self.transfer(self.build(id, Instruction::Write, &params)).await
	}

	pub async fn reg_write(&self, id: u8, address: u8, data: &[u8]) -> Response {
		let mut params = Vec::with_capacity(1 + data.len());
		params.push(address);
		params.extend_from_slice(data);
		self.transfer(self.build(id, Instruction::RegWrite, &params))
			.await
	}

	pub async fn action(&self, id: u8) -> Response {
		self.transfer(self.build(id, Instruction::Action, &[])).await
	}

	pub async fn factory_reset(&self, id: u8, scope: ResetScope) -> Response {
		self.transfer(self.build(id, Instruction::FactoryReset, &[scope.into()]))
			.await
	}

	pub async fn reboot(&self, id: u8) -> Response {
		self.transfer(self.build(id, Instruction::Reboot, &[])).await
	}

	/// Broadcast write of the same register to several devices.
	pub async fn sync_write(&self, address: u8, length: u16, values: &[(u8, u32)]) -> Response {
		let width = usize::from(length);
		let mut params = Vec::with_capacity(3 + values.len() * (1 + width));
		params.push(address);
		params.extend_from_slice(&length.to_le_bytes());
		for &(id, value) in values {
			params.push(id);
			params.extend_from_slice(&value_bytes(value, width));
		}
		self.transfer(self.build(BROADCAST_ID, Instruction::SyncWrite, &params))
			.await
	}

	/// Broadcast read with a per-device address and width.
	pub async fn bulk_read(&self, entries: &[(u8, u8, u8)]) -> Response {
		let mut params = Vec::with_capacity(1 + entries.len() * 3);
		params.push(0x00);
		for &(id, address, length) in entries {
			params.push(length);
			params.push(id);
			params.push(address);
		}
		self.transfer(self.build(BROADCAST_ID, Instruction::BulkRead, &params))
			.await
	}
}

impl<T, D> Wire for Protocol1<T, D>
where
	T: BusTransport + Send,
	D: Delay + Send + Sync,
{
	fn version(&self) -> ProtocolVersion {
		ProtocolVersion::V1
	}

	async fn ping(&self, id: u8) -> Response {
		Protocol1::ping(self, id).await
	}

	async fn read(&self, id: u8, address: u16, length: u16) -> Response {
		Protocol1::read(self, id, address as u8, length as u8).await
	}

	async fn write(&self, id: u8, address: u16, data: &[u8]) -> Response {
		Protocol1::write(self, id, address as u8, data).await
	}

	async fn reg_write(&self, id: u8, address: u16, data: &[u8]) -> Response {
		Protocol1::reg_write(self, id, address as u8, data).await
	}

	async fn action(&self, id: u8) -> Response {
		Protocol1::action(self, id).await
	}

	async fn reboot(&self, id: u8) -> Response {
		Protocol1::reboot(self, id).await
	}

	async fn factory_reset(&self, id: u8, scope: ResetScope) -> Response {
		Protocol1::factory_reset(self, id, scope).await
	}
}
