//! Protocol 2.0 codec.
//!
//! Instruction packet layout:
//!
//! ```text
//! 0xFF 0xFF 0xFD 0x00 <id> <len_lo> <len_hi> <instr> <params…> <crc_lo> <crc_hi>
//! ```
//!
//! `len` counts the instruction byte, the (stuffed) parameters and the
//! two CRC bytes. Status packets carry the indicator byte `0x55` and an
//! error bitmask before their parameters:
//!
//! ```text
//! 0xFF 0xFF 0xFD 0x00 <id> <len_lo> <len_hi> 0x55 <err> <params…> <crc_lo> <crc_hi>
//! ```
//!
//! Parameters are byte-stuffed so payload can never mimic the header:
//! every in-payload `FF FF FD` gets a `0xFD` appended. Length and CRC
//! are computed over the stuffed bytes.

use alloc::vec::Vec;

use bitflags::bitflags;
use smallvec::SmallVec;

use crate::bus::{Bus, BusConfig, BusGuard, BusTransport, Delay};
use crate::protocol::{
	BROADCAST_ID, DeviceError, DeviceErrors, Instruction, PacketStatus, Payload, ProtocolVersion,
	ResetScope, Response, TransportError, Wire, bytes_value, value_bytes,
};

const HEADER: [u8; 3] = [0xFF, 0xFF, 0xFD];
/// Header, reserved byte, id and the two length bytes.
const FIXED_OVERHEAD: usize = 7;
/// Smallest well-formed status packet (empty parameter region).
const MIN_STATUS_PACKET: usize = 11;
/// Give up resynchronizing on a noisy line after this many passes.
const RESYNC_PASSES: usize = 8;

bitflags! {
	/// Status-packet error byte.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	struct StatusBits: u8 {
		const RESULT_FAIL = 1 << 0;
		const INSTRUCTION = 1 << 1;
		const CRC = 1 << 2;
		const DATA_RANGE = 1 << 3;
		const DATA_LENGTH = 1 << 4;
		const DATA_LIMIT = 1 << 5;
		const ACCESS = 1 << 6;
	}
}

const STATUS_ERRORS: [(StatusBits, DeviceError); 7] = [
	(StatusBits::RESULT_FAIL, DeviceError::ResultFail),
	(StatusBits::INSTRUCTION, DeviceError::InstrError),
	(StatusBits::CRC, DeviceError::Crc),
	(StatusBits::DATA_RANGE, DeviceError::DataRange),
	(StatusBits::DATA_LENGTH, DeviceError::DataLength),
	(StatusBits::DATA_LIMIT, DeviceError::DataLimit),
	(StatusBits::ACCESS, DeviceError::Access),
];

fn decode_status(byte: u8) -> DeviceErrors {
	let bits = StatusBits::from_bits_truncate(byte);
	STATUS_ERRORS
		.iter()
		.filter(|(flag, _)| bits.contains(*flag))
		.map(|(_, error)| *error)
		.collect()
}

/// CRC-16 lookup table, polynomial `0x8005`, no reflection.
static CRC_TABLE: [u16; 256] = [
	0x0000, 0x8005, 0x800F, 0x000A, 0x801B, 0x001E, 0x0014, 0x8011, 0x8033, 0x0036, 0x003C, 0x8039,
	0x0028, 0x802D, 0x8027, 0x0022, 0x8063, 0x0066, 0x006C, 0x8069, 0x0078, 0x807D, 0x8077, 0x0072,
	0x0050, 0x8055, 0x805F, 0x005A, 0x804B, 0x004E, 0x0044, 0x8041, 0x80C3, 0x00C6, 0x00CC, 0x80C9,
	0x00D8, 0x80DD, 0x80D7, 0x00D2, 0x00F0, 0x80F5, 0x80FF, 0x00FA, 0x80EB, 0x00EE, 0x00E4, 0x80E1,
	0x00A0, 0x80A5, 0x80AF, 0x00AA, 0x80BB, 0x00BE, 0x00B4, 0x80B1, 0x8093, 0x0096, 0x009C, 0x8099,
	0x0088, 0x808D, 0x8087, 0x0082, 0x8183, 0x0186, 0x018C, 0x8189, 0x0198, 0x819D, 0x8197, 0x0192,
	0x01B0, 0x81B5, 0x81BF, 0x01BA, 0x81AB, 0x01AE, 0x01A4, 0x81A1, 0x01E0, 0x81E5, 0x81EF, 0x01EA,
	0x81FB, 0x01FE, 0x01F4, 0x81F1, 0x81D3, 0x01D6, 0x01DC, 0x81D9, 0x01C8, 0x81CD, 0x81C7, 0x01C2,
	0x0140, 0x8145, 0x814F, 0x014A, 0x815B, 0x015E, 0x0154, 0x8151, 0x8173, 0x0176, 0x017C, 0x8179,
	0x0168, 0x816D, 0x8167, 0x0162, 0x8123, 0x0126, 0x012C, 0x8129, 0x0138, 0x813D, 0x8137, 0x0132,
	0x0110, 0x8115, 0x811F, 0x011A, 0x810B, 0x010E, 0x0104, 0x8101, 0x8303, 0x0306, 0x030C, 0x8309,
	0x0318, 0x831D, 0x8317, 0x0312, 0x0330, 0x8335, 0x833F, 0x033A, 0x832B, 0x032E, 0x0324, 0x8321,
	0x0360, 0x8365, 0x836F, 0x036A, 0x837B, 0x037E, 0x0374, 0x8371, 0x8353, 0x0356, 0x035C, 0x8359,
	0x0348, 0x834D, 0x8347, 0x0342, 0x03C0, 0x83C5, 0x83CF, 0x03CA, 0x83DB, 0x03DE, 0x03D4, 0x83D1,
	0x83F3, 0x03F6, 0x03FC, 0x83F9, 0x03E8, 0x83ED, 0x83E7, 0x03E2, 0x83A3, 0x03A6, 0x03AC, 0x83A9,
	0x03B8, 0x83BD, 0x83B7, 0x03B2, 0x0390, 0x8395, 0x839F, 0x039A, 0x838B, 0x038E, 0x0384, 0x8381,
	0x0280, 0x8285, 0x828F, 0x028A, 0x829B, 0x029E, 0x0294, 0x8291, 0x82B3, 0x02B6, 0x02BC, 0x82B9,
	0x02A8, 0x82AD, 0x82A7, 0x02A2, 0x82E3, 0x02E6, 0x02EC, 0x82E9, 0x02F8, 0x82FD, 0x82F7, 0x02F2,
	0x02D0, 0x82D5, 0x82DF, 0x02DA, 0x82CB, 0x02CE, 0x02C4, 0x82C1, 0x8243, 0x0246, 0x024C, 0x8249,
	0x0258, 0x825D, 0x8257, 0x0252, 0x0270, 0x8275, 0x827F, 0x027A, 0x826B, 0x026E, 0x0264, 0x8261,
	0x0220, 0x8225, 0x822F, 0x022A, 0x823B, 0x023E, 0x0234, 0x8231, 0x8213, 0x0216, 0x021C, 0x8219,
	0x0208, 0x820D, 0x8207, 0x0202,
];

/// CRC-16-ANSI over `data`, initial value 0, emitted little-endian on
/// the wire.
pub fn crc16(data: &[u8]) -> u16 {
	data.iter().fold(0, |crc, &byte| {
		let index = ((crc >> 8) ^ u16::from(byte)) & 0xFF;
		(crc << 8) ^ CRC_TABLE[usize::from(index)]
	})
}

/// Byte-stuff a parameter region.
///
/// After every `FF FF FD` whose successor is not already `0xFD`, a
/// `0xFD` is inserted, so a receiver scanning for headers can never
/// anchor inside the payload.
pub fn stuff(params: &[u8]) -> Vec<u8> {
	let mut out = Vec::with_capacity(params.len() + 2);
	for (i, &byte) in params.iter().enumerate() {
		out.push(byte);
		if out.ends_with(&HEADER) && params.get(i + 1) != Some(&0xFD) {
			out.push(0xFD);
		}
	}
	out
}

/// Undo [`stuff`]: drop the `0xFD` following every `FF FF FD`.
pub fn unstuff(stuffed: &[u8]) -> Vec<u8> {
	let mut out = Vec::with_capacity(stuffed.len());
	for &byte in stuffed {
		if byte == 0xFD && out.ends_with(&HEADER) {
			continue;
		}
		out.push(byte);
	}
	out
}

/// Offsets of every plausible packet start: a `FF FF FD x` window whose
/// fourth byte is not the stuffing marker.
fn find_headers(buffer: &[u8]) -> Vec<usize> {
	buffer
		.windows(4)
		.enumerate()
		.filter(|(_, window)| window[..3] == HEADER && window[3] != 0xFD)
		.map(|(offset, _)| offset)
		.collect()
}

/// Recompute the CRC and decode the error byte of one status packet.
fn validate(packet: &[u8]) -> PacketStatus {
	if packet.len() < MIN_STATUS_PACKET {
		return PacketStatus::Transport(TransportError::TruncatedPacket);
	}
	let (body, checksum) = packet.split_at(packet.len() - 2);
	if checksum != crc16(body).to_le_bytes() {
		return PacketStatus::Transport(TransportError::ChecksumMismatch);
	}
	let err = packet[8];
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

/// What `CLEAR` should wipe. The payloads are magic numbers the devices
/// require verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearKind {
	/// Reset the multi-turn position to within one revolution.
	Position,
	/// Clear a latched hardware error.
	Error,
}

impl ClearKind {
	fn parameter(self) -> [u8; 5] {
		match self {
			ClearKind::Position => [0x01, 0x44, 0x58, 0x4C, 0x22],
			ClearKind::Error => [0x02, 0x45, 0x52, 0x43, 0x4C],
		}
	}
}

/// Direction of a `CONTROL_TABLE_BACKUP` transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupKind {
	Store,
	Restore,
}

impl BackupKind {
	fn parameter(self) -> [u8; 5] {
		// 0x43 0x54 0x52 0x4C spells "CTRL".
		match self {
			BackupKind::Store => [0x01, 0x43, 0x54, 0x52, 0x4C],
			BackupKind::Restore => [0x02, 0x43, 0x54, 0x52, 0x4C],
		}
	}
}

/// Protocol 2.0 instance, one per physical bus.
///
/// Shared by reference among every servo on the bus; all mutual
/// exclusion happens internally through the [`Bus`] mutex.
pub struct Protocol2<T, D> {
	bus: Bus<T, D>,
}

impl<T: BusTransport, D: Delay> Protocol2<T, D> {
	pub fn new(transport: T, delay: D, config: BusConfig) -> Self {
		Self {
			bus: Bus::new(transport, delay, config),
		}
	}

	fn build(&self, id: u8, instruction: Instruction, params: &[u8]) -> Vec<u8> {
		let stuffed = stuff(params);
		// Length covers the instruction, the stuffed parameters and the CRC.
		let length = (stuffed.len() + 3) as u16;
		let mut packet = Vec::with_capacity(stuffed.len() + 10);
		packet.extend_from_slice(&HEADER);
		packet.push(0x00);
		packet.push(id);
		packet.extend_from_slice(&length.to_le_bytes());
		packet.push(instruction.into());
		packet.extend_from_slice(&stuffed);
		let crc = crc16(&packet);
		packet.extend_from_slice(&crc.to_le_bytes());
		packet
	}

	/// One locked tx-drain-rx transaction.
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

	/// The receive-side decision procedure.
	///
	/// Reading on a half-duplex line is ambiguous: noise, echo or a
	/// broadcast's concatenated replies may all be in the buffer. Drain
	/// what is pending, then classify: a single well-sized packet, a
	/// multi-packet pile (split at every plausible header), or a short
	/// packet worth one follow-up read. Anything else resynchronizes on
	/// the next header or gives up.
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
					// Not even the length field arrived yet.
					let needed = MIN_STATUS_PACKET - buffer.len();
					match self.top_up(bus, &mut buffer, needed).await {
						Ok(()) => continue,
						Err(response) => return response,
					}
				}
				let length = usize::from(u16::from_le_bytes([buffer[5], buffer[6]]));
				let total = length + FIXED_OVERHEAD;
				if total == buffer.len() {
					// A complete packet. Bytes still trickling in (a
					// later device answering a broadcast) belong to the
					// next packet, never to this one; whatever is left
					// unread goes with the post-transaction flush.
					let status = validate(&buffer);
					return Response::new(Payload::Packet(buffer), status);
				}
				if total < buffer.len() {
					return split_packets(&buffer);
				}
				// total > buffer.len(): fetch what the length field
				// still promises.
				let missing = MIN_STATUS_PACKET.saturating_sub(length + 1);
				if let Err(response) = self.top_up(bus, &mut buffer, missing).await {
					return response;
				}
				let status = validate(&buffer);
				return Response::new(Payload::Packet(buffer), status);
			}
			match find_headers(&buffer).first() {
				Some(&offset) => {
					// Rebase on the first plausible header and retry.
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

	/// Follow-up read of `missing` bytes plus whatever else arrived.
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

	/// Pull the parameter bytes out of a validated read reply.
	fn extract_value(response: Response) -> Response {
		if !response.ok() {
			return response;
		}
		let Payload::Packet(bytes) = &response.data else {
			return response;
		};
		let params = &bytes[9..bytes.len() - 2];
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

	pub async fn read(&self, id: u8, address: u16, length: u16) -> Response {
		let mut params = [0u8; 4];
		params[..2].copy_from_slice(&address.to_le_bytes());
		params[2..].copy_from_slice(&length.to_le_bytes());
		let response = self.transfer(self.build(id, Instruction::Read, &params)).await;
		Self::extract_value(response)
	}

	pub async fn write(&self, id: u8, address: u16, data: &[u8]) -> Response {
		let mut params = Vec::with_capacity(2 + data.len());
		params.extend_from_slice(&address.to_le_bytes());
		params.extend_from_slice(data);
		self.transfer(self.build(id, Instruction::Write, &params)).await
	}

	pub async fn reg_write(&self, id: u8, address: u16, data: &[u8]) -> Response {
		let mut params = Vec::with_capacity(2 + data.len());
		params.extend_from_slice(&address.to_le_bytes());
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

	pub async fn clear(&self, id: u8, kind: ClearKind) -> Response {
		self.transfer(self.build(id, Instruction::Clear, &kind.parameter()))
			.await
	}

	pub async fn control_table_backup(&self, id: u8, kind: BackupKind) -> Response {
		self.transfer(self.build(id, Instruction::ControlTableBackup, &kind.parameter()))
			.await
	}

	/// Broadcast read of the same register from several devices.
	///
	/// Every addressed device answers in id order; the reply is the
	/// multi-packet pile the receive path splits and validates
	/// per-packet.
	pub async fn sync_read(&self, address: u16, length: u16, ids: &[u8]) -> Response {
		let mut params = Vec::with_capacity(4 + ids.len());
		params.extend_from_slice(&address.to_le_bytes());
		params.extend_from_slice(&length.to_le_bytes());
		params.extend_from_slice(ids);
		self.transfer(self.build(BROADCAST_ID, Instruction::SyncRead, &params))
			.await
	}

	/// Broadcast write of the same register to several devices.
	pub async fn sync_write(&self, address: u16, length: u16, values: &[(u8, u32)]) -> Response {
		let width = usize::from(length);
		let mut params = Vec::with_capacity(4 + values.len() * (1 + width));
		params.extend_from_slice(&address.to_le_bytes());
		params.extend_from_slice(&length.to_le_bytes());
		for &(id, value) in values {
			params.push(id);
			params.extend_from_slice(&value_bytes(value, width));
		}
		self.transfer(self.build(BROADCAST_ID, Instruction::SyncWrite, &params))
			.await
	}

	/// Like [`sync_read`](Self::sync_read), but the devices answer in
	/// one merged status packet.
	pub async fn fast_sync_read(&self, address: u16, length: u16, ids: &[u8]) -> Response {
		let mut params = Vec::with_capacity(4 + ids.len());
		params.extend_from_slice(&address.to_le_bytes());
		params.extend_from_slice(&length.to_le_bytes());
		params.extend_from_slice(ids);
		self.transfer(self.build(BROADCAST_ID, Instruction::FastSyncRead, &params))
			.await
	}

	/// Broadcast read with a per-device address and width.
	pub async fn bulk_read(&self, entries: &[(u8, u16, u16)]) -> Response {
		let mut params = Vec::with_capacity(entries.len() * 5);
		for &(id, address, length) in entries {
			params.push(id);
			params.extend_from_slice(&address.to_le_bytes());
			params.extend_from_slice(&length.to_le_bytes());
		}
		self.transfer(self.build(BROADCAST_ID, Instruction::BulkRead, &params))
			.await
	}

	/// Broadcast write with a per-device address, width and value.
	pub async fn bulk_write(&self, entries: &[(u8, u16, u16, u32)]) -> Response {
		let mut params = Vec::new();
		for &(id, address, length, value) in entries {
			params.push(id);
			params.extend_from_slice(&address.to_le_bytes());
			params.extend_from_slice(&length.to_le_bytes());
			params.extend_from_slice(&value_bytes(value, usize::from(length)));
		}
		self.transfer(self.build(BROADCAST_ID, Instruction::BulkWrite, &params))
			.await
	}

	/// Like [`bulk_read`](Self::bulk_read) with a merged reply.
	pub async fn fast_bulk_read(&self, entries: &[(u8, u16, u16)]) -> Response {
		let mut params = Vec::with_capacity(entries.len() * 5);
		for &(id, address, length) in entries {
			params.push(id);
			params.extend_from_slice(&address.to_le_bytes());
			params.extend_from_slice(&length.to_le_bytes());
		}
		self.transfer(self.build(BROADCAST_ID, Instruction::FastBulkRead, &params))
			.await
	}
}

impl<T, D> Wire for Protocol2<T, D>
where
	T: BusTransport + Send,
	D: Delay + Send + Sync,
{
	fn version(&self) -> ProtocolVersion {
		ProtocolVersion::V2
	}

	async fn ping(&self, id: u8) -> Response {
		Protocol2::ping(self, id).await
	}

	async fn read(&self, id: u8, address: u16, length: u16) -> Response {
		Protocol2::read(self, id, address, length).await
	}

	async fn write(&self, id: u8, address: u16, data: &[u8]) -> Response {
		Protocol2::write(self, id, address, data).await
	}

	async fn reg_write(&self, id: u8, address: u16, data: &[u8]) -> Response {
		Protocol2::reg_write(self, id, address, data).await
	}

	async fn action(&self, id: u8) -> Response {
		Protocol2::action(self, id).await
	}

	async fn reboot(&self, id: u8) -> Response {
		Protocol2::reboot(self, id).await
	}

	async fn factory_reset(&self, id: u8, scope: ResetScope) -> Response {
		Protocol2::factory_reset(self, id, scope).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::executor::block_on;
	use crate::mock::{BusEvent, MockBus};

	fn proto(link: &MockBus) -> Protocol2<MockBus, MockBus> {
		Protocol2::new(link.clone(), link.clone(), BusConfig::default())
	}

	#[test]
	fn crc_matches_reference_vector() {
		let data = [
			0xFF, 0xFF, 0xFD, 0x00, 0x01, 0x07, 0x00, 0x55, 0x00, 0x06, 0x04, 0x26,
		];
		assert_eq!(crc16(&data), 0x5D65);
	}

	#[test]
	fn ping_packet_bytes() {
		let link = MockBus::new();
		let packet = proto(&link).build(1, Instruction::Ping, &[]);
		assert_eq!(
			packet,
			[0xFF, 0xFF, 0xFD, 0x00, 0x01, 0x03, 0x00, 0x01, 0x19, 0x4E]
		);
	}

	#[test]
	fn goal_position_write_bytes() {
		// WRITE 512 into the four-byte register at 116.
		let link = MockBus::new();
		let mut params = alloc::vec![0x74, 0x00];
		params.extend_from_slice(&512u32.to_le_bytes());
		let packet = proto(&link).build(1, Instruction::Write, &params);
		assert_eq!(
			packet,
			[
				0xFF, 0xFF, 0xFD, 0x00, 0x01, 0x09, 0x00, 0x03, 0x74, 0x00, 0x00, 0x02, 0x00,
				0x00, 0xCA, 0x1F
			]
		);
	}

	#[test]
	fn built_packets_self_validate() {
		let link = MockBus::new();
		let p = proto(&link);
		for (id, instruction, params) in [
			(1, Instruction::Ping, alloc::vec![]),
			(3, Instruction::Write, alloc::vec![0x74, 0x00, 0xFF, 0xFF, 0xFD, 0x00]),
			(BROADCAST_ID, Instruction::SyncRead, alloc::vec![0x84, 0x00, 0x04, 0x00, 1, 2]),
		] {
			let packet = p.build(id, instruction, &params);
			let (body, checksum) = packet.split_at(packet.len() - 2);
			assert_eq!(checksum, crc16(body).to_le_bytes());
			// Length field law: instruction + params + CRC.
			let length = u16::from_le_bytes([packet[5], packet[6]]);
			assert_eq!(usize::from(length), packet.len() - FIXED_OVERHEAD);
		}
	}

	#[test]
	fn stuffing_boundaries() {
		assert_eq!(stuff(&[0xFF, 0xFF, 0xFD, 0x03]), [0xFF, 0xFF, 0xFD, 0xFD, 0x03]);
		// Already stuffed: a no-op.
		assert_eq!(
			stuff(&[0xFF, 0xFF, 0xFD, 0xFD, 0x03]),
			[0xFF, 0xFF, 0xFD, 0xFD, 0x03]
		);
		// A trailing header is still lengthened.
		assert_eq!(stuff(&[0x01, 0xFF, 0xFF, 0xFD]), [0x01, 0xFF, 0xFF, 0xFD, 0xFD]);
	}

	#[test]
	fn stuff_round_trips_and_hides_headers() {
		let cases: &[&[u8]] = &[
			&[],
			&[0x00],
			&[0xFF, 0xFF, 0xFD, 0x03],
			&[0xFF, 0xFF, 0xFF, 0xFD, 0x00],
			&[0xFF, 0xFF, 0xFD, 0xFF, 0xFF, 0xFD],
			&[0x12, 0xFF, 0xFF, 0xFD, 0x34, 0xFF, 0xFF],
		];
		for &case in cases {
			let stuffed = stuff(case);
			assert_eq!(unstuff(&stuffed), case, "case {case:02X?}");
			assert!(
				find_headers(&stuffed).is_empty(),
				"unhidden header in {stuffed:02X?}"
			);
		}
	}

	#[test]
	fn receive_single_status_packet() {
		let link = MockBus::new();
		link.push_reply(&[
			0xFF, 0xFF, 0xFD, 0x00, 0x01, 0x07, 0x00, 0x55, 0x00, 0x06, 0x04, 0x26, 0x65, 0x5D,
		]);
		let response = block_on(proto(&link).ping(1));
		assert!(response.ok());
		assert!(matches!(response.data, Payload::Packet(_)));
		// The transmitted bytes are the canonical ping packet.
		assert!(link.events().contains(&BusEvent::Write(alloc::vec![
			0xFF, 0xFF, 0xFD, 0x00, 0x01, 0x03, 0x00, 0x01, 0x19, 0x4E
		])));
	}

	#[test]
	fn receive_demultiplexes_broadcast_replies() {
		let link = MockBus::new();
		let mut pile = alloc::vec::Vec::new();
		// Two back-to-back status packets, ids 1 and 2.
		pile.extend_from_slice(&[
			0xFF, 0xFF, 0xFD, 0x00, 0x01, 0x07, 0x00, 0x55, 0x00, 0x06, 0x04, 0x26, 0x65, 0x5D,
		]);
		let mut second = alloc::vec![0xFF, 0xFF, 0xFD, 0x00, 0x02, 0x07, 0x00, 0x55, 0x00, 0x06, 0x04, 0x26];
		let crc = crc16(&second);
		second.extend_from_slice(&crc.to_le_bytes());
		pile.extend_from_slice(&second);
		link.push_reply(&pile);

		let response = block_on(proto(&link).sync_read(132, 4, &[1, 2]));
		assert!(response.ok());
		let Payload::Packets(packets) = &response.data else {
			panic!("expected packet pile, got {:?}", response.data);
		};
		assert_eq!(packets.len(), 2);
		assert_eq!(packets[0][4], 1);
		assert_eq!(packets[1][4], 2);
		assert_eq!(response.status.len(), 2);
	}

	#[test]
	fn corrupt_packet_reports_checksum_mismatch() {
		let link = MockBus::new();
		link.push_reply(&[
			0xFF, 0xFF, 0xFD, 0x00, 0x01, 0x07, 0x00, 0x55, 0x00, 0x06, 0x04, 0x26, 0x65, 0x00,
		]);
		let response = block_on(proto(&link).ping(1));
		assert_eq!(
			response.status.as_slice(),
			&[PacketStatus::Transport(TransportError::ChecksumMismatch)]
		);
	}

	#[test]
	fn device_error_bits_all_decode() {
		let mut packet = alloc::vec![0xFF, 0xFF, 0xFD, 0x00, 0x01, 0x04, 0x00, 0x55, 0x05];
		let crc = crc16(&packet);
		packet.extend_from_slice(&crc.to_le_bytes());
		assert_eq!(
			validate(&packet),
			PacketStatus::Device(smallvec::smallvec![
				DeviceError::ResultFail,
				DeviceError::Crc
			])
		);
	}

	#[test]
	fn empty_drain_is_a_timeout() {
		let link = MockBus::new();
		let response = block_on(proto(&link).write(1, 64, &[1]));
		assert_eq!(
			response.status.as_slice(),
			&[PacketStatus::Transport(TransportError::Timeout)]
		);
	}

	#[test]
	fn short_packet_takes_a_follow_up_read() {
		let link = MockBus::new();
		// First burst: everything except the last four bytes.
		link.push_reply(&[
			0xFF, 0xFF, 0xFD, 0x00, 0x01, 0x07, 0x00, 0x55, 0x00, 0x06,
		]);
		// The tail arrives on the follow-up read.
		link.push_reply(&[0x04, 0x26, 0x65, 0x5D]);
		let response = block_on(proto(&link).ping(1));
		assert!(response.ok(), "status: {:?}", response.status);
	}

	#[test]
	fn short_packet_without_tail_fails() {
		let link = MockBus::new();
		link.push_reply(&[0xFF, 0xFF, 0xFD, 0x00, 0x01, 0x07, 0x00, 0x55]);
		let response = block_on(proto(&link).ping(1));
		assert_eq!(
			response.status.as_slice(),
			&[PacketStatus::Transport(TransportError::TruncatedPacket)]
		);
	}

	#[test]
	fn leading_noise_is_resynchronized_away() {
		let link = MockBus::new();
		let mut noisy = alloc::vec![0x00, 0x12, 0x34];
		noisy.extend_from_slice(&[
			0xFF, 0xFF, 0xFD, 0x00, 0x01, 0x07, 0x00, 0x55, 0x00, 0x06, 0x04, 0x26, 0x65, 0x5D,
		]);
		link.push_reply(&noisy);
		let response = block_on(proto(&link).ping(1));
		assert!(response.ok(), "status: {:?}", response.status);
	}

	#[test]
	fn pure_noise_is_no_response() {
		let link = MockBus::new();
		link.push_reply(&[0x00, 0x12, 0x34, 0x56]);
		let response = block_on(proto(&link).ping(1));
		assert_eq!(
			response.status.as_slice(),
			&[PacketStatus::Transport(TransportError::NoResponse)]
		);
	}

	/// Serves one complete status packet on the first drain, then keeps
	/// claiming more bytes are pending without ever delivering them —
	/// the shape of a second device trickling in behind a broadcast
	/// reply.
	struct TricklingLink {
		packet: alloc::vec::Vec<u8>,
		served: bool,
	}

	impl crate::bus::BusTransport for TricklingLink {
		type Error = core::convert::Infallible;

		fn write(&mut self, _bytes: &[u8]) -> Result<(), Self::Error> {
			Ok(())
		}

		async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
			if self.served {
				return Ok(0);
			}
			let n = buf.len().min(self.packet.len());
			buf[..n].copy_from_slice(&self.packet[..n]);
			self.served = true;
			Ok(n)
		}

		fn bytes_available(&self) -> usize {
			if self.served { 3 } else { self.packet.len() }
		}

		fn clear_input(&mut self) {}

		fn set_tx_enable(&mut self, _enabled: bool) {}
	}

	#[test]
	fn complete_packet_returns_even_with_bytes_trickling_in() {
		let trickle = TricklingLink {
			packet: alloc::vec![
				0xFF, 0xFF, 0xFD, 0x00, 0x01, 0x07, 0x00, 0x55, 0x00, 0x06, 0x04, 0x26, 0x65,
				0x5D,
			],
			served: false,
		};
		let p = Protocol2::new(trickle, MockBus::new(), BusConfig::default());
		let response = block_on(p.ping(1));
		// The packet in hand is whole; the trickle must not be pulled
		// into it.
		assert!(response.ok(), "status: {:?}", response.status);
		let Payload::Packet(bytes) = &response.data else {
			panic!("expected a single packet, got {:?}", response.data);
		};
		assert_eq!(bytes.len(), 14);
	}

	#[test]
	fn clear_and_backup_magic_payloads() {
		let link = MockBus::new();
		let p = proto(&link);
		let packet = p.build(1, Instruction::Clear, &ClearKind::Position.parameter());
		assert_eq!(&packet[8..13], &[0x01, 0x44, 0x58, 0x4C, 0x22]);
		let packet = p.build(1, Instruction::Clear, &ClearKind::Error.parameter());
		assert_eq!(&packet[8..13], &[0x02, 0x45, 0x52, 0x43, 0x4C]);
		let packet = p.build(1, Instruction::ControlTableBackup, &BackupKind::Store.parameter());
		assert_eq!(&packet[8..13], &[0x01, 0x43, 0x54, 0x52, 0x4C]);
		let packet = p.build(
			1,
			Instruction::ControlTableBackup,
			&BackupKind::Restore.parameter(),
		);
		assert_eq!(&packet[8..13], &[0x02, 0x43, 0x54, 0x52, 0x4C]);
	}

	#[test]
	fn read_extracts_little_endian_value() {
		let link = MockBus::new();
		// Status packet with the four-byte value 0x0406 in its params.
		let mut reply = alloc::vec![
			0xFF, 0xFF, 0xFD, 0x00, 0x01, 0x08, 0x00, 0x55, 0x00, 0x06, 0x04, 0x00, 0x00,
		];
		let crc = crc16(&reply);
		reply.extend_from_slice(&crc.to_le_bytes());
		link.push_reply(&reply);
		let response = block_on(proto(&link).read(1, 0, 4));
		if let Some(value) = response.value() {
			assert_eq!(value, 0x0406);
		} else {
			panic!("expected a value, got {response:?}");
		}
	}
}
