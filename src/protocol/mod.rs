//! Wire-protocol plumbing shared by both codec generations.
//!
//! Dynamixel buses speak one of two incompatible framings; [`v1`] and
//! [`v2`] implement them. Everything that is generation-independent
//! lives here: the instruction set, the error taxonomy, the
//! [`Response`] type every bus operation resolves to, and the [`Wire`]
//! trait the servo facade is generic over.

pub mod v1;
pub mod v2;

use alloc::vec::Vec;
use core::future::Future;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use smallvec::SmallVec;
use thiserror::Error;

/// Addresses every device on the bus; no status packet comes back.
pub const BROADCAST_ID: u8 = 254;

/// Byte value marking a status packet in protocol 2.0.
pub const STATUS_INDICATOR: u8 = 0x55;

/// Instruction codes across both protocol generations.
///
/// Protocol 1.0 understands only the subset up to `Reboot` plus
/// `SyncWrite` and `BulkRead`; the v2-only instructions exist solely on
/// [`v2::Protocol2`], so they cannot be issued on a v1 link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Instruction {
	Ping = 0x01,
	Read = 0x02,
	Write = 0x03,
	RegWrite = 0x04,
	Action = 0x05,
	FactoryReset = 0x06,
	Reboot = 0x08,
	Clear = 0x10,
	ControlTableBackup = 0x20,
	SyncRead = 0x82,
	SyncWrite = 0x83,
	FastSyncRead = 0x8A,
	BulkRead = 0x92,
	BulkWrite = 0x93,
	FastBulkRead = 0x9A,
}

/// What `FACTORY_RESET` wipes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
#[repr(u8)]
pub enum ResetScope {
	All = 0xFF,
	AllExceptId = 0x01,
	AllExceptIdAndBaud = 0x02,
}

/// Failures detected on the host side of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransportError {
	#[error("no bytes pending on the bus")]
	Timeout,
	#[error("no status packet header in the received bytes")]
	NoResponse,
	#[error("the status packet ended before its declared length")]
	TruncatedPacket,
	#[error("checksum mismatch in the status packet")]
	ChecksumMismatch,
	#[error("the receive buffer could not be interpreted")]
	Garbled,
	#[error("serial transfer failed")]
	Io,
}

/// Failures the device itself reports in the status-packet error byte.
///
/// The union of the v1 and v2 tag sets; each codec decodes its own
/// bitmask into these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeviceError {
	#[error("the instruction failed to execute")]
	ResultFail,
	#[error("undefined or malformed instruction")]
	InstrError,
	#[error("instruction checksum did not match")]
	Crc,
	#[error("value outside the register's range")]
	DataRange,
	#[error("data length did not match the register")]
	DataLength,
	#[error("value exceeds the configured limit")]
	DataLimit,
	#[error("register is not writable (or not readable)")]
	Access,
	#[error("load exceeds the torque limit")]
	Overload,
	#[error("instruction parameter out of range")]
	Range,
	#[error("internal temperature limit exceeded")]
	Overheating,
	#[error("goal position outside the angle limits")]
	Angle,
	#[error("supply voltage outside the configured limits")]
	InputVoltage,
}

/// Device-error tag list; a single status byte can set several bits.
pub type DeviceErrors = SmallVec<[DeviceError; 4]>;

/// Validation verdict for one status packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketStatus {
	Ok,
	Transport(TransportError),
	Device(DeviceErrors),
}

impl PacketStatus {
	pub fn is_ok(&self) -> bool {
		matches!(self, PacketStatus::Ok)
	}
}

/// What a bus operation handed back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
	/// Nothing readable (timeouts, pure-write acknowledgements).
	Empty,
	/// A decoded little-endian register value.
	Value(u32),
	/// One raw status packet, headers and checksum included.
	Packet(Vec<u8>),
	/// Several concatenated status packets, split at their headers.
	Packets(Vec<Vec<u8>>),
}

/// The universal result of a bus transaction.
///
/// `data` and `status` run in parallel: a single-packet exchange has one
/// verdict, a demultiplexed broadcast reply has one verdict per packet
/// in the same order as `Payload::Packets`. Callers of the sync/bulk
/// primitives rely on that pairing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
	pub data: Payload,
	pub status: SmallVec<[PacketStatus; 1]>,
}

impl Response {
	pub(crate) fn new(data: Payload, status: PacketStatus) -> Self {
		Self {
			data,
			status: smallvec::smallvec![status],
		}
	}

	pub(crate) fn transport(err: TransportError, data: Payload) -> Self {
		Self::new(data, PacketStatus::Transport(err))
	}

	/// True when every packet in the exchange validated cleanly.
	pub fn ok(&self) -> bool {
		self.status.iter().all(PacketStatus::is_ok)
	}

	/// The decoded register value, if this was a successful read.
	pub fn value(&self) -> Option<u32> {
		match self.data {
			Payload::Value(v) if self.ok() => Some(v),
			_ => None,
		}
	}

	/// Collapse into a typed result, keeping the first failure.
	pub fn check(self) -> Result<Payload, crate::Error> {
		for status in &self.status {
			match status {
				PacketStatus::Ok => {}
				PacketStatus::Transport(err) => return Err(crate::Error::Transport(*err)),
				PacketStatus::Device(errs) => return Err(crate::Error::Device(errs.clone())),
			}
		}
		Ok(self.data)
	}
}

/// Identifies which framing a codec speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
	V1,
	V2,
}

/// The generation-independent operation set.
///
/// Implemented by [`v1::Protocol1`] and [`v2::Protocol2`]; the servo
/// facade drives a device through this trait and never sees the framing
/// differences. Addresses and lengths are 16-bit here — v1 truncates
/// them to its 8-bit wire fields, which every v1 control table fits.
///
/// The methods are spelled as `-> impl Future + Send` rather than
/// `async fn` so the per-servo pollers built on top stay spawnable on
/// the executor.
pub trait Wire {
	fn version(&self) -> ProtocolVersion;

	fn ping(&self, id: u8) -> impl Future<Output = Response> + Send;

	/// Read `length` bytes starting at `address`.
	fn read(&self, id: u8, address: u16, length: u16) -> impl Future<Output = Response> + Send;

	/// Write `data` (already little-endian, register-width) at `address`.
	fn write(&self, id: u8, address: u16, data: &[u8]) -> impl Future<Output = Response> + Send;

	/// Stage a write to be committed by a later `ACTION`.
	fn reg_write(&self, id: u8, address: u16, data: &[u8])
	-> impl Future<Output = Response> + Send;

	/// Commit a previously staged `REG_WRITE`.
	fn action(&self, id: u8) -> impl Future<Output = Response> + Send;

	fn reboot(&self, id: u8) -> impl Future<Output = Response> + Send;

	fn factory_reset(&self, id: u8, scope: ResetScope) -> impl Future<Output = Response> + Send;
}

/// Little-endian helper: the register value as its on-wire bytes.
pub(crate) fn value_bytes(value: u32, width: usize) -> SmallVec<[u8; 4]> {
	value.to_le_bytes()[..width].iter().copied().collect()
}

/// Little-endian helper: decode up to four on-wire bytes.
pub(crate) fn bytes_value(bytes: &[u8]) -> u32 {
	let mut word = [0u8; 4];
	word[..bytes.len()].copy_from_slice(bytes);
	u32::from_le_bytes(word)
}
