use thiserror::Error;

use crate::protocol::{DeviceErrors, TransportError};

/// Crate-level error for the typed servo operations.
///
/// The first three variants surface what the bus reported; the rest are
/// precondition failures raised before any byte is transmitted.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
	#[error("transport failure: {0}")]
	Transport(#[from] TransportError),
	#[error("device reported {0:?}")]
	Device(DeviceErrors),
	#[error("status packet carried no usable value")]
	MalformedResponse,
	#[error("{register}: value {value} outside [{min}, {max}]")]
	ValueOutOfRange {
		register: &'static str,
		value: i64,
		min: i64,
		max: i64,
	},
	#[error("{register}: value {value} is not an allowed setting")]
	ValueNotAllowed { register: &'static str, value: i64 },
	#[error("{register} is read-only")]
	ReadOnly { register: &'static str },
	#[error("no register named {0} in this control table")]
	UnknownRegister(&'static str),
	#[error("no baud code maps to {0} bit/s on this model")]
	UnknownBaudRate(u32),
	#[error("baud code {0} is not defined for this model")]
	UnknownBaudCode(u8),
}

impl Error {
	/// True when the failure happened on the wire rather than locally.
	pub fn is_bus_error(&self) -> bool {
		matches!(
			self,
			Error::Transport(_) | Error::Device(_) | Error::MalformedResponse
		)
	}
}
