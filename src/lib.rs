//! Host-side driver for Dynamixel-family smart servos on a shared
//! half-duplex serial bus.
//!
//! The crate is layered the way the bus is layered:
//!
//! - [`bus`] owns the transport abstraction and the mutual-exclusion
//!   discipline around the direction-enable line.
//! - [`protocol`] implements the two incompatible wire protocols
//!   ([`protocol::v1`] and [`protocol::v2`]): packet framing, checksums,
//!   byte stuffing and the receive-side resynchronization.
//! - [`table`] and [`units`] describe per-model register layouts and the
//!   raw ↔ engineering-unit conversions.
//! - [`servo`] combines a protocol instance, a device id and a control
//!   table into the typed per-device facade, including the cached
//!   register mirrors refreshed by a background poller.
//! - [`devices`] binds concrete servo models (AX-12A, XL430-W250-T).
//! - [`executor`] is the minimal cooperative scheduler the pollers and
//!   foreground operations share.
//!
//! Nothing in here talks to hardware directly: a port supplies the
//! [`bus::BusTransport`] and [`bus::Delay`] implementations, and the
//! [`mock`] module provides scripted stand-ins for tests.
//!
//! ```no_run
//! extern crate alloc;
//!
//! use alloc::sync::Arc;
//!
//! use dynamixel::bus::BusConfig;
//! use dynamixel::devices::xl430::Xl430;
//! use dynamixel::executor;
//! use dynamixel::mock::MockBus;
//! use dynamixel::protocol::v2::Protocol2;
//!
//! let link = MockBus::new();
//! let proto = Arc::new(Protocol2::new(link.clone(), link.clone(), BusConfig::default()));
//! let pan = Xl430::new("pan", 1, proto);
//!
//! executor::block_on(async {
//! 	pan.torque_on().await?;
//! 	pan.set_goal_position(90.0, None).await?;
//! 	pan.get_present_position(None).await
//! })
//! .unwrap();
//! ```
#![cfg_attr(not(test), no_std)]
#![cfg_attr(feature = "document-features", doc = document_features::document_features!())]

#[macro_use]
extern crate alloc;
#[macro_use]
extern crate log;

pub mod bus;
pub mod devices;
mod error;
pub mod executor;
pub mod mock;
pub mod protocol;
pub mod servo;
pub mod table;
pub mod units;

pub use crate::bus::{Bus, BusConfig, BusTransport, Delay};
pub use crate::error::Error;
pub use crate::protocol::{
	BROADCAST_ID, DeviceError, PacketStatus, Payload, Response, TransportError, Wire,
};
pub use crate::servo::Servo;
pub use crate::units::Unit;
