//! The per-device facade: one physical servo on one bus.
//!
//! A [`Servo`] ties together a shared protocol instance, a device id, a
//! static control table and the model's conversion constants. The
//! generic register path ([`read_item`](Servo::read_item) /
//! [`write_item`](Servo::write_item)) is what every typed accessor in
//! [`devices`](crate::devices) desugars to: resolve the unit, convert,
//! range-check, encode, and hand the bytes to the wire. Frequently read
//! registers are mirrored in [`Mirrors`] by a background poller so hot
//! paths can ask "where is it now" without bus traffic.

use alloc::string::String;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use core::time::Duration;

use ahash::RandomState;
use hashbrown::HashMap;

use crate::bus::Delay;
use crate::error::Error;
use crate::protocol::{Payload, ResetScope, Wire, value_bytes};
use crate::table::{ControlTable, ControlTableItem};
use crate::units::{Unit, decode_signed, encode_signed};

/// Pause between two refresh cycles of the background poller.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// `f64::floor`, reimplemented for `no_std` where it is unavailable.
fn floor(value: f64) -> f64 {
	let truncated = value as i64 as f64;
	if value < truncated { truncated - 1.0 } else { truncated }
}

/// Last-known values of the frequently read registers.
///
/// Updated only by the poller; a failed refresh leaves the previous
/// value in place.
#[derive(Debug, Default)]
pub struct Mirrors {
	position: AtomicI32,
	moving: AtomicBool,
	torque_enabled: AtomicBool,
}

/// One servo bound to a shared protocol instance.
///
/// Cheap to clone; clones refer to the same protocol, bus and mirrors.
pub struct Servo<W> {
	name: String,
	id: u8,
	link: Arc<W>,
	table: &'static ControlTable,
	resolution: u32,
	rpm_step: f64,
	bauds: HashMap<u8, u32, RandomState>,
	default_unit: Option<Unit>,
	mirrors: Arc<Mirrors>,
}

impl<W> Clone for Servo<W> {
	fn clone(&self) -> Self {
		Self {
			name: self.name.clone(),
			id: self.id,
			link: self.link.clone(),
			table: self.table,
			resolution: self.resolution,
			rpm_step: self.rpm_step,
			bauds: self.bauds.clone(),
			default_unit: self.default_unit,
			mirrors: self.mirrors.clone(),
		}
	}
}

impl<W> Servo<W> {
	/// Bind a device. Called by the model constructors in
	/// [`devices`](crate::devices), which supply the table and the
	/// conversion constants.
	pub fn new(
		name: impl Into<String>,
		id: u8,
		link: Arc<W>,
		table: &'static ControlTable,
		resolution: u32,
		rpm_step: f64,
		baud_codes: &[(u8, u32)],
	) -> Self {
		let mut bauds = HashMap::with_hasher(RandomState::with_seeds(0, 0, 0, 0));
		bauds.extend(baud_codes.iter().copied());
		Self {
			name: name.into(),
			id,
			link,
			table,
			resolution,
			rpm_step,
			bauds,
			default_unit: None,
			mirrors: Arc::new(Mirrors::default()),
		}
	}

	/// Override the unit used when a call passes `None`.
	pub fn with_default_unit(mut self, unit: Unit) -> Self {
		self.default_unit = Some(unit);
		self
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn id(&self) -> u8 {
		self.id
	}

	/// The shared protocol instance this servo talks through.
	pub fn link(&self) -> &Arc<W> {
		&self.link
	}

	pub fn control_table(&self) -> &'static ControlTable {
		self.table
	}

	/// Register lookup by symbolic name.
	pub fn item(&self, name: &'static str) -> Result<&'static ControlTableItem, Error> {
		self.table.get(name).ok_or(Error::UnknownRegister(name))
	}

	/// Explicit argument, then the servo override, then the register's
	/// own default.
	fn resolve_unit(&self, explicit: Option<Unit>, item: &ControlTableItem) -> Unit {
		explicit.or(self.default_unit).unwrap_or(item.unit)
	}

	/// Engineering value → raw register value.
	pub fn convert_to_raw(&self, value: f64, unit: Unit) -> Result<i64, Error> {
		Ok(match unit {
			Unit::Raw | Unit::Percent | Unit::MilliAmpere => value as i64,
			Unit::Degree => floor((value / 360.0) * f64::from(self.resolution)) as i64,
			Unit::Voltage => floor(value * 10.0) as i64,
			Unit::Rpm => floor(value / self.rpm_step) as i64,
			Unit::Baud => {
				let bps = value as u32;
				self.bauds
					.iter()
					.find(|&(_, rate)| *rate == bps)
					.map(|(code, _)| i64::from(*code))
					.ok_or(Error::UnknownBaudRate(bps))?
			}
		})
	}

	/// Raw register value → engineering value.
	pub fn convert_from_raw(&self, raw: i64, unit: Unit) -> Result<f64, Error> {
		Ok(match unit {
			Unit::Raw | Unit::Percent | Unit::MilliAmpere => raw as f64,
			Unit::Degree => floor((raw as f64 / f64::from(self.resolution)) * 360.0),
			Unit::Voltage => raw as f64 / 10.0,
			Unit::Rpm => raw as f64 * self.rpm_step,
			Unit::Baud => {
				let code = u8::try_from(raw).map_err(|_| Error::UnknownBaudCode(u8::MAX))?;
				self.bauds
					.get(&code)
					.copied()
					.map(f64::from)
					.ok_or(Error::UnknownBaudCode(code))?
			}
		})
	}

	/// Mirror: last polled position, in raw encoder counts.
	pub fn present_position(&self) -> i32 {
		self.mirrors.position.load(Ordering::Relaxed)
	}

	/// Mirror: was the servo moving at the last poll?
	pub fn is_moving(&self) -> bool {
		self.mirrors.moving.load(Ordering::Relaxed)
	}

	/// Mirror: was torque enabled at the last poll?
	pub fn torque_enabled(&self) -> bool {
		self.mirrors.torque_enabled.load(Ordering::Relaxed)
	}
}

impl<W: Wire> Servo<W> {
	/// Read a register and decode it as signed two's complement of its
	/// width. No unit conversion.
	pub async fn read_raw(&self, item: &ControlTableItem) -> Result<i64, Error> {
		let response = self
			.link
			.read(self.id, item.address, item.width.bytes() as u16)
			.await;
		match response.check()? {
			Payload::Value(value) => Ok(decode_signed(value, item.width)),
			_ => Err(Error::MalformedResponse),
		}
	}

	/// Range-check a raw value and write it, two's-complement encoded.
	///
	/// A limit violation never reaches the bus.
	pub async fn write_raw(&self, item: &ControlTableItem, raw: i64) -> Result<(), Error> {
		if !item.access.writable() {
			return Err(Error::ReadOnly {
				register: item.name,
			});
		}
		item.limits.check(item.name, raw)?;
		let data = value_bytes(encode_signed(raw, item.width), item.width.bytes());
		self.link.write(self.id, item.address, &data).await.check()?;
		Ok(())
	}

	/// Read a register in engineering units.
	pub async fn read_item(
		&self,
		item: &ControlTableItem,
		unit: Option<Unit>,
	) -> Result<f64, Error> {
		let raw = self.read_raw(item).await?;
		self.convert_from_raw(raw, self.resolve_unit(unit, item))
	}

	/// Write a register given a value in engineering units.
	pub async fn write_item(
		&self,
		item: &ControlTableItem,
		value: f64,
		unit: Option<Unit>,
	) -> Result<(), Error> {
		let raw = self.convert_to_raw(value, self.resolve_unit(unit, item))?;
		self.write_raw(item, raw).await
	}

	pub async fn ping(&self) -> Result<(), Error> {
		self.link.ping(self.id).await.check().map(|_| ())
	}

	pub async fn reboot(&self) -> Result<(), Error> {
		self.link.reboot(self.id).await.check().map(|_| ())
	}

	pub async fn factory_reset(&self, scope: ResetScope) -> Result<(), Error> {
		self.link.factory_reset(self.id, scope).await.check().map(|_| ())
	}

	pub async fn torque_on(&self) -> Result<(), Error> {
		self.write_raw(self.item("TORQUE_ENABLE")?, 1).await
	}

	pub async fn torque_off(&self) -> Result<(), Error> {
		self.write_raw(self.item("TORQUE_ENABLE")?, 0).await
	}

	pub async fn led_on(&self) -> Result<(), Error> {
		self.write_raw(self.item("LED")?, 1).await
	}

	pub async fn led_off(&self) -> Result<(), Error> {
		self.write_raw(self.item("LED")?, 0).await
	}

	pub async fn set_goal_position(&self, value: f64, unit: Option<Unit>) -> Result<(), Error> {
		self.write_item(self.item("GOAL_POSITION")?, value, unit).await
	}

	pub async fn get_present_position(&self, unit: Option<Unit>) -> Result<f64, Error> {
		self.read_item(self.item("PRESENT_POSITION")?, unit).await
	}

	/// Configure the line rate the device should switch to.
	pub async fn set_baudrate(&self, bits_per_second: u32) -> Result<(), Error> {
		self.write_item(
			self.item("BAUD")?,
			f64::from(bits_per_second),
			Some(Unit::Baud),
		)
		.await
	}

	/// The device's configured line rate, in bit/s.
	pub async fn get_baud(&self) -> Result<u32, Error> {
		let bps = self.read_item(self.item("BAUD")?, Some(Unit::Baud)).await?;
		Ok(bps as u32)
	}

	/// One mirror refresh: position, moving flag, torque flag.
	///
	/// Read failures are logged and skipped; the stale mirror value
	/// survives until the next cycle succeeds.
	pub async fn poll_cycle(&self) {
		match self.read_named_raw("PRESENT_POSITION").await {
			Ok(raw) => self.mirrors.position.store(raw as i32, Ordering::Relaxed),
			Err(err) => warn!("{}: position refresh failed: {err}", self.name),
		}
		match self.read_named_raw("MOVING").await {
			Ok(raw) => self.mirrors.moving.store(raw != 0, Ordering::Relaxed),
			Err(err) => warn!("{}: moving refresh failed: {err}", self.name),
		}
		match self.read_named_raw("TORQUE_ENABLE").await {
			Ok(raw) => self
				.mirrors
				.torque_enabled
				.store(raw != 0, Ordering::Relaxed),
			Err(err) => warn!("{}: torque refresh failed: {err}", self.name),
		}
	}

	async fn read_named_raw(&self, name: &'static str) -> Result<i64, Error> {
		self.read_raw(self.item(name)?).await
	}
}

/// Spawn the cooperative task that keeps a servo's mirrors fresh.
///
/// Each read takes the bus lock like any foreground operation, so any
/// number of pollers and callers share the line safely.
pub fn spawn_poller<W, D>(servo: Servo<W>, delay: D)
where
	W: Wire + Send + Sync + 'static,
	D: Delay + Send + Sync + 'static,
{
	let label = format!("poller:{}", servo.name);
	crate::executor::spawn_named(label, async move {
		debug!("poller for {} (id {}) started", servo.name, servo.id);
		loop {
			servo.poll_cycle().await;
			delay.sleep(POLL_INTERVAL).await;
		}
	});
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::bus::BusConfig;
	use crate::control_table;
	use crate::executor::block_on;
	use crate::mock::MockBus;
	use crate::protocol::v2::{Protocol2, crc16};
	use crate::table::Limits;

	use float_cmp::assert_approx_eq;

	control_table! {
		static TEST_TABLE = [
			MODEL_NUMBER: 0, Two, R;
			BAUD: 8, One, Rw, limits: Limits::values(&[0, 1, 2, 3]), unit: Baud;
			TORQUE_ENABLE: 64, One, Rw, limits: Limits::values(&[0, 1]);
			GOAL_POSITION: 116, Four, Rw, limits: Limits::range(0, 4095), unit: Degree;
			PRESENT_POSITION: 132, Four, R, unit: Degree;
			MOVING: 122, One, R;
		];
	}

	const BAUDS: &[(u8, u32)] = &[(0, 9_600), (1, 57_600), (2, 115_200), (3, 1_000_000)];

	fn servo(link: &MockBus) -> Servo<Protocol2<MockBus, MockBus>> {
		let proto = Arc::new(Protocol2::new(
			link.clone(),
			link.clone(),
			BusConfig::default(),
		));
		Servo::new("test", 1, proto, &TEST_TABLE, 4096, 0.229, BAUDS)
	}

	fn push_read_reply(link: &MockBus, value: u32, width: usize) {
		let mut reply = alloc::vec![0xFF, 0xFF, 0xFD, 0x00, 0x01];
		let length = (width + 4) as u16;
		reply.extend_from_slice(&length.to_le_bytes());
		reply.push(0x55);
		reply.push(0x00);
		reply.extend_from_slice(&value.to_le_bytes()[..width]);
		let crc = crc16(&reply);
		reply.extend_from_slice(&crc.to_le_bytes());
		link.push_reply(&reply);
	}

	fn push_write_ack(link: &MockBus) {
		let mut reply = alloc::vec![0xFF, 0xFF, 0xFD, 0x00, 0x01, 0x04, 0x00, 0x55, 0x00];
		let crc = crc16(&reply);
		reply.extend_from_slice(&crc.to_le_bytes());
		link.push_reply(&reply);
	}

	#[test]
	fn degree_conversions_match_resolution() {
		let link = MockBus::new();
		let s = servo(&link);
		assert_eq!(s.convert_to_raw(180.0, Unit::Degree).unwrap(), 2048);
		assert_approx_eq!(
			f64,
			s.convert_from_raw(2048, Unit::Degree).unwrap(),
			180.0
		);
		// A 1024-count model.
		let coarse = Servo::new(
			"ax",
			2,
			s.link().clone(),
			&TEST_TABLE,
			1024,
			0.111,
			BAUDS,
		);
		assert_eq!(coarse.convert_to_raw(90.0, Unit::Degree).unwrap(), 256);
		assert_approx_eq!(
			f64,
			coarse.convert_from_raw(256, Unit::Degree).unwrap(),
			90.0
		);
	}

	#[test]
	fn voltage_and_rpm_conversions() {
		let link = MockBus::new();
		let s = servo(&link);
		assert_eq!(s.convert_to_raw(11.1, Unit::Voltage).unwrap(), 111);
		assert_approx_eq!(f64, s.convert_from_raw(111, Unit::Voltage).unwrap(), 11.1);
		// to_raw floors: 22.9 / 0.229 lands just under 100 in binary.
		assert_eq!(s.convert_to_raw(22.9, Unit::Rpm).unwrap(), 99);
		assert_approx_eq!(f64, s.convert_from_raw(100, Unit::Rpm).unwrap(), 22.9);
	}

	#[test]
	fn baud_lookups_go_both_ways() {
		let link = MockBus::new();
		let s = servo(&link);
		assert_eq!(s.convert_to_raw(57_600.0, Unit::Baud).unwrap(), 1);
		assert_approx_eq!(f64, s.convert_from_raw(3, Unit::Baud).unwrap(), 1_000_000.0);
		assert_eq!(
			s.convert_to_raw(19_200.0, Unit::Baud),
			Err(Error::UnknownBaudRate(19_200))
		);
		assert_eq!(
			s.convert_from_raw(9, Unit::Baud),
			Err(Error::UnknownBaudCode(9))
		);
	}

	#[test]
	fn limit_violations_produce_no_bus_traffic() {
		let link = MockBus::new();
		let s = servo(&link);
		let err = block_on(s.set_goal_position(720.0, None)).unwrap_err();
		assert!(matches!(err, Error::ValueOutOfRange { max: 4095, .. }));
		// Torque enable only accepts 0 and 1.
		let item = s.item("TORQUE_ENABLE").unwrap();
		let err = block_on(s.write_raw(item, 2)).unwrap_err();
		assert!(matches!(err, Error::ValueNotAllowed { value: 2, .. }));
		assert!(link.writes().is_empty(), "a malformed write reached the bus");
	}

	#[test]
	fn read_only_registers_reject_writes_locally() {
		let link = MockBus::new();
		let s = servo(&link);
		let item = s.item("PRESENT_POSITION").unwrap();
		let err = block_on(s.write_raw(item, 0)).unwrap_err();
		assert!(matches!(err, Error::ReadOnly { .. }));
		assert!(link.writes().is_empty());
	}

	#[test]
	fn goal_position_write_converts_degrees() {
		let link = MockBus::new();
		let s = servo(&link);
		push_write_ack(&link);
		block_on(s.set_goal_position(45.0, None)).unwrap();
		let writes = link.writes();
		// 45° at 4096 counts/rev = 512, little-endian over four bytes.
		assert_eq!(
			&writes[0][8..14],
			&[0x74, 0x00, 0x00, 0x02, 0x00, 0x00],
			"unexpected write params"
		);
	}

	#[test]
	fn present_position_decodes_signed_and_converts() {
		let link = MockBus::new();
		let s = servo(&link);
		push_read_reply(&link, 2048, 4);
		let degrees = block_on(s.get_present_position(None)).unwrap();
		assert_approx_eq!(f64, degrees, 180.0);

		// A negative multi-turn position in raw units.
		push_read_reply(&link, -4096i32 as u32, 4);
		let raw = block_on(s.get_present_position(Some(Unit::Raw))).unwrap();
		assert_approx_eq!(f64, raw, -4096.0);
	}

	#[test]
	fn servo_override_beats_the_register_default_unit() {
		let link = MockBus::new();
		let s = servo(&link).with_default_unit(Unit::Raw);
		push_read_reply(&link, 2048, 4);
		// PRESENT_POSITION defaults to degrees, but the servo-wide
		// override says raw.
		let raw = block_on(s.get_present_position(None)).unwrap();
		assert_approx_eq!(f64, raw, 2048.0);
	}

	#[test]
	fn device_errors_surface_as_typed_errors() {
		let link = MockBus::new();
		let s = servo(&link);
		// err byte with the access bit set.
		let mut reply = alloc::vec![0xFF, 0xFF, 0xFD, 0x00, 0x01, 0x04, 0x00, 0x55, 0x40];
		let crc = crc16(&reply);
		reply.extend_from_slice(&crc.to_le_bytes());
		link.push_reply(&reply);
		let err = block_on(s.torque_on()).unwrap_err();
		assert!(matches!(err, Error::Device(_)));
	}

	#[test]
	fn poll_cycle_updates_mirrors_and_tolerates_errors() {
		let link = MockBus::new();
		let s = servo(&link);
		push_read_reply(&link, 1000, 4); // position
		push_read_reply(&link, 1, 1); // moving
		push_read_reply(&link, 1, 1); // torque
		block_on(s.poll_cycle());
		assert_eq!(s.present_position(), 1000);
		assert!(s.is_moving());
		assert!(s.torque_enabled());

		// Nothing queued: every read times out, mirrors keep their
		// last-known values.
		block_on(s.poll_cycle());
		assert_eq!(s.present_position(), 1000);
		assert!(s.is_moving());
		assert!(s.torque_enabled());
	}

	#[test]
	fn background_poller_runs_on_the_executor() {
		let link = MockBus::new();
		let s = servo(&link);
		push_read_reply(&link, 321, 4);
		push_read_reply(&link, 0, 1);
		push_read_reply(&link, 1, 1);
		spawn_poller(s.clone(), link.clone());
		// The torque flag is the last mirror a cycle refreshes.
		for _ in 0..1_000 {
			if s.torque_enabled() {
				break;
			}
			crate::executor::run();
		}
		assert_eq!(s.present_position(), 321);
		assert!(!s.is_moving());
		assert!(s.torque_enabled());
	}
}
