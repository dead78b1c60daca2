//! AX-12A: the classic Protocol 1.0 servo.
//!
//! 1024-count encoder over a 300° range, 0.111 RPM per speed unit, and
//! no operating-mode register: joint versus wheel mode is expressed by
//! writing the CW/CCW angle-limit pair.

use alloc::string::String;
use alloc::sync::Arc;
use core::ops::Deref;

use crate::bus::{BusTransport, Delay};
use crate::error::Error;
use crate::protocol::v1::Protocol1;
use crate::servo::{Servo, spawn_poller};
use crate::table::Limits;
use crate::{control_table, register_accessors};

/// Encoder counts for a full revolution.
pub const RESOLUTION: u32 = 1024;
/// RPM represented by one raw speed unit.
pub const RPM_STEP: f64 = 0.111;

/// Raw baud code → bit/s.
pub const BAUDS: &[(u8, u32)] = &[
	(1, 1_000_000),
	(3, 500_000),
	(4, 400_000),
	(7, 250_000),
	(9, 200_000),
	(16, 115_200),
	(34, 57_600),
	(103, 19_200),
	(207, 9_600),
];

const BAUD_CODES: &[i64] = &[1, 3, 4, 7, 9, 16, 34, 103, 207];

/// Joint mode holds a position; wheel mode spins continuously. The
/// device derives the mode from the angle-limit pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatingMode {
	Joint,
	Wheel,
}

impl OperatingMode {
	/// The `(CW_ANGLE_LIMIT, CCW_ANGLE_LIMIT)` pair encoding this mode.
	fn angle_limits(self) -> (i64, i64) {
		match self {
			OperatingMode::Joint => (0, 0),
			OperatingMode::Wheel => (1, 1),
		}
	}
}

control_table! {
	/// AX-12A register map.
	pub static CONTROL_TABLE = [
		MODEL_NUMBER: 0, Two, R;
		FIRMWARE_VERSION: 2, One, R;
		ID: 3, One, Rw, limits: Limits::range(0, 253);
		BAUD: 4, One, Rw, limits: Limits::values(BAUD_CODES), unit: Baud;
		RETURN_DELAY_TIME: 5, One, Rw, limits: Limits::range(0, 254);
		CW_ANGLE_LIMIT: 6, Two, Rw, limits: Limits::range(0, 1023), unit: Degree;
		CCW_ANGLE_LIMIT: 8, Two, Rw, limits: Limits::range(0, 1023), unit: Degree;
		TEMPERATURE_LIMIT: 11, One, Rw, limits: Limits::range(0, 150);
		MIN_VOLTAGE_LIMIT: 12, One, Rw, limits: Limits::range(50, 160), unit: Voltage;
		MAX_VOLTAGE_LIMIT: 13, One, Rw, limits: Limits::range(50, 160), unit: Voltage;
		MAX_TORQUE: 14, Two, Rw, limits: Limits::range(0, 1023);
		STATUS_RETURN_LEVEL: 16, One, Rw, limits: Limits::values(&[0, 1, 2]);
		ALARM_LED: 17, One, Rw;
		SHUTDOWN: 18, One, Rw;
		TORQUE_ENABLE: 24, One, Rw, limits: Limits::values(&[0, 1]);
		LED: 25, One, Rw, limits: Limits::values(&[0, 1]);
		CW_COMPLIANCE_MARGIN: 26, One, Rw, limits: Limits::range(0, 255);
		CCW_COMPLIANCE_MARGIN: 27, One, Rw, limits: Limits::range(0, 255);
		CW_COMPLIANCE_SLOPE: 28, One, Rw, limits: Limits::range(0, 254);
		CCW_COMPLIANCE_SLOPE: 29, One, Rw, limits: Limits::range(0, 254);
		GOAL_POSITION: 30, Two, Rw, limits: Limits::range(0, 1023), unit: Degree;
		MOVING_SPEED: 32, Two, Rw, limits: Limits::range(0, 2047), unit: Rpm;
		TORQUE_LIMIT: 34, Two, Rw, limits: Limits::range(0, 1023);
		PRESENT_POSITION: 36, Two, R, unit: Degree;
		PRESENT_SPEED: 38, Two, R;
		PRESENT_LOAD: 40, Two, R;
		PRESENT_VOLTAGE: 42, One, R, unit: Voltage;
		PRESENT_TEMPERATURE: 43, One, R;
		REGISTERED: 44, One, R;
		MOVING: 46, One, R;
		LOCK: 47, One, Rw, limits: Limits::values(&[0, 1]);
		PUNCH: 48, Two, Rw, limits: Limits::range(32, 1023);
	];
}

/// One AX-12A on a Protocol 1.0 bus.
pub struct Ax12a<T: BusTransport, D: Delay> {
	servo: Servo<Protocol1<T, D>>,
}

impl<T: BusTransport, D: Delay> Deref for Ax12a<T, D> {
	type Target = Servo<Protocol1<T, D>>;

	fn deref(&self) -> &Self::Target {
		&self.servo
	}
}

impl<T, D> Ax12a<T, D>
where
	T: BusTransport + Send,
	D: Delay + Send + Sync,
{
	pub fn new(name: impl Into<String>, id: u8, link: Arc<Protocol1<T, D>>) -> Self {
		Self {
			servo: Servo::new(name, id, link, &CONTROL_TABLE, RESOLUTION, RPM_STEP, BAUDS),
		}
	}

	/// Switch between joint and wheel mode by writing the angle-limit
	/// pair.
	pub async fn set_operating_mode(&self, mode: OperatingMode) -> Result<(), Error> {
		let (cw, ccw) = mode.angle_limits();
		self.servo.write_raw(self.servo.item("CW_ANGLE_LIMIT")?, cw).await?;
		self.servo
			.write_raw(self.servo.item("CCW_ANGLE_LIMIT")?, ccw)
			.await
	}

	pub async fn set_goal_velocity(
		&self,
		value: f64,
		unit: Option<crate::units::Unit>,
	) -> Result<(), Error> {
		self.servo
			.write_item(self.servo.item("MOVING_SPEED")?, value, unit)
			.await
	}

	pub async fn get_present_velocity(
		&self,
		unit: Option<crate::units::Unit>,
	) -> Result<f64, Error> {
		self.servo
			.read_item(self.servo.item("PRESENT_SPEED")?, unit)
			.await
	}

	pub async fn set_max_position(
		&self,
		value: f64,
		unit: Option<crate::units::Unit>,
	) -> Result<(), Error> {
		self.servo
			.write_item(self.servo.item("CW_ANGLE_LIMIT")?, value, unit)
			.await
	}

	pub async fn set_min_position(
		&self,
		value: f64,
		unit: Option<crate::units::Unit>,
	) -> Result<(), Error> {
		self.servo
			.write_item(self.servo.item("CCW_ANGLE_LIMIT")?, value, unit)
			.await
	}

	/// `(min, max)` position limits in the resolved unit.
	pub async fn get_position_limits(
		&self,
		unit: Option<crate::units::Unit>,
	) -> Result<(f64, f64), Error> {
		let max = self
			.servo
			.read_item(self.servo.item("CW_ANGLE_LIMIT")?, unit)
			.await?;
		let min = self
			.servo
			.read_item(self.servo.item("CCW_ANGLE_LIMIT")?, unit)
			.await?;
		Ok((min, max))
	}

	register_accessors! {
		MODEL_NUMBER => get_model_number;
		FIRMWARE_VERSION => get_firmware_version;
		ID => get_id, set_id;
		RETURN_DELAY_TIME => get_return_delay_time, set_return_delay_time;
		CW_ANGLE_LIMIT => get_cw_angle_limit, set_cw_angle_limit;
		CCW_ANGLE_LIMIT => get_ccw_angle_limit, set_ccw_angle_limit;
		TEMPERATURE_LIMIT => get_temperature_limit, set_temperature_limit;
		MIN_VOLTAGE_LIMIT => get_min_voltage_limit, set_min_voltage_limit;
		MAX_VOLTAGE_LIMIT => get_max_voltage_limit, set_max_voltage_limit;
		MAX_TORQUE => get_max_torque, set_max_torque;
		STATUS_RETURN_LEVEL => get_status_return_level, set_status_return_level;
		ALARM_LED => get_alarm_led, set_alarm_led;
		SHUTDOWN => get_shutdown, set_shutdown;
		TORQUE_ENABLE => get_torque_enable, set_torque_enable;
		LED => get_led, set_led;
		CW_COMPLIANCE_MARGIN => get_cw_compliance_margin, set_cw_compliance_margin;
		CCW_COMPLIANCE_MARGIN => get_ccw_compliance_margin, set_ccw_compliance_margin;
		CW_COMPLIANCE_SLOPE => get_cw_compliance_slope, set_cw_compliance_slope;
		CCW_COMPLIANCE_SLOPE => get_ccw_compliance_slope, set_ccw_compliance_slope;
		GOAL_POSITION => get_goal_position, set_goal_position;
		MOVING_SPEED => get_moving_speed, set_moving_speed;
		TORQUE_LIMIT => get_torque_limit, set_torque_limit;
		PRESENT_POSITION => get_present_position;
		PRESENT_SPEED => get_present_speed;
		PRESENT_LOAD => get_present_load;
		PRESENT_VOLTAGE => get_present_voltage;
		PRESENT_TEMPERATURE => get_present_temperature;
		REGISTERED => get_registered;
		MOVING => get_moving;
		LOCK => get_lock, set_lock;
		PUNCH => get_punch, set_punch;
	}
}

impl<T, D> Ax12a<T, D>
where
	T: BusTransport + Send + 'static,
	D: Delay + Send + Sync + 'static,
{
	/// Keep this servo's mirrors fresh in the background.
	pub fn start_poller(&self, delay: impl Delay + Send + Sync + 'static) {
		spawn_poller(self.servo.clone(), delay);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::bus::BusConfig;
	use crate::executor::block_on;
	use crate::mock::MockBus;
	use crate::protocol::Instruction;
	use crate::protocol::v1::checksum;

	fn device(link: &MockBus) -> Ax12a<MockBus, MockBus> {
		let proto = Arc::new(Protocol1::new(
			link.clone(),
			link.clone(),
			BusConfig::default(),
		));
		Ax12a::new("base", 1, proto)
	}

	fn push_write_ack(link: &MockBus) {
		let mut reply = alloc::vec![0xFF, 0xFF, 0x01, 0x02, 0x00];
		reply.push(checksum(&reply));
		link.push_reply(&reply);
	}

	#[test]
	fn table_has_no_overlapping_registers() {
		assert_eq!(CONTROL_TABLE.overlapping_pair(), None);
	}

	#[test]
	fn torque_on_writes_the_v1_register() {
		let link = MockBus::new();
		let d = device(&link);
		push_write_ack(&link);
		block_on(d.torque_on()).unwrap();
		let writes = link.writes();
		// FF FF id len WRITE addr value chk
		assert_eq!(writes[0][4], u8::from(Instruction::Write));
		assert_eq!(&writes[0][5..7], &[24, 1]);
	}

	#[test]
	fn operating_mode_writes_both_angle_limits() {
		let link = MockBus::new();
		let d = device(&link);
		push_write_ack(&link);
		push_write_ack(&link);
		block_on(d.set_operating_mode(OperatingMode::Wheel)).unwrap();
		let writes = link.writes();
		assert_eq!(writes.len(), 2);
		// CW limit then CCW limit, both set to 1.
		assert_eq!(&writes[0][5..8], &[6, 1, 0]);
		assert_eq!(&writes[1][5..8], &[8, 1, 0]);
	}

	#[test]
	fn goal_position_defaults_to_degrees() {
		let link = MockBus::new();
		let d = device(&link);
		push_write_ack(&link);
		// 90° at 1024 counts/rev = 256.
		block_on(d.set_goal_position(90.0, None)).unwrap();
		let writes = link.writes();
		assert_eq!(&writes[0][5..8], &[30, 0x00, 0x01]);
	}

	#[test]
	fn goal_position_beyond_the_encoder_range_is_rejected() {
		let link = MockBus::new();
		let d = device(&link);
		let err = block_on(d.set_goal_position(400.0, None)).unwrap_err();
		assert!(matches!(err, Error::ValueOutOfRange { max: 1023, .. }));
		assert!(link.writes().is_empty());
	}

	#[test]
	fn baud_codes_resolve_to_rates() {
		let link = MockBus::new();
		let d = device(&link);
		push_write_ack(&link);
		// 57600 bit/s is code 34 on this model.
		block_on(d.set_baudrate(57_600)).unwrap();
		let writes = link.writes();
		assert_eq!(&writes[0][5..7], &[4, 34]);
	}
}
