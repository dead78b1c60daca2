//! XL430-W250-T: a Protocol 2.0 workhorse.
//!
//! 4096-count encoder, 0.229 RPM per velocity unit, a real operating-
//! mode register, and the v2-only conveniences (position/error clear,
//! control-table backup).

use alloc::string::String;
use alloc::sync::Arc;
use core::ops::Deref;

use num_enum::IntoPrimitive;

use crate::bus::{BusTransport, Delay};
use crate::error::Error;
use crate::protocol::v2::{BackupKind, ClearKind, Protocol2};
use crate::servo::{Servo, spawn_poller};
use crate::table::Limits;
use crate::{control_table, register_accessors};

/// Encoder counts for a full revolution.
pub const RESOLUTION: u32 = 4096;
/// RPM represented by one raw velocity unit.
pub const RPM_STEP: f64 = 0.229;

/// Raw baud code → bit/s.
pub const BAUDS: &[(u8, u32)] = &[
	(0, 9_600),
	(1, 57_600),
	(2, 115_200),
	(3, 1_000_000),
	(4, 2_000_000),
	(5, 3_000_000),
	(6, 4_000_000),
	(7, 4_500_000),
];

/// Value written to `OPERATING_MODE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
#[repr(u8)]
pub enum OperatingMode {
	Velocity = 1,
	Position = 3,
	ExtendedPosition = 4,
	Pwm = 16,
}

control_table! {
	/// XL430-W250-T register map.
	pub static CONTROL_TABLE = [
		MODEL_NUMBER: 0, Two, R;
		MODEL_INFORMATION: 2, Four, R;
		FIRMWARE_VERSION: 6, One, R;
		ID: 7, One, Rw, limits: Limits::range(0, 253);
		BAUD: 8, One, Rw, limits: Limits::range(0, 7), unit: Baud;
		RETURN_DELAY_TIME: 9, One, Rw, limits: Limits::range(0, 254);
		DRIVE_MODE: 10, One, Rw, limits: Limits::range(0, 13);
		OPERATING_MODE: 11, One, Rw, limits: Limits::values(&[1, 3, 4, 16]);
		SECONDARY_SHADOW_ID: 12, One, Rw, limits: Limits::range(0, 255);
		PROTOCOL_TYPE: 13, One, Rw, limits: Limits::values(&[1, 2]);
		HOMING_OFFSET: 20, Four, Rw, limits: Limits::range(-1_044_479, 1_044_479);
		MOVING_THRESHOLD: 24, Four, Rw, limits: Limits::range(0, 1023);
		TEMPERATURE_LIMIT: 31, One, Rw, limits: Limits::range(0, 100);
		MAX_VOLTAGE_LIMIT: 32, Two, Rw, limits: Limits::range(60, 140), unit: Voltage;
		MIN_VOLTAGE_LIMIT: 34, Two, Rw, limits: Limits::range(60, 140), unit: Voltage;
		PWM_LIMIT: 36, Two, Rw, limits: Limits::range(0, 885);
		VELOCITY_LIMIT: 44, Four, Rw, limits: Limits::range(0, 1023);
		MAX_POSITION_LIMIT: 48, Four, Rw, limits: Limits::range(0, 4095), unit: Degree;
		MIN_POSITION_LIMIT: 52, Four, Rw, limits: Limits::range(0, 4095), unit: Degree;
		STARTUP_CONFIGURATION: 60, One, Rw, limits: Limits::range(0, 3);
		SHUTDOWN: 63, One, Rw;
		TORQUE_ENABLE: 64, One, Rw, limits: Limits::values(&[0, 1]);
		LED: 65, One, Rw, limits: Limits::values(&[0, 1]);
		STATUS_RETURN_LEVEL: 68, One, Rw, limits: Limits::values(&[0, 1, 2]);
		REGISTERED_INSTRUCTION: 69, One, R;
		HARDWARE_ERROR_STATUS: 70, One, R;
		VELOCITY_I_GAIN: 76, Two, Rw, limits: Limits::range(0, 16383);
		VELOCITY_P_GAIN: 78, Two, Rw, limits: Limits::range(0, 16383);
		POSITION_D_GAIN: 80, Two, Rw, limits: Limits::range(0, 16383);
		POSITION_I_GAIN: 82, Two, Rw, limits: Limits::range(0, 16383);
		POSITION_P_GAIN: 84, Two, Rw, limits: Limits::range(0, 16383);
		FEEDFORWARD_2ND_GAIN: 88, Two, Rw, limits: Limits::range(0, 16383);
		FEEDFORWARD_1ST_GAIN: 90, Two, Rw, limits: Limits::range(0, 16383);
		BUS_WATCHDOG: 98, One, Rw, limits: Limits::range(0, 127);
		GOAL_PWM: 100, Two, Rw, limits: Limits::range(-885, 885);
		GOAL_VELOCITY: 104, Four, Rw, limits: Limits::range(-1023, 1023), unit: Rpm;
		PROFILE_ACCELERATION: 108, Four, Rw, limits: Limits::range(0, 32767);
		PROFILE_VELOCITY: 112, Four, Rw, limits: Limits::range(0, 32767);
		GOAL_POSITION: 116, Four, Rw, limits: Limits::range(0, 4095), unit: Degree;
		REALTIME_TICK: 120, Two, R;
		MOVING: 122, One, R;
		MOVING_STATUS: 123, One, R;
		PRESENT_PWM: 124, Two, R;
		PRESENT_LOAD: 126, Two, R;
		PRESENT_VELOCITY: 128, Four, R, unit: Rpm;
		PRESENT_POSITION: 132, Four, R, unit: Degree;
		VELOCITY_TRAJECTORY: 136, Four, R;
		POSITION_TRAJECTORY: 140, Four, R;
		PRESENT_INPUT_VOLTAGE: 144, Two, R, unit: Voltage;
		PRESENT_TEMPERATURE: 146, One, R;
		BACKUP_READY: 147, One, R;
	];
}

/// One XL430-W250-T on a Protocol 2.0 bus.
pub struct Xl430<T: BusTransport, D: Delay> {
	servo: Servo<Protocol2<T, D>>,
}

impl<T: BusTransport, D: Delay> Deref for Xl430<T, D> {
	type Target = Servo<Protocol2<T, D>>;

	fn deref(&self) -> &Self::Target {
		&self.servo
	}
}

impl<T, D> Xl430<T, D>
where
	T: BusTransport + Send,
	D: Delay + Send + Sync,
{
	pub fn new(name: impl Into<String>, id: u8, link: Arc<Protocol2<T, D>>) -> Self {
		Self {
			servo: Servo::new(name, id, link, &CONTROL_TABLE, RESOLUTION, RPM_STEP, BAUDS),
		}
	}

	pub async fn set_operating_mode(&self, mode: OperatingMode) -> Result<(), Error> {
		self.servo
			.write_raw(self.servo.item("OPERATING_MODE")?, i64::from(u8::from(mode)))
			.await
	}

	/// Reset the multi-turn position or clear a latched error.
	pub async fn clear(&self, kind: ClearKind) -> Result<(), Error> {
		self.servo
			.link()
			.clear(self.servo.id(), kind)
			.await
			.check()
			.map(|_| ())
	}

	/// Snapshot the control table into the device's backup area, or
	/// bring the snapshot back.
	pub async fn control_table_backup(&self, kind: BackupKind) -> Result<(), Error> {
		self.servo
			.link()
			.control_table_backup(self.servo.id(), kind)
			.await
			.check()
			.map(|_| ())
	}

	pub async fn set_goal_velocity(
		&self,
		value: f64,
		unit: Option<crate::units::Unit>,
	) -> Result<(), Error> {
		self.servo
			.write_item(self.servo.item("GOAL_VELOCITY")?, value, unit)
			.await
	}

	pub async fn get_present_velocity(
		&self,
		unit: Option<crate::units::Unit>,
	) -> Result<f64, Error> {
		self.servo
			.read_item(self.servo.item("PRESENT_VELOCITY")?, unit)
			.await
	}

	pub async fn set_goal_pwm(
		&self,
		value: f64,
		unit: Option<crate::units::Unit>,
	) -> Result<(), Error> {
		self.servo
			.write_item(self.servo.item("GOAL_PWM")?, value, unit)
			.await
	}

	pub async fn get_present_pwm(
		&self,
		unit: Option<crate::units::Unit>,
	) -> Result<f64, Error> {
		self.servo
			.read_item(self.servo.item("PRESENT_PWM")?, unit)
			.await
	}

	pub async fn set_max_position(
		&self,
		value: f64,
		unit: Option<crate::units::Unit>,
	) -> Result<(), Error> {
		self.servo
			.write_item(self.servo.item("MAX_POSITION_LIMIT")?, value, unit)
			.await
	}

	pub async fn set_min_position(
		&self,
		value: f64,
		unit: Option<crate::units::Unit>,
	) -> Result<(), Error> {
		self.servo
			.write_item(self.servo.item("MIN_POSITION_LIMIT")?, value, unit)
			.await
	}

	/// `(min, max)` position limits in the resolved unit.
	pub async fn get_position_limits(
		&self,
		unit: Option<crate::units::Unit>,
	) -> Result<(f64, f64), Error> {
		let max = self
			.servo
			.read_item(self.servo.item("MAX_POSITION_LIMIT")?, unit)
			.await?;
		let min = self
			.servo
			.read_item(self.servo.item("MIN_POSITION_LIMIT")?, unit)
			.await?;
		Ok((min, max))
	}

	register_accessors! {
		MODEL_NUMBER => get_model_number;
		MODEL_INFORMATION => get_model_information;
		FIRMWARE_VERSION => get_firmware_version;
		ID => get_id, set_id;
		RETURN_DELAY_TIME => get_return_delay_time, set_return_delay_time;
		DRIVE_MODE => get_drive_mode, set_drive_mode;
		OPERATING_MODE => get_operating_mode, set_operating_mode_raw;
		SECONDARY_SHADOW_ID => get_secondary_shadow_id, set_secondary_shadow_id;
		PROTOCOL_TYPE => get_protocol_type, set_protocol_type;
		HOMING_OFFSET => get_homing_offset, set_homing_offset;
		MOVING_THRESHOLD => get_moving_threshold, set_moving_threshold;
		TEMPERATURE_LIMIT => get_temperature_limit, set_temperature_limit;
		MAX_VOLTAGE_LIMIT => get_max_voltage_limit, set_max_voltage_limit;
		MIN_VOLTAGE_LIMIT => get_min_voltage_limit, set_min_voltage_limit;
		PWM_LIMIT => get_pwm_limit, set_pwm_limit;
		VELOCITY_LIMIT => get_velocity_limit, set_velocity_limit;
		MAX_POSITION_LIMIT => get_max_position_limit, set_max_position_limit;
		MIN_POSITION_LIMIT => get_min_position_limit, set_min_position_limit;
		STARTUP_CONFIGURATION => get_startup_configuration, set_startup_configuration;
		SHUTDOWN => get_shutdown, set_shutdown;
		TORQUE_ENABLE => get_torque_enable, set_torque_enable;
		LED => get_led, set_led;
		STATUS_RETURN_LEVEL => get_status_return_level, set_status_return_level;
		REGISTERED_INSTRUCTION => get_registered_instruction;
		HARDWARE_ERROR_STATUS => get_hardware_error_status;
		VELOCITY_I_GAIN => get_velocity_i_gain, set_velocity_i_gain;
		VELOCITY_P_GAIN => get_velocity_p_gain, set_velocity_p_gain;
		POSITION_D_GAIN => get_position_d_gain, set_position_d_gain;
		POSITION_I_GAIN => get_position_i_gain, set_position_i_gain;
		POSITION_P_GAIN => get_position_p_gain, set_position_p_gain;
		FEEDFORWARD_2ND_GAIN => get_feedforward_2nd_gain, set_feedforward_2nd_gain;
		FEEDFORWARD_1ST_GAIN => get_feedforward_1st_gain, set_feedforward_1st_gain;
		BUS_WATCHDOG => get_bus_watchdog, set_bus_watchdog;
		GOAL_PWM => get_goal_pwm, set_goal_pwm_raw;
		GOAL_VELOCITY => get_goal_velocity, set_goal_velocity_raw;
		PROFILE_ACCELERATION => get_profile_acceleration, set_profile_acceleration;
		PROFILE_VELOCITY => get_profile_velocity, set_profile_velocity;
		GOAL_POSITION => get_goal_position, set_goal_position;
		REALTIME_TICK => get_realtime_tick;
		MOVING => get_moving;
		MOVING_STATUS => get_moving_status;
		PRESENT_PWM => get_present_pwm_raw;
		PRESENT_LOAD => get_present_load;
		PRESENT_VELOCITY => get_present_velocity_raw;
		PRESENT_POSITION => get_present_position;
		VELOCITY_TRAJECTORY => get_velocity_trajectory;
		POSITION_TRAJECTORY => get_position_trajectory;
		PRESENT_INPUT_VOLTAGE => get_present_input_voltage;
		PRESENT_TEMPERATURE => get_present_temperature;
		BACKUP_READY => get_backup_ready;
	}
}

impl<T, D> Xl430<T, D>
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
	use crate::protocol::v2::crc16;
	use crate::units::Unit;

	fn device(link: &MockBus) -> Xl430<MockBus, MockBus> {
		let proto = Arc::new(Protocol2::new(
			link.clone(),
			link.clone(),
			BusConfig::default(),
		));
		Xl430::new("pan", 1, proto)
	}

	fn push_write_ack(link: &MockBus) {
		let mut reply = alloc::vec![0xFF, 0xFF, 0xFD, 0x00, 0x01, 0x04, 0x00, 0x55, 0x00];
		let crc = crc16(&reply);
		reply.extend_from_slice(&crc.to_le_bytes());
		link.push_reply(&reply);
	}

	#[test]
	fn table_has_no_overlapping_registers() {
		assert_eq!(CONTROL_TABLE.overlapping_pair(), None);
	}

	#[test]
	fn operating_mode_is_a_single_register_write() {
		let link = MockBus::new();
		let d = device(&link);
		push_write_ack(&link);
		block_on(d.set_operating_mode(OperatingMode::Velocity)).unwrap();
		let writes = link.writes();
		assert_eq!(writes.len(), 1);
		assert_eq!(writes[0][7], u8::from(Instruction::Write));
		// addr 11 and the mode value.
		assert_eq!(&writes[0][8..11], &[11, 0, 1]);
	}

	#[test]
	fn negative_goal_velocity_is_twos_complement_on_the_wire() {
		let link = MockBus::new();
		let d = device(&link);
		push_write_ack(&link);
		block_on(d.set_goal_velocity(-100.0, Some(Unit::Raw))).unwrap();
		let writes = link.writes();
		// addr 104, then -100 over four little-endian bytes.
		assert_eq!(&writes[0][8..10], &[104, 0]);
		assert_eq!(&writes[0][10..14], &(-100i32).to_le_bytes());
	}

	#[test]
	fn goal_velocity_limits_apply_to_the_signed_value() {
		let link = MockBus::new();
		let d = device(&link);
		let err = block_on(d.set_goal_velocity(-2000.0, Some(Unit::Raw))).unwrap_err();
		assert!(matches!(err, Error::ValueOutOfRange { min: -1023, .. }));
		assert!(link.writes().is_empty());
	}

	#[test]
	fn clear_sends_the_position_magic() {
		let link = MockBus::new();
		let d = device(&link);
		push_write_ack(&link);
		block_on(d.clear(ClearKind::Position)).unwrap();
		let writes = link.writes();
		assert_eq!(writes[0][7], u8::from(Instruction::Clear));
		assert_eq!(&writes[0][8..13], &[0x01, 0x44, 0x58, 0x4C, 0x22]);
	}

	#[test]
	fn homing_offset_round_trips_negative_values() {
		let link = MockBus::new();
		let d = device(&link);
		// Reply carrying -1024 as an unsigned 32-bit word.
		let mut reply = alloc::vec![0xFF, 0xFF, 0xFD, 0x00, 0x01, 0x08, 0x00, 0x55, 0x00];
		reply.extend_from_slice(&(-1024i32).to_le_bytes());
		let crc = crc16(&reply);
		reply.extend_from_slice(&crc.to_le_bytes());
		link.push_reply(&reply);
		let value = block_on(d.get_homing_offset(Some(Unit::Raw))).unwrap();
		assert_eq!(value, -1024.0);
	}

	#[test]
	fn position_limit_pair_reads_back(){
		let link = MockBus::new();
		let d = device(&link);
		for raw in [4095u32, 0] {
			let mut reply = alloc::vec![0xFF, 0xFF, 0xFD, 0x00, 0x01, 0x08, 0x00, 0x55, 0x00];
			reply.extend_from_slice(&raw.to_le_bytes());
			let crc = crc16(&reply);
			reply.extend_from_slice(&crc.to_le_bytes());
			link.push_reply(&reply);
		}
		let (min, max) = block_on(d.get_position_limits(Some(Unit::Raw))).unwrap();
		assert_eq!((min, max), (0.0, 4095.0));
	}
}
