//! Concrete servo models.
//!
//! Each model module declares its control table with
//! [`control_table!`](crate::control_table), binds the model constants
//! (encoder resolution, RPM step, baud codes) and generates a typed
//! accessor pair per register with [`register_accessors!`]. Everything
//! the models share sits on [`Servo`](crate::servo::Servo), reachable
//! through `Deref`.

#[cfg(feature = "ax12a")]
pub mod ax12a;
#[cfg(feature = "xl430")]
pub mod xl430;

/// Generate `get_…`/`set_…` methods for control-table registers.
///
/// Sugar over [`Servo::read_item`](crate::servo::Servo::read_item) and
/// [`Servo::write_item`](crate::servo::Servo::write_item); the method
/// names are the mechanical snake-case transform of the register names.
/// A register listed without a setter name stays read-only.
#[macro_export]
macro_rules! register_accessors {
	($( $reg:ident => $get:ident $(, $set:ident)? );* $(;)?) => {
		$(
			#[doc = concat!("Read `", stringify!($reg), "`, converted to the resolved unit.")]
			pub async fn $get(
				&self,
				unit: Option<$crate::units::Unit>,
			) -> Result<f64, $crate::Error> {
				let item = self.servo.item(stringify!($reg))?;
				self.servo.read_item(item, unit).await
			}
			$(
				#[doc = concat!("Write `", stringify!($reg), "` from a value in the resolved unit.")]
				pub async fn $set(
					&self,
					value: f64,
					unit: Option<$crate::units::Unit>,
				) -> Result<(), $crate::Error> {
					let item = self.servo.item(stringify!($reg))?;
					self.servo.write_item(item, value, unit).await
				}
			)?
		)*
	};
}
