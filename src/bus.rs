//! Shared-bus arbitration and the hardware abstraction underneath it.
//!
//! A Dynamixel bus is a single wire carrying both directions; the host
//! may only drive it while the direction-enable line is high, and only
//! one task may do so at a time. [`Bus`] owns the transport behind an
//! async mutex and hands out [`BusGuard`]s that enforce the transmit
//! discipline: raise tx-enable, settle, burst the packet, settle, drop
//! tx-enable, drain the reply. The guard's `Drop` returns tx-enable low
//! on every exit path, including cancellation at an await point.

use alloc::vec::Vec;
use core::future::Future;
use core::time::Duration;

use async_lock::{Mutex, MutexGuard};

/// The half-duplex UART together with its direction-enable pin.
///
/// `read` is the only suspension point: it may wait up to the
/// transport's configured timeout for bytes to arrive and resolves with
/// `Ok(0)` when none did. `write` must push the whole burst without
/// yielding; a packet is never interleaved with another task's bytes.
pub trait BusTransport {
	type Error: core::fmt::Debug;

	/// Write the packet as one burst.
	fn write(&mut self, bytes: &[u8]) -> Result<(), Self::Error>;

	/// Read up to `buf.len()` bytes, waiting at most the transport
	/// timeout. `Ok(0)` means the timeout elapsed with nothing pending.
	fn read(
		&mut self,
		buf: &mut [u8],
	) -> impl Future<Output = Result<usize, Self::Error>> + Send;

	/// Number of received bytes that can be read without waiting.
	fn bytes_available(&self) -> usize;

	/// Discard any received bytes still buffered.
	fn clear_input(&mut self);

	/// Drive the direction-enable line.
	fn set_tx_enable(&mut self, enabled: bool);
}

/// Monotonic cooperative sleep.
///
/// Shared (`&self`) so pollers can pace themselves without holding the
/// bus. Implementations yield at least once; the settle pauses inside a
/// bus transaction and the inter-cycle poller sleep are the scheduler's
/// suspension points.
pub trait Delay {
	fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;
}

/// Construction-time bus parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusConfig {
	/// Line rate in bit/s.
	pub baud_rate: u32,
	/// Per-read timeout the transport should honor.
	pub timeout: Duration,
	/// Pause after each direction-enable edge, letting the driver
	/// stabilize before bytes move.
	pub settle_delay: Duration,
}

impl Default for BusConfig {
	fn default() -> Self {
		Self {
			baud_rate: 1_000_000,
			timeout: Duration::from_secs(1),
			settle_delay: Duration::from_millis(10),
		}
	}
}

/// One physical bus: the transport, the delay source and the mutex that
/// serializes transactions in submission order.
pub struct Bus<T, D> {
	transport: Mutex<T>,
	delay: D,
	config: BusConfig,
}

impl<T: BusTransport, D: Delay> Bus<T, D> {
	pub fn new(transport: T, delay: D, config: BusConfig) -> Self {
		Self {
			transport: Mutex::new(transport),
			delay,
			config,
		}
	}

	pub fn config(&self) -> &BusConfig {
		&self.config
	}

	/// Acquire exclusive use of the line for one transaction.
	///
	/// Tasks blocked here resume in submission order; this is the only
	/// queueing point in the crate.
	pub async fn lock(&self) -> BusGuard<'_, T, D> {
		BusGuard {
			transport: self.transport.lock().await,
			delay: &self.delay,
			config: &self.config,
			tx_high: false,
		}
	}
}

/// Exclusive access to the transport for the duration of one
/// send/receive transaction.
pub struct BusGuard<'a, T: BusTransport, D: Delay> {
	transport: MutexGuard<'a, T>,
	delay: &'a D,
	config: &'a BusConfig,
	tx_high: bool,
}

impl<T: BusTransport, D: Delay> BusGuard<'_, T, D> {
	/// Raise tx-enable and wait for the line driver to settle.
	pub async fn begin_tx(&mut self) {
		self.transport.set_tx_enable(true);
		self.tx_high = true;
		self.delay.sleep(self.config.settle_delay).await;
	}

	/// Settle once more, then return the line to the receive direction.
	pub async fn end_tx(&mut self) {
		self.delay.sleep(self.config.settle_delay).await;
		self.transport.set_tx_enable(false);
		self.tx_high = false;
	}

	pub fn write(&mut self, bytes: &[u8]) -> Result<(), T::Error> {
		self.transport.write(bytes)
	}

	pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, T::Error> {
		self.transport.read(buf).await
	}

	pub fn bytes_available(&self) -> usize {
		self.transport.bytes_available()
	}

	/// Take every byte currently pending, without waiting.
	pub async fn drain(&mut self) -> Result<Vec<u8>, T::Error> {
		let pending = self.transport.bytes_available();
		let mut buf = vec![0; pending];
		let mut filled = 0;
		while filled < pending {
			let n = self.transport.read(&mut buf[filled..]).await?;
			if n == 0 {
				break;
			}
			filled += n;
		}
		buf.truncate(filled);
		Ok(buf)
	}

	pub fn clear_input(&mut self) {
		self.transport.clear_input();
	}
}

impl<T: BusTransport, D: Delay> Drop for BusGuard<'_, T, D> {
	fn drop(&mut self) {
		// The line must never be left in the transmit direction, even
		// when the transaction is cancelled mid-await.
		if self.tx_high {
			self.transport.set_tx_enable(false);
		}
	}
}
