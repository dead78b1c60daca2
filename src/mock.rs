//! Scripted bus doubles for tests and examples.
//!
//! [`MockBus`] plays the role a loopback device plays for a network
//! stack: it implements both [`BusTransport`] and [`Delay`], records
//! every observable action (direction edges, sleeps, bursts, reads,
//! input flushes) and feeds back whatever status packets the test
//! queued. One scripted reply is released per transmitted burst; a
//! further reply is released when a follow-up read finds the buffer
//! empty, which is how late-arriving packet tails are simulated.

use alloc::collections::vec_deque::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::convert::Infallible;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};
use core::time::Duration;

use spin::Mutex;

use crate::bus::{BusTransport, Delay};

/// Everything a transaction did to the bus, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
	TxEnable(bool),
	Sleep(Duration),
	Write(Vec<u8>),
	Read(usize),
	ClearInput,
}

#[derive(Default)]
struct MockInner {
	rx: VecDeque<u8>,
	replies: VecDeque<Vec<u8>>,
	events: Vec<BusEvent>,
	tx_enable: bool,
}

/// Shared handle to one scripted bus; clones observe the same state.
#[derive(Clone, Default)]
pub struct MockBus {
	inner: Arc<Mutex<MockInner>>,
}

impl MockBus {
	pub fn new() -> Self {
		Self::default()
	}

	/// Queue a blob of device bytes; released on the next burst (or a
	/// follow-up read that finds the line idle).
	pub fn push_reply(&self, bytes: &[u8]) {
		self.inner.lock().replies.push_back(bytes.to_vec());
	}

	/// Snapshot of the recorded event log.
	pub fn events(&self) -> Vec<BusEvent> {
		self.inner.lock().events.clone()
	}

	/// Current state of the direction-enable line.
	pub fn tx_enabled(&self) -> bool {
		self.inner.lock().tx_enable
	}

	/// All bursts written so far, oldest first.
	pub fn writes(&self) -> Vec<Vec<u8>> {
		self.inner
			.lock()
			.events
			.iter()
			.filter_map(|event| match event {
				BusEvent::Write(bytes) => Some(bytes.clone()),
				_ => None,
			})
			.collect()
	}
}

impl BusTransport for MockBus {
	type Error = Infallible;

	fn write(&mut self, bytes: &[u8]) -> Result<(), Self::Error> {
		let mut inner = self.inner.lock();
		inner.events.push(BusEvent::Write(bytes.to_vec()));
		// The device answers the burst: release one scripted reply.
		if let Some(reply) = inner.replies.pop_front() {
			inner.rx.extend(reply);
		}
		Ok(())
	}

	async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
		let mut inner = self.inner.lock();
		if inner.rx.is_empty() {
			// Late arrival: the remainder of a packet shows up only
			// once the host waits for it.
			if let Some(reply) = inner.replies.pop_front() {
				inner.rx.extend(reply);
			}
		}
		let n = buf.len().min(inner.rx.len());
		for (slot, byte) in buf[..n].iter_mut().zip(inner.rx.drain(..n)) {
			*slot = byte;
		}
		inner.events.push(BusEvent::Read(n));
		Ok(n)
	}

	fn bytes_available(&self) -> usize {
		self.inner.lock().rx.len()
	}

	fn clear_input(&mut self) {
		let mut inner = self.inner.lock();
		inner.rx.clear();
		inner.events.push(BusEvent::ClearInput);
	}

	fn set_tx_enable(&mut self, enabled: bool) {
		let mut inner = self.inner.lock();
		inner.tx_enable = enabled;
		inner.events.push(BusEvent::TxEnable(enabled));
	}
}

impl Delay for MockBus {
	async fn sleep(&self, duration: Duration) {
		self.inner.lock().events.push(BusEvent::Sleep(duration));
		YieldNow(false).await;
	}
}

/// Pending on the first poll, ready on the second: sleeps consume no
/// wall time but still hand the executor a suspension point.
struct YieldNow(bool);

impl Future for YieldNow {
	type Output = ();

	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		if self.0 {
			Poll::Ready(())
		} else {
			self.0 = true;
			cx.waker().wake_by_ref();
			Poll::Pending
		}
	}
}
