//! Minimal cooperative scheduler.
//!
//! Everything on one bus runs on one thread: foreground operations plus
//! one background poller per servo. Tasks only yield at the suspension
//! points the bus layer provides (the settle sleeps and the UART read),
//! so a packet is never torn apart mid-burst. [`block_on`] drives a
//! foreground future while letting the background tasks make progress
//! between polls.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::future::Future;
use core::mem;
use core::pin::{Pin, pin};
use core::task::{Context, Poll, Waker};

use crossbeam_utils::Backoff;
use spin::Mutex;

/// One background unit of work, labeled for the logs. In practice these
/// are the servo pollers, which label themselves `poller:<name>`.
struct Task {
	label: String,
	future: Pin<Box<dyn Future<Output = ()> + Send>>,
}

static TASKS: Mutex<Vec<Task>> = Mutex::new(Vec::new());

/// Spawns a future on the executor.
pub fn spawn<F>(future: F)
where
	F: Future<Output = ()> + Send + 'static,
{
	spawn_named("task", future);
}

/// Spawns a future under a diagnostic label.
pub fn spawn_named<F>(label: impl Into<String>, future: F)
where
	F: Future<Output = ()> + Send + 'static,
{
	TASKS.lock().push(Task {
		label: label.into(),
		future: Box::pin(future),
	});
}

/// Poll every background task once; returns how many are still pending.
///
/// The queue is detached while polling so a task may itself call
/// [`spawn`] without deadlocking on the queue lock.
pub fn run() -> usize {
	let mut active = mem::take(&mut *TASKS.lock());
	let mut cx = Context::from_waker(Waker::noop());
	active.retain_mut(|task| {
		trace!("polling {}", task.label);
		task.future.as_mut().poll(&mut cx).is_pending()
	});

	let mut queue = TASKS.lock();
	// Keep tasks spawned during this pass behind the survivors.
	active.append(&mut queue);
	*queue = active;
	queue.len()
}

/// Blocks the current thread on `future`, running the executor when
/// idling.
pub fn block_on<F, T>(future: F) -> T
where
	F: Future<Output = T>,
{
	let backoff = Backoff::new();
	let mut cx = Context::from_waker(Waker::noop());
	let mut future = pin!(future);

	loop {
		// run background tasks
		let pending = run();

		if let Poll::Ready(value) = future.as_mut().poll(&mut cx) {
			return value;
		}

		if pending == 0 {
			backoff.snooze();
		} else {
			backoff.reset();
		}
	}
}
