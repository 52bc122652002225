//! Parking policies for ring-buffer waiters.
//!
//! A [`WaitStrategy`] decides what a thread does while it waits for a cursor
//! to advance: burn the core, yield, sleep, or park on a condition variable.
//! The ring calls [`WaitStrategy::signal_all`] whenever a cursor moves
//! (publish, consume, reader teardown) so that blocking variants wake up.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::sequence::{minimum_sequence, Sequence};
use std::sync::Arc;

/// A bounded wait elapsed before the awaited sequence became available.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("timed out waiting for sequence")]
pub struct WaitTimeout;

/// Shared condvar state used by the blocking strategies.
#[derive(Debug, Default)]
pub struct BlockingWait {
    lock: Mutex<()>,
    condvar: Condvar,
}

/// Policy object consulted whenever a ring-buffer participant has to wait.
///
/// | Variant | Behaviour while waiting |
/// |---------|-------------------------|
/// | `Blocking` | parks on a condition variable until signalled |
/// | `BusySpin` | spin loop, lowest latency, one core pegged |
/// | `Sleeping` | spins, then yields, then sleeps in short naps |
/// | `SpinWait` | spins, then yields (no sleep) |
/// | `TimeoutBlocking` | like `Blocking` but gives up after a deadline |
/// | `Yielding` | spins a few times, then `yield_now` forever |
#[derive(Debug)]
pub enum WaitStrategy {
    Blocking(BlockingWait),
    BusySpin,
    Sleeping { retries: u32 },
    SpinWait,
    TimeoutBlocking { timeout: Duration, wait: BlockingWait },
    Yielding { spin_tries: u32 },
}

impl WaitStrategy {
    pub fn blocking() -> Self {
        Self::Blocking(BlockingWait::default())
    }

    pub fn busy_spin() -> Self {
        Self::BusySpin
    }

    pub fn sleeping() -> Self {
        Self::Sleeping { retries: 200 }
    }

    pub fn spin_wait() -> Self {
        Self::SpinWait
    }

    pub fn timeout_blocking(timeout: Duration) -> Self {
        Self::TimeoutBlocking {
            timeout,
            wait: BlockingWait::default(),
        }
    }

    pub fn yielding() -> Self {
        Self::Yielding { spin_tries: 100 }
    }

    /// Waits until the gated position reaches `expected_sequence`.
    ///
    /// The gated position is the cursor alone when `dependents` is empty,
    /// otherwise the minimum over the dependent sequences (floored by the
    /// cursor). Returns the observed position, which is `>= expected_sequence`.
    pub fn wait_for(
        &self,
        expected_sequence: i64,
        cursor: &Sequence,
        dependents: &[Arc<Sequence>],
    ) -> Result<i64, WaitTimeout> {
        self.wait_until(expected_sequence, || {
            if dependents.is_empty() {
                cursor.value()
            } else {
                minimum_sequence(dependents, cursor.value())
            }
        })
    }

    /// Polls `current` until it returns a value `>= expected`, pacing itself
    /// per the strategy. The closure is re-evaluated on every wakeup so that
    /// callers can observe registry changes (e.g. a reader that went away).
    pub(crate) fn wait_until<F>(&self, expected: i64, mut current: F) -> Result<i64, WaitTimeout>
    where
        F: FnMut() -> i64,
    {
        let v = current();
        if v >= expected {
            return Ok(v);
        }
        match self {
            Self::BusySpin => loop {
                let v = current();
                if v >= expected {
                    return Ok(v);
                }
                std::hint::spin_loop();
            },
            Self::Yielding { spin_tries } => {
                let mut tries = *spin_tries;
                loop {
                    let v = current();
                    if v >= expected {
                        return Ok(v);
                    }
                    if tries > 0 {
                        tries -= 1;
                        std::hint::spin_loop();
                    } else {
                        std::thread::yield_now();
                    }
                }
            }
            Self::SpinWait => {
                let mut tries = 0u32;
                loop {
                    let v = current();
                    if v >= expected {
                        return Ok(v);
                    }
                    if tries < 100 {
                        std::hint::spin_loop();
                    } else {
                        std::thread::yield_now();
                    }
                    tries = tries.saturating_add(1);
                }
            }
            Self::Sleeping { retries } => {
                let mut counter = *retries;
                loop {
                    let v = current();
                    if v >= expected {
                        return Ok(v);
                    }
                    if counter > 100 {
                        counter -= 1;
                        std::hint::spin_loop();
                    } else if counter > 0 {
                        counter -= 1;
                        std::thread::yield_now();
                    } else {
                        std::thread::sleep(Duration::from_micros(100));
                    }
                }
            }
            Self::Blocking(wait) => {
                let mut guard = wait.lock.lock().expect("wait mutex poisoned");
                loop {
                    let v = current();
                    if v >= expected {
                        return Ok(v);
                    }
                    guard = wait.condvar.wait(guard).expect("wait mutex poisoned");
                }
            }
            Self::TimeoutBlocking { timeout, wait } => {
                let deadline = Instant::now() + *timeout;
                let mut guard = wait.lock.lock().expect("wait mutex poisoned");
                loop {
                    let v = current();
                    if v >= expected {
                        return Ok(v);
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(WaitTimeout);
                    }
                    let (g, _res) = wait
                        .condvar
                        .wait_timeout(guard, deadline - now)
                        .expect("wait mutex poisoned");
                    guard = g;
                }
            }
        }
    }

    /// Wakes every thread parked in this strategy. No-op for the pure
    /// polling variants.
    pub fn signal_all(&self) {
        match self {
            Self::Blocking(wait) | Self::TimeoutBlocking { wait, .. } => {
                // Empty critical section: orders the wakeup after the cursor
                // store made by the caller.
                drop(wait.lock.lock().expect("wait mutex poisoned"));
                wait.condvar.notify_all();
            }
            _ => {}
        }
    }
}

impl Default for WaitStrategy {
    fn default() -> Self {
        Self::spin_wait()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn strategies() -> Vec<WaitStrategy> {
        vec![
            WaitStrategy::blocking(),
            WaitStrategy::busy_spin(),
            WaitStrategy::sleeping(),
            WaitStrategy::spin_wait(),
            WaitStrategy::timeout_blocking(Duration::from_millis(200)),
            WaitStrategy::yielding(),
        ]
    }

    #[test]
    fn test_immediate_when_available() {
        let cursor = Sequence::new(7);
        for strategy in strategies() {
            assert_eq!(strategy.wait_for(5, &cursor, &[]), Ok(7));
        }
    }

    #[test]
    fn test_gates_on_dependents() {
        let cursor = Sequence::new(100);
        let slow = Arc::new(Sequence::new(3));
        let strategy = WaitStrategy::busy_spin();
        // Dependent at 3 gates a request for 3, not the cursor at 100.
        assert_eq!(strategy.wait_for(3, &cursor, &[slow]), Ok(3));
    }

    #[test]
    fn test_timeout_elapses() {
        let cursor = Sequence::default();
        let strategy = WaitStrategy::timeout_blocking(Duration::from_millis(10));
        assert_eq!(strategy.wait_for(0, &cursor, &[]), Err(WaitTimeout));
    }

    #[test]
    fn test_blocking_wakes_on_signal() {
        let cursor = Arc::new(Sequence::default());
        let strategy = Arc::new(WaitStrategy::blocking());

        let waiter = {
            let cursor = Arc::clone(&cursor);
            let strategy = Arc::clone(&strategy);
            std::thread::spawn(move || strategy.wait_for(0, &cursor, &[]))
        };

        std::thread::sleep(Duration::from_millis(20));
        cursor.set(0);
        strategy.signal_all();
        assert_eq!(waiter.join().expect("waiter panicked"), Ok(0));
    }
}
