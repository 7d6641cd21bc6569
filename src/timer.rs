//! Multi-bucket, step-quantized timer wheels.
//!
//! Each worker owns three independent wheels: the slow wheel (orphan, FIN
//! and TIME_WAIT bounds), the retransmission wheel and the test-lifecycle
//! wheel. A deadline `d` scheduled at time `now` lands in bucket
//! `((now + d) / step) mod N`; the wheel size times the step must therefore
//! exceed the largest timeout ever scheduled on it.
//!
//! Entries are held in per-bucket slot arenas instead of intrusive lists:
//! [`schedule`] hands back a [`TimerHandle`] naming the slot, the control
//! block stores it in an `Option`, and that `Option` is the sole source of
//! truth for whether the timer is armed. An expired slot is freed before
//! the owner is told about it, so expiry handlers may re-arm immediately.
//!
//! [`schedule`]: TimerWheel::schedule

use std::collections::HashMap;

use crate::config::{TMR_MAX_RUN_CNT, TMR_STEP_ADVANCE_US};
use crate::{Error, Result};

/// Names the wheel slot an armed timer occupies. Only meaningful for the
/// wheel that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle {
    bucket: u32,
    slot: u32,
}

#[derive(Debug)]
struct Bucket<T> {
    slots: Vec<Option<T>>,
    free: Vec<u32>,
}

impl<T> Bucket<T> {
    fn new() -> Bucket<T> {
        Bucket {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }
}

/// A single timer wheel. `T` is the owner reference stored per entry
/// (a control block handle in practice; anything small and comparable
/// works).
#[derive(Debug)]
pub struct TimerWheel<T> {
    /// Occupied buckets only; the microsecond wheels are far too wide to
    /// keep an array slot per index.
    buckets: HashMap<u32, Bucket<T>>,
    size: usize,
    step_us: u64,
    max_us: u64,
    /// Next bucket index to process.
    current: usize,
    last_advance_us: u64,
    /// Armed entries across all buckets.
    armed: usize,
    /// Minimum elapsed time between two advances.
    advance_threshold_us: u64,
    /// Entry budget for one advance call.
    max_run: usize,
}

impl<T: Copy + PartialEq> TimerWheel<T> {
    /// Creates a wheel covering timeouts up to `max_us` with the given
    /// step. The bucket count is `max_us / step_us`.
    pub fn new(max_us: u64, step_us: u64, now_us: u64) -> TimerWheel<T> {
        TimerWheel::with_limits(max_us, step_us, now_us, TMR_STEP_ADVANCE_US, TMR_MAX_RUN_CNT)
    }

    /// Like [`TimerWheel::new`] but with explicit advance threshold and
    /// per-advance entry budget.
    pub fn with_limits(
        max_us: u64,
        step_us: u64,
        now_us: u64,
        advance_threshold_us: u64,
        max_run: usize,
    ) -> TimerWheel<T> {
        let size = (max_us / step_us) as usize;

        TimerWheel {
            buckets: HashMap::new(),
            size,
            step_us,
            max_us,
            current: ((now_us / step_us) as usize) % size,
            last_advance_us: now_us,
            armed: 0,
            advance_threshold_us,
            max_run,
        }
    }

    /// Number of currently armed entries.
    pub fn armed(&self) -> usize {
        self.armed
    }

    /// Arms a timer for `entry`, expiring `timeout_us` from `now_us`.
    ///
    /// # Errors
    ///
    /// Returns an error if the timeout exceeds the wheel range.
    pub fn schedule(&mut self, now_us: u64, timeout_us: u64, entry: T) -> Result<TimerHandle> {
        if timeout_us > self.max_us {
            return Err(Error::TimerOutOfRange {
                timeout_us,
                max_us: self.max_us,
            });
        }

        let bucket_idx = (((now_us + timeout_us) / self.step_us) as usize) % self.size;
        let bucket = self
            .buckets
            .entry(bucket_idx as u32)
            .or_insert_with(Bucket::new);

        let slot = match bucket.free.pop() {
            Some(slot) => {
                bucket.slots[slot as usize] = Some(entry);
                slot
            }
            None => {
                bucket.slots.push(Some(entry));
                (bucket.slots.len() - 1) as u32
            }
        };

        self.armed += 1;

        Ok(TimerHandle {
            bucket: bucket_idx as u32,
            slot,
        })
    }

    /// Disarms the timer at `handle`, provided the slot still belongs to
    /// `entry`. Canceling a timer that already fired (or was never armed)
    /// is a no-op, which makes cancellation idempotent against late
    /// expiries.
    pub fn cancel(&mut self, handle: TimerHandle, entry: T) {
        let Some(bucket) = self.buckets.get_mut(&handle.bucket) else {
            return;
        };
        let slot = handle.slot as usize;

        if bucket.slots.get(slot).copied().flatten() == Some(entry) {
            bucket.slots[slot] = None;
            bucket.free.push(handle.slot);
            self.armed -= 1;
        }
    }

    /// Advances the wheel to `now_us`, appending every expired entry to
    /// `fired` together with the handle it was armed under.
    ///
    /// Does nothing unless the elapsed time since the previous advance
    /// exceeds the configured threshold. At most `max_run` entries expire
    /// per call; leftover buckets are picked up by the next advance. Each
    /// slot is freed before it is reported, so the caller may re-arm from
    /// its expiry handling.
    pub fn advance(&mut self, now_us: u64, fired: &mut Vec<(T, TimerHandle)>) {
        if now_us.saturating_sub(self.last_advance_us) <= self.advance_threshold_us {
            return;
        }
        self.last_advance_us = now_us;

        let size = self.size;
        let now_idx = ((now_us / self.step_us) as usize) % size;

        if self.armed == 0 {
            self.current = now_idx;
            return;
        }

        let mut budget = self.max_run;

        loop {
            let bucket_idx = self.current;

            if let Some(bucket) = self.buckets.get_mut(&(bucket_idx as u32)) {
                for slot in 0..bucket.slots.len() {
                    if budget == 0 {
                        // Budget exhausted mid-bucket: already-reported
                        // slots are freed, the rest stay for the next
                        // advance.
                        return;
                    }

                    if let Some(entry) = bucket.slots[slot].take() {
                        bucket.free.push(slot as u32);
                        self.armed -= 1;
                        budget -= 1;

                        fired.push((
                            entry,
                            TimerHandle {
                                bucket: bucket_idx as u32,
                                slot: slot as u32,
                            },
                        ));
                    }
                }
            }

            if bucket_idx == now_idx {
                break;
            }
            self.current = (bucket_idx + 1) % size;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wheel(max_us: u64, step_us: u64) -> TimerWheel<u32> {
        // No advance threshold and a generous budget unless a test says
        // otherwise.
        TimerWheel::with_limits(max_us, step_us, 0, 0, usize::MAX)
    }

    fn fired_of(wheel: &mut TimerWheel<u32>, now_us: u64) -> Vec<u32> {
        let mut fired = Vec::new();
        wheel.advance(now_us, &mut fired);
        fired.into_iter().map(|(entry, _)| entry).collect()
    }

    #[test]
    fn schedule_rejects_timeout_past_wheel_range() {
        let mut wheel = wheel(1_000, 100);

        assert!(wheel.schedule(0, 1_000, 1).is_ok());
        assert!(matches!(
            wheel.schedule(0, 1_001, 2),
            Err(Error::TimerOutOfRange { .. })
        ));
    }

    #[test]
    fn entry_fires_once_deadline_passes() {
        let mut wheel = wheel(10_000, 100);

        wheel.schedule(0, 500, 7).unwrap();
        assert!(fired_of(&mut wheel, 499).is_empty());
        assert_eq!(fired_of(&mut wheel, 501), vec![7]);
        assert_eq!(wheel.armed(), 0);

        // Does not fire twice.
        assert!(fired_of(&mut wheel, 1_000).is_empty());
    }

    #[test]
    fn canceled_entry_never_fires() {
        let mut wheel = wheel(10_000, 100);

        let handle = wheel.schedule(0, 500, 7).unwrap();
        wheel.cancel(handle, 7);
        assert_eq!(wheel.armed(), 0);
        assert!(fired_of(&mut wheel, 1_000).is_empty());

        // Cancel after expiry is a no-op.
        let handle = wheel.schedule(1_000, 300, 8).unwrap();
        assert_eq!(fired_of(&mut wheel, 2_000), vec![8]);
        wheel.cancel(handle, 8);
        assert_eq!(wheel.armed(), 0);
    }

    #[test]
    fn cancel_does_not_disturb_a_reused_slot() {
        let mut wheel = wheel(10_000, 100);

        let stale = wheel.schedule(0, 100, 7).unwrap();
        assert_eq!(fired_of(&mut wheel, 250), vec![7]);

        // A deadline one full rotation later lands in the same bucket and
        // takes over the freed slot; the stale handle must not disarm the
        // new owner.
        let fresh = wheel.schedule(250, 9_850, 9).unwrap();
        assert_eq!(stale, fresh);
        wheel.cancel(stale, 7);
        assert_eq!(wheel.armed(), 1);
        assert_eq!(fired_of(&mut wheel, 10_150), vec![9]);
    }

    #[test]
    fn expiries_ordered_by_deadline_within_an_advance() {
        let mut wheel = wheel(10_000, 100);

        wheel.schedule(0, 900, 3).unwrap();
        wheel.schedule(0, 300, 1).unwrap();
        wheel.schedule(0, 600, 2).unwrap();

        assert_eq!(fired_of(&mut wheel, 1_000), vec![1, 2, 3]);
    }

    #[test]
    fn advance_respects_elapsed_time_threshold() {
        let mut wheel: TimerWheel<u32> = TimerWheel::with_limits(10_000, 100, 0, 25, usize::MAX);

        wheel.schedule(0, 10, 1).unwrap();

        let mut fired = Vec::new();
        wheel.advance(20, &mut fired);
        assert!(fired.is_empty());

        wheel.advance(120, &mut fired);
        assert_eq!(fired.len(), 1);
    }

    #[test]
    fn budget_carries_leftovers_to_the_next_advance() {
        let mut wheel: TimerWheel<u32> = TimerWheel::with_limits(10_000, 100, 0, 0, 2);

        for entry in 0..5 {
            wheel.schedule(0, 200, entry).unwrap();
        }

        let mut fired = Vec::new();
        wheel.advance(300, &mut fired);
        assert_eq!(fired.len(), 2);

        wheel.advance(400, &mut fired);
        assert_eq!(fired.len(), 4);

        wheel.advance(500, &mut fired);
        assert_eq!(fired.len(), 5);
        assert_eq!(wheel.armed(), 0);
    }

    #[test]
    fn expiry_handling_may_rearm_into_the_freed_slot() {
        let mut wheel = wheel(10_000, 100);

        wheel.schedule(0, 100, 7).unwrap();
        let fired = fired_of(&mut wheel, 250);
        assert_eq!(fired, vec![7]);

        // The slot was freed before the expiry was reported.
        wheel.schedule(250, 100, 7).unwrap();
        assert_eq!(wheel.armed(), 1);
        assert_eq!(fired_of(&mut wheel, 500), vec![7]);
    }

    #[test]
    fn wraps_around_the_bucket_array() {
        let mut wheel = wheel(1_000, 100);

        // now = 950 maps near the end of the 10-bucket wheel; a 300us
        // timeout wraps past index 0.
        assert!(fired_of(&mut wheel, 950).is_empty());
        wheel.schedule(950, 300, 4).unwrap();
        assert!(fired_of(&mut wheel, 1_100).is_empty());
        assert_eq!(fired_of(&mut wheel, 1_300), vec![4]);
    }
}
