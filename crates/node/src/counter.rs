//! Pulse counter driven by a reed/hall contact on a meter's last dial.
//!
//! The contact is closed for part of each revolution of the least significant
//! digit. `point_lo_hi` is the digit at which it closes and `point_hi_lo` the
//! digit at which it opens again, so the contact being `true` means the last
//! digit lies in one half-open range and `false` means it lies in the other.
//! Either boundary may be the larger one; the "true" range wraps past 9 when
//! `point_hi_lo < point_lo_hi`.
//!
//! A transition whose range already contains the current last digit is a
//! bounce and is ignored. Otherwise the count moves forward to the boundary
//! digit, carrying into the higher digits by plain addition.

use crate::observable::{Sensor, SubscriptionToken};

/// The two digit boundaries of a counter contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Points {
    pub lo_hi: u8,
    pub hi_lo: u8,
}

impl Default for Points {
    fn default() -> Self {
        Self { lo_hi: 7, hi_lo: 0 }
    }
}

impl Points {
    /// Whether `digit` lies in the range where the contact reads `true`.
    fn closed_range_contains(self, digit: u8) -> bool {
        if self.hi_lo < self.lo_hi {
            digit < self.hi_lo || self.lo_hi <= digit
        } else {
            self.lo_hi <= digit && digit < self.hi_lo
        }
    }
}

/// New count after the contact switched to `input`.
pub fn advance(count: u64, points: Points, input: bool) -> u64 {
    let digit = (count % 10) as u8;
    if points.closed_range_contains(digit) == input {
        return count;
    }
    let target = if input { points.lo_hi } else { points.hi_lo };
    let distance = (target + 10 - digit) % 10;
    count + u64::from(distance)
}

pub struct Counter {
    value: Sensor<u64>,
    input: Sensor<bool>,
    token: SubscriptionToken,
}

impl Counter {
    /// Attach a counter starting at 0 to `input`. The input's current state
    /// is applied straight away.
    pub fn new(input: Sensor<bool>, points: Points) -> Self {
        let value = Sensor::with_state(0);
        let token = {
            let value = value.clone();
            input.subscribe(move |state| step(&value, points, *state))
        };
        if let Some(state) = input.state() {
            step(&value, points, state);
        }
        Self {
            value,
            input,
            token,
        }
    }

    pub fn value(&self) -> u64 {
        self.value.state().unwrap_or_default()
    }

    /// Calibrate against the physical dial.
    pub fn set(&self, value: u64) {
        self.value.set(value);
    }

    /// The observable count, for binding and commands.
    pub fn sensor(&self) -> Sensor<u64> {
        self.value.clone()
    }
}

impl Drop for Counter {
    fn drop(&mut self) {
        self.input.unsubscribe(self.token);
    }
}

fn step(value: &Sensor<u64>, points: Points, input: bool) {
    let current = value.state().unwrap_or_default();
    value.set(advance(current, points, input));
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observable::Switch;
    use proptest::prelude::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    const WRAPPING: Points = Points { lo_hi: 7, hi_lo: 2 };

    // -- arithmetic -----------------------------------------------------------

    #[test]
    fn closing_contact_moves_to_lo_hi() {
        assert_eq!(advance(2, WRAPPING, true), 7);
        assert_eq!(advance(100_003, WRAPPING, true), 100_007);
    }

    #[test]
    fn opening_contact_carries_into_next_ten() {
        assert_eq!(advance(7, WRAPPING, false), 12);
        assert_eq!(advance(99_998, WRAPPING, false), 100_002);
    }

    #[test]
    fn bounce_is_ignored() {
        assert_eq!(advance(8, WRAPPING, true), 8);
        assert_eq!(advance(1, WRAPPING, true), 1);
        assert_eq!(advance(4, WRAPPING, false), 4);
    }

    #[test]
    fn non_wrapping_ranges() {
        let points = Points { lo_hi: 3, hi_lo: 8 };
        assert_eq!(advance(0, points, true), 3);
        assert_eq!(advance(3, points, false), 8);
        assert_eq!(advance(8, points, true), 13);
        assert_eq!(advance(5, points, true), 5);
    }

    // -- sensor wiring --------------------------------------------------------

    #[test]
    fn initial_input_state_is_applied() {
        let input = Switch::switch();
        let counter = Counter::new(input, WRAPPING);
        // false with last digit 0: 0 is inside the wrapping "true" range.
        assert_eq!(counter.value(), 2);
    }

    #[test]
    fn unset_input_leaves_zero() {
        let counter = Counter::new(Sensor::new(), WRAPPING);
        assert_eq!(counter.value(), 0);
    }

    #[test]
    fn toggles_accumulate() {
        let input = Switch::switch();
        let counter = Counter::new(input.clone(), WRAPPING);
        for _ in 0..3 {
            input.set(true);
            input.set(false);
        }
        assert_eq!(counter.value(), 32);
    }

    #[test]
    fn calibration_is_new_baseline() {
        let input = Switch::switch();
        let counter = Counter::new(input.clone(), WRAPPING);
        counter.set(1_003);
        input.set(true);
        assert_eq!(counter.value(), 1_007);
    }

    #[test]
    fn changes_are_observable() {
        let input = Switch::switch();
        let counter = Counter::new(input.clone(), WRAPPING);
        let seen = Rc::new(RefCell::new(Vec::new()));
        {
            let seen = Rc::clone(&seen);
            counter.sensor().subscribe(move |v| seen.borrow_mut().push(*v));
        }
        input.set(true);
        input.set(true);
        input.set(false);
        assert_eq!(*seen.borrow(), vec![7, 12]);
    }

    #[test]
    fn drop_detaches_from_input() {
        let input = Switch::switch();
        let counter = Counter::new(input.clone(), WRAPPING);
        assert_eq!(input.subscriber_count(), 1);
        drop(counter);
        assert_eq!(input.subscriber_count(), 0);
    }

    // -- properties -----------------------------------------------------------

    fn points() -> impl Strategy<Value = Points> {
        (0u8..10, 0u8..10)
            .prop_filter("boundaries differ", |(a, b)| a != b)
            .prop_map(|(lo_hi, hi_lo)| Points { lo_hi, hi_lo })
    }

    proptest! {
        #[test]
        fn advance_is_forward_distance_or_unchanged(
            points in points(),
            initial in 0u64..1_000_000_000,
            input in any::<bool>(),
        ) {
            let next = advance(initial, points, input);
            let digit = (initial % 10) as u8;
            let target = if input { points.lo_hi } else { points.hi_lo };
            if points.closed_range_contains(digit) == input {
                prop_assert_eq!(next, initial);
            } else {
                prop_assert!(next > initial);
                prop_assert!(next - initial < 10);
                prop_assert_eq!((next % 10) as u8, target);
            }
        }

        #[test]
        fn result_always_matches_input_range(
            points in points(),
            initial in 0u64..1_000_000,
            input in any::<bool>(),
        ) {
            let next = advance(initial, points, input);
            prop_assert_eq!(points.closed_range_contains((next % 10) as u8), input);
        }
    }
}
