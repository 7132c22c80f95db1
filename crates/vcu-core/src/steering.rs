//! Steering wheel buttons. Every action needs a long press; releasing early
//! cancels it.

use std::time::Duration;

use tokio::time::Instant;
use vcu_proto::DrivingMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonAction {
    ToggleTs,
    Direction(DrivingMode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Press {
    Idle,
    Pressed(Instant),
    Fired,
}

struct Button {
    bit: u8,
    hold: Duration,
    action: ButtonAction,
    press: Press,
}

pub struct SteeringWheel {
    buttons: [Button; 4],
}

impl Default for SteeringWheel {
    fn default() -> Self {
        Self::new()
    }
}

impl SteeringWheel {
    pub fn new() -> Self {
        let button = |bit, ms, action| Button { bit, hold: Duration::from_millis(ms), action, press: Press::Idle };
        Self {
            buttons: [
                button(0, 2000, ButtonAction::ToggleTs),
                button(1, 1000, ButtonAction::Direction(DrivingMode::Forward)),
                button(2, 1000, ButtonAction::Direction(DrivingMode::Reverse)),
                button(3, 1000, ButtonAction::Direction(DrivingMode::Neutral)),
            ],
        }
    }

    /// New button bitmask from BUTTON_CHANGE.
    pub fn on_button_change(&mut self, state: u8, now: Instant) -> Vec<ButtonAction> {
        for b in &mut self.buttons {
            let down = state & (1 << b.bit) != 0;
            b.press = match (b.press, down) {
                (Press::Idle, true) => Press::Pressed(now),
                (_, false) => Press::Idle,
                (p, true) => p,
            };
        }
        self.tick(now)
    }

    /// Fires every press held past its threshold, once per press.
    pub fn tick(&mut self, now: Instant) -> Vec<ButtonAction> {
        let mut fired = Vec::new();
        for b in &mut self.buttons {
            if let Press::Pressed(since) = b.press {
                if now.duration_since(since) >= b.hold {
                    b.press = Press::Fired;
                    fired.push(b.action);
                }
            }
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_long_press_fires_once() {
        let t0 = Instant::now();
        let mut wheel = SteeringWheel::new();
        assert!(wheel.on_button_change(0b0010, t0).is_empty());
        assert!(wheel.tick(t0 + ms(999)).is_empty());
        assert_eq!(wheel.tick(t0 + ms(1000)), vec![ButtonAction::Direction(DrivingMode::Forward)]);
        assert!(wheel.tick(t0 + ms(5000)).is_empty());
        // release and press again
        wheel.on_button_change(0, t0 + ms(5100));
        wheel.on_button_change(0b0010, t0 + ms(5200));
        assert_eq!(wheel.tick(t0 + ms(6200)).len(), 1);
    }

    #[test]
    fn test_early_release_cancels() {
        let t0 = Instant::now();
        let mut wheel = SteeringWheel::new();
        wheel.on_button_change(0b0001, t0);
        assert!(wheel.tick(t0 + ms(1500)).is_empty());
        wheel.on_button_change(0, t0 + ms(1900));
        assert!(wheel.tick(t0 + ms(2500)).is_empty());
    }

    #[test]
    fn test_buttons_are_independent() {
        let t0 = Instant::now();
        let mut wheel = SteeringWheel::new();
        wheel.on_button_change(0b0001, t0);
        wheel.on_button_change(0b1001, t0 + ms(1200));
        assert!(wheel.tick(t0 + ms(1999)).is_empty());
        let fired = wheel.tick(t0 + ms(2200));
        assert_eq!(fired, vec![ButtonAction::ToggleTs, ButtonAction::Direction(DrivingMode::Neutral)]);
    }
}
