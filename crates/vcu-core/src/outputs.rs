use std::sync::Arc;

use tracing::{error, info, warn};
use vcu_params::{Param, ParamStore};
use vcu_proto::lfs::DigitalOutputs as DigitalOutputsMsg;
use vcu_proto::LfsMessage;

use crate::hal::{Hardware, Led, TS_RELAY_CHANNEL};
use crate::telemetry::TelemetrySink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Output {
    FootSwitch,
    Forward,
    Reverse,
    CoolantPump,
    BrakeLight,
    TsActive,
}

impl Output {
    pub fn param(self) -> Param {
        match self {
            Output::FootSwitch => Param::FsOutput,
            Output::Forward => Param::ForwardSwitch,
            Output::Reverse => Param::ReverseSwitch,
            Output::CoolantPump => Param::CoolPumpOutput,
            Output::BrakeLight => Param::BrakeLightOut,
            Output::TsActive => Param::TsActiveOut,
        }
    }

    pub fn channel(self) -> u8 {
        match self {
            Output::FootSwitch => 5,
            Output::Forward => 6,
            Output::Reverse => 4,
            Output::CoolantPump => 8,
            Output::BrakeLight => 7,
            Output::TsActive => TS_RELAY_CHANNEL,
        }
    }

    /// Active-low relays.
    pub fn inverted(self) -> bool {
        matches!(self, Output::Reverse)
    }
}

fn led_param(led: Led) -> Param {
    match led {
        Led::Red => Param::RedLedOutput,
        Led::Green => Param::GreenLedOutput,
        Led::Blue => Param::BlueLedOutput,
    }
}

/// Relay and LED outputs. The parameter store is the cache: a pin is only
/// written, and DIGITAL_OUTPUTS only sent, when the cached value changes.
pub struct DigitalOutputsController {
    params: Arc<ParamStore>,
    hw: Hardware,
    sink: Arc<dyn TelemetrySink>,
}

impl DigitalOutputsController {
    pub fn new(params: Arc<ParamStore>, hw: Hardware, sink: Arc<dyn TelemetrySink>) -> Self {
        Self { params, hw, sink }
    }

    pub fn get(&self, out: Output) -> bool {
        self.params.flag(out.param())
    }

    /// Returns true when the output changed.
    pub fn set(&self, out: Output, on: bool, announce: bool) -> bool {
        if self.get(out) == on {
            return false;
        }
        if !self.write_pin(out, on) {
            return false;
        }
        if announce {
            self.announce();
        }
        true
    }

    /// Writes the pin and cache without comparing against the cached value.
    pub fn force(&self, out: Output, on: bool) -> bool {
        self.write_pin(out, on)
    }

    fn write_pin(&self, out: Output, on: bool) -> bool {
        if let Err(e) = self.hw.relays.set_output(out.channel(), on ^ out.inverted()) {
            error!("outputs: relay {} ({:?}) write failed: {}", out.channel(), out, e);
            return false;
        }
        if let Err(e) = self.params.set(out.param(), on) {
            warn!("outputs: cache {:?}: {}", out, e);
        }
        true
    }

    pub fn set_forward_switch(&self, on: bool) -> bool {
        self.set(Output::Forward, on, true)
    }

    pub fn set_reverse_switch(&self, on: bool) -> bool {
        self.set(Output::Reverse, on, true)
    }

    pub fn set_coolant_pump_output(&self, on: bool) -> bool {
        self.set(Output::CoolantPump, on, true)
    }

    pub fn set_brake_light_output(&self, on: bool) -> bool {
        self.set(Output::BrakeLight, on, true)
    }

    pub fn set_ts_active_relay(&self, on: bool) -> bool {
        self.set(Output::TsActive, on, true)
    }

    pub fn set_foot_switch(&self, on: bool) -> bool {
        self.set(Output::FootSwitch, on, true)
    }

    pub fn led(&self, led: Led) -> bool {
        self.params.flag(led_param(led))
    }

    pub fn set_led(&self, led: Led, on: bool) -> bool {
        if self.led(led) == on {
            return false;
        }
        if let Err(e) = self.hw.leds.set(led, on) {
            error!("outputs: {:?} led write failed: {}", led, e);
            return false;
        }
        self.params.set(led_param(led), on).ok();
        self.announce();
        true
    }

    /// One DIGITAL_OUTPUTS with every output and LED.
    pub fn announce(&self) {
        let p = &self.params;
        let msg = DigitalOutputsMsg {
            forward_switch: p.flag(Param::ForwardSwitch),
            reverse_switch: p.flag(Param::ReverseSwitch),
            foot_switch: p.flag(Param::FsOutput),
            brake_light: p.flag(Param::BrakeLightOut),
            coolant_pump: p.flag(Param::CoolPumpOutput),
            ts_active: p.flag(Param::TsActiveOut),
            red_led: p.flag(Param::RedLedOutput),
            green_led: p.flag(Param::GreenLedOutput),
            blue_led: p.flag(Param::BlueLedOutput),
        };
        self.sink.send(LfsMessage::DigitalOutputs(msg).into());
    }

    /// Puts the pins into a known state at boot.
    pub fn init(&self) {
        self.force(Output::Reverse, false);
        let pump = self.params.flag(Param::CoolPumpStart);
        self.force(Output::CoolantPump, pump);
        info!("outputs: initialized, coolant pump {}", if pump { "on" } else { "off" });
        self.announce();
    }

    /// `param1 > 0` switches the pump (1 = on), `param2 > 0` stores the boot
    /// preference (1 = on).
    pub fn coolant_command(&self, param1: f32, param2: f32) {
        if param1 > 0.0 {
            let on = param1 == 1.0;
            self.set_coolant_pump_output(on);
            info!("Coolant pump switched {}.", if on { "on" } else { "off" });
        }
        if param2 > 0.0 {
            let on = param2 == 1.0;
            self.params.set(Param::CoolPumpStart, on).ok();
            if let Err(e) = self.params.persist(Param::CoolPumpStart) {
                error!("outputs: {}", e);
            }
            info!("Coolant pump at startup {}.", if on { "enabled" } else { "disabled" });
        }
    }
}
