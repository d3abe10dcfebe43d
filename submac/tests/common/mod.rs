// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright WPAN Contributors 2024.

//! Scripted platform doubles for driving the sub-MAC state machine: a
//! radio that records every operation, manually-expired timers sharing one
//! mock clock, and a callback sink that keeps a single ordered event log.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use wpan_hal::radio::{Caps, KeyMaterial, Radio, RxFrame, TxFrame};
use wpan_hal::rng::Rng;
use wpan_hal::time::{Time, Timer};
use wpan_hal::ErrorCode;

use wpan_submac::sub_mac::{Callbacks, SubMac};

pub type TestSubMac<'a> = SubMac<'a, MockRadio, MockTimer>;

/// A shared microsecond test clock.
#[derive(Clone)]
pub struct Clock(Rc<Cell<u64>>);

impl Clock {
    pub fn new(start_us: u64) -> Clock {
        Clock(Rc::new(Cell::new(start_us)))
    }

    pub fn now_us(&self) -> u64 {
        self.0.get()
    }

    pub fn advance(&self, us: u64) {
        self.0.set(self.0.get() + us);
    }

    pub fn set(&self, us: u64) {
        self.0.set(us);
    }
}

/// A one-shot timer expired by hand from the test body.
///
/// The fire time stays readable after expiry, as an expiry handler is
/// allowed to re-arm relative to the instant that just fired.
pub struct MockTimer {
    clock: Clock,
    deadline: Cell<Time>,
    running: Cell<bool>,
}

impl MockTimer {
    pub fn new(clock: Clock) -> MockTimer {
        MockTimer {
            clock,
            deadline: Cell::new(Time(0)),
            running: Cell::new(false),
        }
    }

    /// Jumps the clock to the armed deadline and disarms. The caller then
    /// invokes the matching `handle_*_timer` upcall.
    pub fn expire(&self) -> Time {
        assert!(self.running.get(), "timer not armed");
        self.running.set(false);
        let deadline = self.deadline.get();
        self.clock.set(deadline.value() as u64);
        deadline
    }

    pub fn deadline(&self) -> Option<Time> {
        self.running.get().then(|| self.deadline.get())
    }
}

impl Timer for MockTimer {
    fn now(&self) -> Time {
        Time(self.clock.now_us() as u32)
    }

    fn start_at(&self, start: Time, dt: u32) {
        self.deadline.set(start + dt);
        self.running.set(true);
    }

    fn fire_time(&self) -> Time {
        self.deadline.get()
    }

    fn is_running(&self) -> bool {
        self.running.get()
    }

    fn stop(&self) {
        self.running.set(false);
    }
}

/// Deterministic xorshift randomness.
pub struct MockRng(Cell<u32>);

impl MockRng {
    pub fn new(seed: u32) -> MockRng {
        MockRng(Cell::new(seed.max(1)))
    }
}

impl Rng for MockRng {
    fn next_u32(&self) -> u32 {
        let mut x = self.0.get();
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0.set(x);
        x
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum RadioOp {
    Enable,
    Disable,
    Sleep,
    Receive(u8),
    ReceiveAt {
        channel: u8,
        start_us: u32,
        duration_us: u32,
    },
    Transmit {
        channel: u8,
        psdu: Vec<u8>,
    },
    EnergyScan {
        channel: u8,
        duration_ms: u16,
    },
    EnableCsl {
        period: u16,
        short_addr: u16,
    },
    EnableMultiCsl(u16),
    AddCslEntry(u16),
    ClearCslEntry(u16),
    ClearCslEntries,
}

/// A platform radio double that records every call.
pub struct MockRadio {
    clock: Clock,
    caps: Caps,
    pub ops: RefCell<Vec<RadioOp>>,
    pub rssi: Cell<i8>,
    pub csl_accuracy: Cell<u8>,
    pub csl_uncertainty: Cell<u8>,
    pub max_multi_csl_peers: Cell<u8>,
    pub csl_sample_times: RefCell<Vec<u32>>,
}

impl MockRadio {
    pub fn new(clock: Clock, caps: Caps) -> MockRadio {
        MockRadio {
            clock,
            caps,
            ops: RefCell::new(Vec::new()),
            rssi: Cell::new(-70),
            csl_accuracy: Cell::new(40),
            csl_uncertainty: Cell::new(50),
            max_multi_csl_peers: Cell::new(0),
            csl_sample_times: RefCell::new(Vec::new()),
        }
    }

    fn record(&self, op: RadioOp) {
        self.ops.borrow_mut().push(op);
    }

    pub fn take_ops(&self) -> Vec<RadioOp> {
        self.ops.borrow_mut().drain(..).collect()
    }

    pub fn last_op(&self) -> Option<RadioOp> {
        self.ops.borrow().last().cloned()
    }

    pub fn transmit_count(&self) -> usize {
        self.ops
            .borrow()
            .iter()
            .filter(|op| matches!(op, RadioOp::Transmit { .. }))
            .count()
    }
}

impl Radio for MockRadio {
    fn caps(&self) -> Caps {
        self.caps
    }

    fn enable(&self) -> Result<(), ErrorCode> {
        self.record(RadioOp::Enable);
        Ok(())
    }

    fn disable(&self) -> Result<(), ErrorCode> {
        self.record(RadioOp::Disable);
        Ok(())
    }

    fn sleep(&self) -> Result<(), ErrorCode> {
        self.record(RadioOp::Sleep);
        Ok(())
    }

    fn receive(&self, channel: u8) -> Result<(), ErrorCode> {
        self.record(RadioOp::Receive(channel));
        Ok(())
    }

    fn receive_at(&self, channel: u8, start_us: u32, duration_us: u32) -> Result<(), ErrorCode> {
        self.record(RadioOp::ReceiveAt {
            channel,
            start_us,
            duration_us,
        });
        Ok(())
    }

    fn transmit(&self, frame: &mut TxFrame) -> Result<(), ErrorCode> {
        self.record(RadioOp::Transmit {
            channel: frame.channel,
            psdu: frame.psdu().to_vec(),
        });
        Ok(())
    }

    fn energy_scan(&self, channel: u8, duration_ms: u16) -> Result<(), ErrorCode> {
        self.record(RadioOp::EnergyScan {
            channel,
            duration_ms,
        });
        Ok(())
    }

    fn set_pan_id(&self, _pan_id: u16) {}

    fn set_short_address(&self, _short_address: u16) {}

    fn set_extended_address(&self, _ext_address: [u8; 8]) {}

    fn set_mac_key(
        &self,
        _key_id_mode: u8,
        _key_id: u8,
        _prev_key: &KeyMaterial,
        _curr_key: &KeyMaterial,
        _next_key: &KeyMaterial,
    ) {
    }

    fn now_us(&self) -> u64 {
        self.clock.now_us()
    }

    fn rssi(&self) -> i8 {
        self.rssi.get()
    }

    fn enable_csl(
        &self,
        period: u16,
        short_addr: u16,
        _ext_address: Option<&[u8; 8]>,
    ) -> Result<(), ErrorCode> {
        self.record(RadioOp::EnableCsl { period, short_addr });
        Ok(())
    }

    fn enable_multi_csl(&self, period: u16) -> Result<(), ErrorCode> {
        self.record(RadioOp::EnableMultiCsl(period));
        Ok(())
    }

    fn add_csl_entry(&self, short_addr: u16, _ext_address: [u8; 8]) -> Result<(), ErrorCode> {
        self.record(RadioOp::AddCslEntry(short_addr));
        Ok(())
    }

    fn clear_csl_entry(&self, short_addr: u16, _ext_address: [u8; 8]) -> Result<(), ErrorCode> {
        self.record(RadioOp::ClearCslEntry(short_addr));
        Ok(())
    }

    fn clear_csl_entries(&self) -> Result<(), ErrorCode> {
        self.record(RadioOp::ClearCslEntries);
        Ok(())
    }

    fn update_csl_sample_time(&self, sample_time_us: u32) {
        self.csl_sample_times.borrow_mut().push(sample_time_us);
    }

    fn csl_accuracy(&self) -> u8 {
        self.csl_accuracy.get()
    }

    fn csl_uncertainty(&self) -> u8 {
        self.csl_uncertainty.get()
    }

    fn max_multi_csl_peers(&self) -> u8 {
        self.max_multi_csl_peers.get()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    Cca {
        success: bool,
        channel: u8,
    },
    TxStatus {
        result: Result<(), ErrorCode>,
        retries: u8,
        will_retx: bool,
    },
    TxDone {
        radio_type: wpan_hal::radio::RadioType,
        result: Result<(), ErrorCode>,
    },
    RxDone(Result<(), ErrorCode>),
    ScanDone(i8),
    CounterUpdated(u32),
}

/// Records every callback in arrival order.
#[derive(Default)]
pub struct EventLog {
    pub events: RefCell<Vec<Event>>,
}

impl EventLog {
    pub fn new() -> EventLog {
        EventLog::default()
    }

    pub fn take(&self) -> Vec<Event> {
        self.events.borrow_mut().drain(..).collect()
    }

    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events.borrow().iter().filter(|event| pred(*event)).count()
    }

    fn push(&self, event: Event) {
        self.events.borrow_mut().push(event);
    }
}

impl Callbacks for EventLog {
    fn receive_done(&self, _frame: Option<&RxFrame>, result: Result<(), ErrorCode>) {
        self.push(Event::RxDone(result));
    }

    fn record_cca_status(&self, cca_success: bool, channel: u8) {
        self.push(Event::Cca {
            success: cca_success,
            channel,
        });
    }

    fn record_frame_transmit_status(
        &self,
        _frame: &TxFrame,
        _ack: Option<&RxFrame>,
        result: Result<(), ErrorCode>,
        retry_count: u8,
        will_retx: bool,
    ) {
        self.push(Event::TxStatus {
            result,
            retries: retry_count,
            will_retx,
        });
    }

    fn transmit_done(&self, frame: &TxFrame, _ack: Option<&RxFrame>, result: Result<(), ErrorCode>) {
        self.push(Event::TxDone {
            radio_type: frame.radio_type,
            result,
        });
    }

    fn energy_scan_done(&self, max_rssi: i8) {
        self.push(Event::ScanDone(max_rssi));
    }

    fn frame_counter_updated(&self, frame_counter: u32) {
        self.push(Event::CounterUpdated(frame_counter));
    }
}

/// A test fixture bundling the platform doubles a `SubMac` needs.
pub struct Platform {
    pub clock: Clock,
    pub radio: MockRadio,
    pub timer: MockTimer,
    pub csl_timer: MockTimer,
    pub wed_timer: MockTimer,
    pub rng: MockRng,
}

impl Platform {
    pub fn new(caps: Caps) -> Platform {
        let clock = Clock::new(1_000_000);
        Platform {
            radio: MockRadio::new(clock.clone(), caps),
            timer: MockTimer::new(clock.clone()),
            csl_timer: MockTimer::new(clock.clone()),
            wed_timer: MockTimer::new(clock.clone()),
            rng: MockRng::new(0x5eed),
            clock,
        }
    }

    pub fn sub_mac(&self) -> TestSubMac<'_> {
        SubMac::new(
            &self.radio,
            &self.rng,
            &self.timer,
            &self.csl_timer,
            &self.wed_timer,
        )
    }
}

/// Builds a minimal unicast data frame in the sub-MAC transmit buffer.
pub fn prepare_data_frame(
    sub_mac: &TestSubMac<'_>,
    channel: u8,
    ack_request: bool,
    security: bool,
) {
    use wpan_submac::frame::{
        Address, FrameType, FrameVersion, FrameWrite, KeyIdMode, MacAddrs, SecurityLevel,
    };

    sub_mac.transmit_frame(|frame| {
        frame.reset();
        let addrs = MacAddrs {
            dst_pan: Some(0xface),
            dst: Address::Short(0x1234),
            src_pan: Some(0xface),
            src: Address::Short(0x5678),
        };
        let (level, mode) = if security {
            (SecurityLevel::EncMic32, KeyIdMode::Index)
        } else {
            (SecurityLevel::None, KeyIdMode::Implicit)
        };
        frame
            .init_mac_header(FrameType::Data, FrameVersion::V2006, &addrs, level, mode)
            .unwrap();
        frame.set_sequence(1);
        frame.set_ack_request(ack_request);
        frame.append_payload(&[0xde, 0xad]).unwrap();
        frame.channel = channel;
    });
}
