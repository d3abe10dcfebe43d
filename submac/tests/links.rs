// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright WPAN Contributors 2024.

//! Multi-radio fan-out: smallest-MTU frame selection, per-link sends and
//! completion aggregation.

mod common;

use common::{Clock, Event, EventLog, MockRadio, MockRng, MockTimer};
use wpan_hal::radio::{Caps, KeyMaterial, RadioType, TxFrame, MAX_MTU, MAX_PSDU_LEN};
use wpan_hal::ErrorCode;
use wpan_submac::frame::{
    Address, FrameRead, FrameType, FrameVersion, FrameWrite, KeyIdMode, MacAddrs, SecurityLevel,
};
use wpan_submac::links::{Links, MultiRadioTx, RadioTypes};
use wpan_submac::sub_mac::SubMac;

struct Fixture {
    clock: Clock,
    radio: MockRadio,
    trel_radio: MockRadio,
    timer: MockTimer,
    csl_timer: MockTimer,
    wed_timer: MockTimer,
    rng: MockRng,
}

impl Fixture {
    fn new() -> Fixture {
        let clock = Clock::new(1_000_000);
        Fixture {
            radio: MockRadio::new(clock.clone(), Caps::NONE),
            trel_radio: MockRadio::new(clock.clone(), Caps::NONE),
            timer: MockTimer::new(clock.clone()),
            csl_timer: MockTimer::new(clock.clone()),
            wed_timer: MockTimer::new(clock.clone()),
            rng: MockRng::new(7),
            clock,
        }
    }

    fn links(&self) -> Links<'_, MockRadio, MockRadio, MockTimer> {
        let sub_mac = SubMac::new(
            &self.radio,
            &self.rng,
            &self.timer,
            &self.csl_timer,
            &self.wed_timer,
        );
        Links::new(sub_mac, &self.trel_radio)
    }
}

fn both() -> RadioTypes {
    let mut types = RadioTypes::new();
    types.add_all();
    types
}

fn write_data_frame(frame: &mut TxFrame, payload: &[u8]) {
    let addrs = MacAddrs {
        dst_pan: Some(0xface),
        dst: Address::Short(0xffff),
        src_pan: Some(0xface),
        src: Address::Short(0x0001),
    };
    frame
        .init_mac_header(
            FrameType::Data,
            FrameVersion::V2006,
            &addrs,
            SecurityLevel::None,
            KeyIdMode::Implicit,
        )
        .unwrap();
    frame.append_payload(payload).unwrap();
    frame.channel = 11;
}

#[test]
fn radio_type_set_operations() {
    let mut types = RadioTypes::new();
    assert!(types.is_empty());

    types.add(RadioType::Trel);
    assert!(types.contains(RadioType::Trel));
    assert!(!types.contains(RadioType::Ieee802154));

    types.add_all();
    assert!(types.contains(RadioType::Ieee802154));
    assert_eq!(types, both());
    assert_eq!(types.iter().count(), 2);

    types.remove(RadioType::Trel);
    assert_eq!(types, RadioTypes::single(RadioType::Ieee802154));

    types.clear();
    assert!(types.is_empty());
}

// The prepared frame must fit on every selected link, so the selector
// returns the buffer of the smallest-MTU link.
#[test]
fn smallest_mtu_wins_frame_selection() {
    let fixture = Fixture::new();
    let links = fixture.links();

    let mtu = links.with_tx_frame_for(both(), |frame| {
        assert_eq!(frame.radio_type, RadioType::Ieee802154);
        frame.mtu()
    });
    assert_eq!(mtu, MAX_PSDU_LEN);
    assert_eq!(links.get_selected_radio_types(), both());

    links.clear_tx_frames();
    let mtu = links.with_tx_frame_for(RadioTypes::single(RadioType::Trel), |frame| {
        assert_eq!(frame.radio_type, RadioType::Trel);
        frame.mtu()
    });
    assert_eq!(mtu, MAX_MTU);
    assert_eq!(
        links.get_selected_radio_types(),
        RadioTypes::single(RadioType::Trel)
    );

    links.clear_tx_frames();
    links.with_broadcast_tx_frame(|frame| {
        assert_eq!(frame.radio_type, RadioType::Ieee802154);
    });
    assert_eq!(links.get_selected_radio_types(), both());
}

#[test]
fn send_fans_out_and_copies_into_empty_buffers() {
    let fixture = Fixture::new();
    let links = fixture.links();
    let log = EventLog::new();
    links.set_callbacks(&log);

    links.enable();
    links.receive(11);

    links.clear_tx_frames();
    links.with_broadcast_tx_frame(|frame| write_data_frame(frame, &[0x42; 20]));
    links.send().unwrap();

    // The 802.15.4 side goes through CSMA backoff first.
    fixture.timer.expire();
    links.sub_mac().handle_timer();

    assert_eq!(fixture.radio.transmit_count(), 1);
    assert_eq!(fixture.trel_radio.transmit_count(), 1);

    // The TREL buffer got a copy of the prepared PSDU.
    let ieee_psdu = links.sub_mac().transmit_frame(|frame| frame.psdu().to_vec());
    let trel_psdu = links.trel().transmit_frame(|frame| frame.psdu().to_vec());
    assert_eq!(ieee_psdu, trel_psdu);

    // Per-link completions arrive tagged by radio type.
    links.sub_mac().handle_transmit_done(None, Err(ErrorCode::NoAck));
    links.handle_trel_transmit_done(Ok(()));

    let tx_dones: Vec<(RadioType, Result<(), ErrorCode>)> = log
        .take()
        .into_iter()
        .filter_map(|event| match event {
            Event::TxDone { radio_type, result } => Some((radio_type, result)),
            _ => None,
        })
        .collect();
    assert_eq!(
        tx_dones,
        [
            (RadioType::Ieee802154, Err(ErrorCode::NoAck)),
            (RadioType::Trel, Ok(())),
        ]
    );

    // Aggregation, required = {802.15.4}: overall fails with its error.
    let mut tracker = MultiRadioTx::new(both(), RadioTypes::single(RadioType::Ieee802154));
    let mut overall = None;
    for (radio_type, result) in tx_dones.iter() {
        overall = tracker.record(*radio_type, *result);
    }
    assert_eq!(overall, Some(Err(ErrorCode::NoAck)));

    // Aggregation, required = {}: any success carries the day.
    let mut tracker = MultiRadioTx::new(both(), RadioTypes::new());
    assert_eq!(
        tracker.record(RadioType::Trel, Ok(())),
        Some(Ok(()))
    );
}

#[test]
fn aggregation_waits_for_required_links() {
    let required = RadioTypes::single(RadioType::Ieee802154);

    // Success of a non-required link decides nothing while the required
    // link is pending.
    let mut tracker = MultiRadioTx::new(both(), required);
    assert_eq!(tracker.record(RadioType::Trel, Ok(())), None);
    assert_eq!(
        tracker.record(RadioType::Ieee802154, Ok(())),
        Some(Ok(()))
    );

    // Required link succeeding is decisive even before others report.
    let mut tracker = MultiRadioTx::new(both(), required);
    assert_eq!(
        tracker.record(RadioType::Ieee802154, Ok(())),
        Some(Ok(()))
    );

    // With no required set, the overall error surfaces only after every
    // selected link failed.
    let mut tracker = MultiRadioTx::new(both(), RadioTypes::new());
    assert_eq!(
        tracker.record(RadioType::Trel, Err(ErrorCode::ChannelAccessFailure)),
        None
    );
    assert_eq!(
        tracker.record(RadioType::Ieee802154, Err(ErrorCode::NoAck)),
        Some(Err(ErrorCode::NoAck))
    );
}

#[test]
fn keys_and_counters_dispatch_by_radio_type() {
    let fixture = Fixture::new();
    let links = fixture.links();
    let log = EventLog::new();
    links.set_callbacks(&log);

    links.set_mac_key(
        KeyIdMode::Index,
        1,
        KeyMaterial::Raw([0x0a; 16]),
        KeyMaterial::Raw([0x0b; 16]),
        KeyMaterial::Raw([0x0c; 16]),
        10,
    );
    links.set_trel_mac_key(
        1,
        KeyMaterial::Raw([0x1a; 16]),
        KeyMaterial::Raw([0x1b; 16]),
        KeyMaterial::Raw([0x1c; 16]),
    );

    let ieee_frame = TxFrame::new(RadioType::Ieee802154, MAX_PSDU_LEN);
    let trel_frame = TxFrame::new(RadioType::Trel, MAX_MTU);

    assert_eq!(
        links.get_current_mac_key(&ieee_frame),
        KeyMaterial::Raw([0x0b; 16])
    );
    assert_eq!(
        links.get_current_mac_key(&trel_frame),
        KeyMaterial::Raw([0x1b; 16])
    );

    assert_eq!(
        links.get_temporary_mac_key(&ieee_frame, 9),
        Some(KeyMaterial::Raw([0x0a; 16]))
    );
    assert_eq!(
        links.get_temporary_mac_key(&trel_frame, 11),
        Some(KeyMaterial::Raw([0x1c; 16]))
    );
    assert_eq!(links.get_temporary_mac_key(&ieee_frame, 12), None);
}

#[test]
fn trel_transmissions_stamp_and_advance_the_trel_counter() {
    let fixture = Fixture::new();
    let links = fixture.links();
    let log = EventLog::new();
    links.set_callbacks(&log);

    links.enable();
    links.clear_tx_frames();
    links.with_tx_frame(RadioType::Trel, |frame| {
        let addrs = MacAddrs {
            dst_pan: Some(0xface),
            dst: Address::Extended([2; 8]),
            src_pan: Some(0xface),
            src: Address::Extended([3; 8]),
        };
        frame
            .init_mac_header(
                FrameType::Data,
                FrameVersion::V2006,
                &addrs,
                SecurityLevel::EncMic32,
                KeyIdMode::Index,
            )
            .unwrap();
        frame.channel = 11;
    });

    assert_eq!(links.get_trel_mac_frame_counter(), 0);
    links.send().unwrap();

    assert_eq!(links.get_trel_mac_frame_counter(), 1);
    let stamped = links
        .trel()
        .transmit_frame(|frame| frame.frame_counter().unwrap());
    assert_eq!(stamped, 0);
    assert_eq!(fixture.trel_radio.transmit_count(), 1);
}
