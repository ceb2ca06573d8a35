//! Control header layout and wire encoding.

use uwblink::header::{HeaderCfg, HeaderField, LinkProtocol, PhaseData, TimeslotIdSaw};

#[test]
fn timeslot_id_saw_byte_layout() {
    // Low 7 bits carry the slot id, the top bit the SAW sequence.
    let byte = TimeslotIdSaw::new()
        .with_timeslot_id(5)
        .with_saw_seq(true)
        .into_bytes()[0];
    assert_eq!(hex::encode([byte]), "85");

    let byte = TimeslotIdSaw::new()
        .with_timeslot_id(0x7f)
        .with_saw_seq(false)
        .into_bytes()[0];
    assert_eq!(hex::encode([byte]), "7f");

    let parsed = TimeslotIdSaw::from_bytes([0xfe]);
    assert_eq!(parsed.timeslot_id(), 0x7e);
    assert!(parsed.saw_seq());

    let parsed = TimeslotIdSaw::from_bytes([0x03]);
    assert_eq!(parsed.timeslot_id(), 3);
    assert!(!parsed.saw_seq());
}

#[test]
fn round_trip_every_value() {
    for id in 0..128u8 {
        for saw in [false, true] {
            let byte = TimeslotIdSaw::new()
                .with_timeslot_id(id)
                .with_saw_seq(saw)
                .into_bytes();
            let parsed = TimeslotIdSaw::from_bytes(byte);
            assert_eq!(parsed.timeslot_id(), id);
            assert_eq!(parsed.saw_seq(), saw);
        }
    }
}

#[test]
fn protocol_field_order_and_sizes() {
    let protocol = LinkProtocol::new(HeaderCfg {
        main_connection: true,
        rdo_enabled: true,
        ranging_phase_accumulator: true,
        ranging_phase_provider: true,
    });
    assert_eq!(
        protocol.fields(),
        &[
            HeaderField::TimeslotIdSaw,
            HeaderField::ChannelIndex,
            HeaderField::Rdo,
            HeaderField::RangingPhaseCount,
            HeaderField::RangingPhases,
        ]
    );
    assert_eq!(protocol.header_size(), 1 + 1 + 2 + 1 + 5);
}

#[test]
fn auto_reply_connections_omit_the_main_fields() {
    let protocol = LinkProtocol::new(HeaderCfg {
        main_connection: false,
        rdo_enabled: true,
        ranging_phase_accumulator: false,
        ranging_phase_provider: false,
    });
    assert_eq!(protocol.fields(), &[HeaderField::Rdo]);
    assert_eq!(protocol.header_size(), 2);

    let bare = LinkProtocol::new(HeaderCfg::default());
    assert_eq!(bare.header_size(), 0);
}

#[test]
fn main_connection_minimal_header_is_two_bytes() {
    let protocol = LinkProtocol::new(HeaderCfg {
        main_connection: true,
        ..HeaderCfg::default()
    });
    assert_eq!(protocol.header_size(), 2);
}

#[test]
fn phase_data_pairing() {
    let mut data = PhaseData::default();
    // Remote trails local by one: valid.
    data.local_phases_count = 5;
    data.remote_phases_count = 4;
    assert!(data.is_valid());
    data.remote_phases_count = 5;
    assert!(!data.is_valid());

    data.local_phases_info.phase1 = 0x11;
    data.update(0x1234);
    assert_eq!(data.local_phases_count, 6);
    assert_eq!(data.last_local_phases_info.phase1, 0x11);
    assert_eq!(data.last_local_phases_info.rx_waited0, 0x34);
    assert_eq!(data.last_local_phases_info.rx_waited1, 0x12);
}
