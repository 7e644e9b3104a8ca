//! Property-based tests for the persisted encodings
//!
//! These verify that type sets and address records survive a save/load
//! cycle for any mix of transports and parameters.

use proptest::prelude::*;
use xwcomms_core::{AddrRecord, ConnType, ConnTypeSet, MqttDevId};

/// Any subset of the real transports (never NONE)
fn arb_conn_type_set() -> impl Strategy<Value = ConnTypeSet> {
    prop::collection::vec(1u8..=8, 0..8).prop_map(|ordinals| {
        ordinals
            .into_iter()
            .filter_map(ConnType::from_ordinal)
            .collect()
    })
}

fn arb_short_string() -> impl Strategy<Value = String> {
    prop::string::string_regex(r"[a-zA-Z0-9:.+\-]{0,40}").unwrap()
}

/// Address with every parameter bundle filled in, whatever is active
fn arb_addr_record() -> impl Strategy<Value = AddrRecord> {
    (
        arb_conn_type_set(),
        (arb_short_string(), arb_short_string(), any::<u32>(), any::<u16>()),
        (any::<bool>(), any::<bool>()),
        (arb_short_string(), arb_short_string()),
        (arb_short_string(), any::<u16>()),
        arb_short_string(),
        any::<u64>(),
    )
        .prop_map(
            |(types, (invite, host, ip, port), (seeks, advertise), (bt_name, bt_addr), (phone, sms_port), mac, dev_id)| {
                let mut addr = AddrRecord::new();
                for conn_type in types.iter() {
                    addr.add_type(conn_type);
                }
                addr.relay.invite = invite;
                addr.relay.host = host.clone();
                addr.relay.ip_addr = ip;
                addr.relay.port = port;
                addr.relay.seeks_public_room = seeks;
                addr.relay.advertise_room = advertise;
                addr.bt.host_name = bt_name;
                addr.bt.bt_addr = bt_addr;
                addr.sms.phone = phone;
                addr.sms.port = sms_port;
                addr.p2p.mac_addr = mac;
                addr.mqtt.dev_id = MqttDevId::new(dev_id);
                addr.ip_direct.host_name = host;
                addr.ip_direct.ip_addr = ip;
                addr.ip_direct.port = port;
                addr
            },
        )
}

proptest! {
    /// Property: decode(encode(S)) == S for every set without NONE
    #[test]
    fn conn_type_set_round_trips(set in arb_conn_type_set()) {
        prop_assert_eq!(ConnTypeSet::from_bits(set.to_bits()), set);
        prop_assert_eq!(ConnTypeSet::from_raw_bits(set.raw_bits()), set);
    }

    /// Property: adding NONE never changes a set
    #[test]
    fn adding_none_is_a_no_op(set in arb_conn_type_set()) {
        let mut with_none = set;
        prop_assert!(!with_none.add(ConnType::None));
        prop_assert_eq!(with_none, set);
        prop_assert!(!with_none.contains(ConnType::None));
    }

    /// Property: display order is always a subsequence of the usability order
    #[test]
    fn display_order_is_stable(set in arb_conn_type_set()) {
        let order: Vec<ConnType> = set.display_types().into_iter().collect();
        let mut positions = order
            .iter()
            .map(|t| ConnType::DISPLAY_ORDER.iter().position(|d| d == t).unwrap());
        let mut last = None;
        for pos in &mut positions {
            prop_assert!(last.map_or(true, |prev| pos > prev));
            last = Some(pos);
        }
        prop_assert_eq!(order.len(), set.len());
    }

    /// Property: address records survive a save/load cycle byte for byte
    #[test]
    fn addr_record_round_trips(addr in arb_addr_record()) {
        let bytes = addr.to_bytes().unwrap();
        let decoded = AddrRecord::from_bytes(&bytes).unwrap();
        prop_assert_eq!(&decoded, &addr);
        prop_assert_eq!(decoded.to_bytes().unwrap(), bytes);
    }

    /// Property: an address never "changes" relative to its own copy,
    /// except while its relay room is unset
    #[test]
    fn identical_addresses_dont_matter(addr in arb_addr_record()) {
        let unset_room = addr.contains(ConnType::Relay) && addr.relay.invite.is_empty();
        prop_assert_eq!(addr.changes_matter(&addr.clone()), unset_room);
    }
}
