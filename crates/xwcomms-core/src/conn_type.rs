//! Transport kinds and sets of them
//!
//! `ConnType` enumerates every way a device can reach a peer. Ordinals are
//! persisted in saved games, so the variant order is fixed. `ConnTypeSet` is
//! the set of transports active for one address, stored as a bit vector.

use core::fmt;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::{error, warn};

// ----------------------------------------------------------------------------
// Connection Type
// ----------------------------------------------------------------------------

/// One discrete transport mechanism
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ConnType {
    None = 0,
    Ir = 1,
    IpDirect = 2,
    Relay = 3,
    Bt = 4,
    Sms = 5,
    P2p = 6,
    Nfc = 7,
    Mqtt = 8,
}

impl ConnType {
    /// Every variant in ordinal order
    pub const ALL: [ConnType; 9] = [
        ConnType::None,
        ConnType::Ir,
        ConnType::IpDirect,
        ConnType::Relay,
        ConnType::Bt,
        ConnType::Sms,
        ConnType::P2p,
        ConnType::Nfc,
        ConnType::Mqtt,
    ];

    /// Usability-first order used whenever types are listed for people
    pub const DISPLAY_ORDER: [ConnType; 8] = [
        ConnType::Relay,
        ConnType::Mqtt,
        ConnType::Bt,
        ConnType::P2p,
        ConnType::Sms,
        ConnType::Nfc,
        ConnType::Ir,
        ConnType::IpDirect,
    ];

    pub fn ordinal(&self) -> u8 {
        *self as u8
    }

    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        Self::ALL.get(ordinal as usize).copied()
    }

    /// Whether the type may be offered in a picker. Static; says nothing
    /// about whether this device can actually use it.
    pub fn is_user_selectable(&self) -> bool {
        match self {
            ConnType::Nfc => false,
            ConnType::Relay => cfg!(feature = "relay"),
            _ => true,
        }
    }

    /// Last component of the debug name, e.g. "MQTT"
    pub fn short_name(&self) -> &'static str {
        match self {
            ConnType::None => "NONE",
            ConnType::Ir => "IR",
            ConnType::IpDirect => "DIRECT",
            ConnType::Relay => "RELAY",
            ConnType::Bt => "BT",
            ConnType::Sms => "SMS",
            ConnType::P2p => "P2P",
            ConnType::Nfc => "NFC",
            ConnType::Mqtt => "MQTT",
        }
    }

    /// Human-facing name
    pub fn long_name(&self) -> &'static str {
        match self {
            ConnType::Relay => "Relay",
            ConnType::Bt => "Bluetooth",
            ConnType::Sms => "Data SMS",
            ConnType::P2p => "Wi-Fi Direct",
            ConnType::Nfc => "NFC",
            ConnType::Mqtt => "Internet/MQTT",
            other => other.short_name(),
        }
    }

    fn bit(&self) -> Option<u16> {
        match self {
            ConnType::None => None,
            other => Some(1 << (other.ordinal() - 1)),
        }
    }
}

impl fmt::Display for ConnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnType::None => "COMMS_CONN_NONE",
            ConnType::Ir => "COMMS_CONN_IR",
            ConnType::IpDirect => "COMMS_CONN_IP_DIRECT",
            ConnType::Relay => "COMMS_CONN_RELAY",
            ConnType::Bt => "COMMS_CONN_BT",
            ConnType::Sms => "COMMS_CONN_SMS",
            ConnType::P2p => "COMMS_CONN_P2P",
            ConnType::Nfc => "COMMS_CONN_NFC",
            ConnType::Mqtt => "COMMS_CONN_MQTT",
        };
        f.write_str(name)
    }
}

// ----------------------------------------------------------------------------
// Connection Type Set
// ----------------------------------------------------------------------------

/// Set of active transports. NONE is never a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ConnTypeSet {
    bits: u16,
}

impl ConnTypeSet {
    /// Marks the integer encoding as a bit vector rather than a legacy ordinal
    pub const BIT_VECTOR_MASK: u32 = 0x8000;

    /// Bits that map to real variants (ordinals 1..=8)
    const VALID_BITS: u16 = 0x00FF;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(conn_type: ConnType) -> Self {
        let mut set = Self::new();
        set.add(conn_type);
        set
    }

    /// Add a type. Adding NONE is silently ignored. Returns true if the set changed.
    pub fn add(&mut self, conn_type: ConnType) -> bool {
        match conn_type.bit() {
            Some(bit) => {
                let was_present = self.bits & bit != 0;
                self.bits |= bit;
                !was_present
            }
            None => false,
        }
    }

    pub fn remove(&mut self, conn_type: ConnType) -> bool {
        match conn_type.bit() {
            Some(bit) => {
                let was_present = self.bits & bit != 0;
                self.bits &= !bit;
                was_present
            }
            None => false,
        }
    }

    pub fn contains(&self, conn_type: ConnType) -> bool {
        conn_type.bit().map_or(false, |bit| self.bits & bit != 0)
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    pub fn len(&self) -> usize {
        self.bits.count_ones() as usize
    }

    pub fn union(&self, other: &ConnTypeSet) -> ConnTypeSet {
        ConnTypeSet {
            bits: self.bits | other.bits,
        }
    }

    /// Members in ordinal order (the order addresses are persisted in)
    pub fn iter(&self) -> impl Iterator<Item = ConnType> + '_ {
        ConnType::ALL.iter().copied().filter(move |t| self.contains(*t))
    }

    /// Members in usability-first display order
    pub fn display_types(&self) -> SmallVec<[ConnType; 8]> {
        ConnType::DISPLAY_ORDER
            .iter()
            .copied()
            .filter(|t| self.contains(*t))
            .collect()
    }

    /// Join the user-selectable members for display
    pub fn to_display_string(&self, long_version: bool) -> String {
        if self.is_empty() {
            return "none".to_string();
        }
        let names: Vec<&str> = self
            .display_types()
            .into_iter()
            .filter(|t| t.is_user_selectable())
            .map(|t| if long_version { t.long_name() } else { t.short_name() })
            .collect();
        names.join(if long_version { " + " } else { "," })
    }

    /// Raw bit field, as written into saved address records
    pub fn raw_bits(&self) -> u8 {
        (self.bits & Self::VALID_BITS) as u8
    }

    pub fn from_raw_bits(bits: u8) -> Self {
        Self { bits: bits as u16 }
    }

    /// Integer encoding with the bit-vector marker set
    pub fn to_bits(&self) -> u32 {
        Self::BIT_VECTOR_MASK | self.bits as u32
    }

    /// Decode either encoding.
    ///
    /// Without the marker the value is a legacy single ordinal, unless it is
    /// too large to be one, in which case it's a vector saved while the
    /// marker was missing. Unknown bits are logged and dropped.
    pub fn from_bits(in_bits: u32) -> Self {
        let mut is_vector = in_bits & Self::BIT_VECTOR_MASK != 0;
        let bits = in_bits & !Self::BIT_VECTOR_MASK;
        if !is_vector && bits >= ConnType::ALL.len() as u32 {
            is_vector = true;
        }

        let mut set = Self::new();
        if is_vector {
            for conn_type in ConnType::ALL.iter().skip(1) {
                if let Some(bit) = conn_type.bit() {
                    if bits & bit as u32 != 0 {
                        set.add(*conn_type);
                    }
                }
            }
            let unknown = bits & !(Self::VALID_BITS as u32);
            if unknown != 0 {
                warn!(
                    "ConnTypeSet: dropping unknown bits 0x{:x} from 0x{:x}",
                    unknown, in_bits
                );
            }
        } else if let Some(conn_type) = ConnType::from_ordinal(bits as u8) {
            set.add(conn_type);
        } else {
            error!("ConnTypeSet: bad bits value: 0x{:x}", in_bits);
        }
        set
    }
}

impl FromIterator<ConnType> for ConnTypeSet {
    fn from_iter<I: IntoIterator<Item = ConnType>>(iter: I) -> Self {
        let mut set = ConnTypeSet::new();
        for conn_type in iter {
            set.add(conn_type);
        }
        set
    }
}

impl fmt::Display for ConnTypeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.iter().map(|t| t.to_string()).collect();
        write!(f, "[{}]", names.join(","))
    }
}

// ----------------------------------------------------------------------------
// Registry
// ----------------------------------------------------------------------------

/// Host-side check of what this device and build can actually use
pub trait DeviceCaps {
    fn bt_available(&self) -> bool;
    fn sms_capable(&self) -> bool;
    fn mqtt_supported(&self) -> bool;
    fn p2p_enabled(&self) -> bool;
    fn nfc_available(&self) -> bool;

    /// Relay servers are only reachable from builds compiled with them
    fn relay_available(&self) -> bool {
        cfg!(feature = "relay")
    }
}

/// Fixed capability answers, handy for hosts that know their hardware up front
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticDeviceCaps {
    pub bt: bool,
    pub sms: bool,
    pub mqtt: bool,
    pub p2p: bool,
    pub nfc: bool,
    pub relay: bool,
}

impl StaticDeviceCaps {
    pub fn all() -> Self {
        Self {
            bt: true,
            sms: true,
            mqtt: true,
            p2p: true,
            nfc: true,
            relay: true,
        }
    }
}

impl DeviceCaps for StaticDeviceCaps {
    fn bt_available(&self) -> bool {
        self.bt
    }
    fn sms_capable(&self) -> bool {
        self.sms
    }
    fn mqtt_supported(&self) -> bool {
        self.mqtt
    }
    fn p2p_enabled(&self) -> bool {
        self.p2p
    }
    fn nfc_available(&self) -> bool {
        self.nfc
    }
    fn relay_available(&self) -> bool {
        self.relay
    }
}

/// Filters the full enumeration down to what the device supports
pub struct ConnTypeRegistry;

impl ConnTypeRegistry {
    /// Supported types in display order
    pub fn supported(caps: &dyn DeviceCaps) -> Vec<ConnType> {
        let mut supported = Vec::with_capacity(6);
        if caps.relay_available() {
            supported.push(ConnType::Relay);
        }
        if caps.mqtt_supported() {
            supported.push(ConnType::Mqtt);
        }
        if caps.bt_available() {
            supported.push(ConnType::Bt);
        }
        if caps.p2p_enabled() {
            supported.push(ConnType::P2p);
        }
        if caps.sms_capable() {
            supported.push(ConnType::Sms);
        }
        if caps.nfc_available() {
            supported.push(ConnType::Nfc);
        }
        supported
    }

    pub fn is_supported(caps: &dyn DeviceCaps, conn_type: ConnType) -> bool {
        Self::supported(caps).contains(&conn_type)
    }

    /// Drop anything no longer supported (e.g. a revoked permission).
    /// Idempotent. Returns the types removed.
    pub fn remove_unsupported(caps: &dyn DeviceCaps, set: &mut ConnTypeSet) -> ConnTypeSet {
        let supported = Self::supported(caps);
        let mut removed = ConnTypeSet::new();
        for conn_type in set.display_types() {
            if !supported.contains(&conn_type) {
                set.remove(conn_type);
                removed.add(conn_type);
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adding_none_is_a_no_op() {
        let mut set = ConnTypeSet::single(ConnType::Bt);
        let before = set;
        assert!(!set.add(ConnType::None));
        assert_eq!(set, before);
        assert!(!set.contains(ConnType::None));
    }

    #[test]
    fn display_order_is_usability_first() {
        let set: ConnTypeSet = [ConnType::Sms, ConnType::Bt, ConnType::Mqtt, ConnType::Relay]
            .into_iter()
            .collect();
        let order: Vec<ConnType> = set.display_types().into_iter().collect();
        assert_eq!(
            order,
            vec![ConnType::Relay, ConnType::Mqtt, ConnType::Bt, ConnType::Sms]
        );
    }

    #[test]
    fn bit_vector_encoding() {
        let set: ConnTypeSet = [ConnType::Bt, ConnType::Mqtt].into_iter().collect();
        // BT is ordinal 4 -> bit 3, MQTT is ordinal 8 -> bit 7
        assert_eq!(set.to_bits(), 0x8000 | 0x08 | 0x80);
        assert_eq!(ConnTypeSet::from_bits(set.to_bits()), set);
    }

    #[test]
    fn legacy_single_ordinal_decodes() {
        assert_eq!(
            ConnTypeSet::from_bits(ConnType::Sms.ordinal() as u32),
            ConnTypeSet::single(ConnType::Sms)
        );
        assert!(ConnTypeSet::from_bits(0).is_empty());
    }

    #[test]
    fn markerless_vector_is_detected() {
        // 0x88 can't be an ordinal, so it's a vector missing its marker
        let set = ConnTypeSet::from_bits(0x88);
        assert!(set.contains(ConnType::Bt));
        assert!(set.contains(ConnType::Mqtt));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn unknown_bits_are_dropped() {
        let set = ConnTypeSet::from_bits(0x8000 | 0x0100 | 0x08);
        assert_eq!(set, ConnTypeSet::single(ConnType::Bt));
    }

    #[test]
    fn nfc_never_selectable() {
        assert!(!ConnType::Nfc.is_user_selectable());
        assert!(ConnType::Mqtt.is_user_selectable());
        assert_eq!(ConnType::Relay.is_user_selectable(), cfg!(feature = "relay"));
    }

    #[test]
    fn registry_filters_and_prunes() {
        let caps = StaticDeviceCaps {
            bt: true,
            mqtt: true,
            ..Default::default()
        };
        assert_eq!(
            ConnTypeRegistry::supported(&caps),
            vec![ConnType::Mqtt, ConnType::Bt]
        );

        let mut set: ConnTypeSet = [ConnType::Bt, ConnType::Sms, ConnType::Mqtt]
            .into_iter()
            .collect();
        let removed = ConnTypeRegistry::remove_unsupported(&caps, &mut set);
        assert_eq!(removed, ConnTypeSet::single(ConnType::Sms));
        let again = ConnTypeRegistry::remove_unsupported(&caps, &mut set);
        assert!(again.is_empty());
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn display_string_skips_unselectable() {
        let set: ConnTypeSet = [ConnType::Nfc, ConnType::Bt, ConnType::Mqtt]
            .into_iter()
            .collect();
        assert_eq!(set.to_display_string(false), "MQTT,BT");
        assert_eq!(set.to_display_string(true), "Internet/MQTT + Bluetooth");
        assert_eq!(ConnTypeSet::new().to_display_string(true), "none");
    }
}
