//! Peer address records
//!
//! An `AddrRecord` says how to reach one peer: which transports are active
//! and, per transport, the parameters needed to use it. Parameters for a
//! transport only mean something while that transport is in the active set;
//! removing a type leaves its parameters in place.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::conn_type::{ConnType, ConnTypeRegistry, ConnTypeSet, DeviceCaps};
use crate::errors::Result;
use crate::stream::{version, InStream, OutStream};
use crate::types::MqttDevId;

// ----------------------------------------------------------------------------
// Per-Transport Parameters
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayParams {
    /// Room name; empty until an invite has been accepted
    pub invite: String,
    pub host: String,
    pub ip_addr: u32,
    pub port: u16,
    pub seeks_public_room: bool,
    pub advertise_room: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtParams {
    pub host_name: String,
    pub bt_addr: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmsParams {
    pub phone: String,
    pub port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct P2pParams {
    pub mac_addr: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttParams {
    pub dev_id: MqttDevId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpDirectParams {
    pub host_name: String,
    pub ip_addr: u32,
    pub port: u16,
}

/// Supplies this device's own parameters for each transport
pub trait LocalAddrProvider {
    fn relay(&self) -> RelayParams {
        RelayParams::default()
    }
    fn bt(&self) -> BtParams {
        BtParams::default()
    }
    fn sms(&self) -> SmsParams {
        SmsParams::default()
    }
    fn p2p(&self) -> P2pParams {
        P2pParams::default()
    }
    fn mqtt(&self) -> MqttParams {
        MqttParams::default()
    }
    fn ip_direct(&self) -> IpDirectParams {
        IpDirectParams::default()
    }
}

// ----------------------------------------------------------------------------
// Address Record
// ----------------------------------------------------------------------------

/// One peer's reachability descriptor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddrRecord {
    types: ConnTypeSet,
    pub relay: RelayParams,
    pub bt: BtParams,
    pub sms: SmsParams,
    pub p2p: P2pParams,
    pub mqtt: MqttParams,
    pub ip_direct: IpDirectParams,
}

impl AddrRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// This device's own address for the given types
    pub fn self_addr(
        types: &ConnTypeSet,
        caps: &dyn DeviceCaps,
        provider: &dyn LocalAddrProvider,
    ) -> Self {
        let mut addr = Self::new();
        addr.populate(types, caps, provider);
        addr
    }

    pub fn with_mqtt(dev_id: MqttDevId) -> Self {
        let mut addr = Self::new();
        addr.types.add(ConnType::Mqtt);
        addr.mqtt.dev_id = dev_id;
        addr
    }

    pub fn with_relay(host: &str, port: u16, invite: &str) -> Self {
        let mut addr = Self::new();
        addr.types.add(ConnType::Relay);
        addr.relay.host = host.to_string();
        addr.relay.port = port;
        addr.relay.invite = invite.to_string();
        addr
    }

    pub fn with_bt(host_name: &str, bt_addr: &str) -> Self {
        let mut addr = Self::new();
        addr.types.add(ConnType::Bt);
        addr.bt.host_name = host_name.to_string();
        addr.bt.bt_addr = bt_addr.to_string();
        addr
    }

    pub fn with_sms(phone: &str, port: u16) -> Self {
        let mut addr = Self::new();
        addr.types.add(ConnType::Sms);
        addr.sms.phone = phone.to_string();
        addr.sms.port = port;
        addr
    }

    pub fn types(&self) -> &ConnTypeSet {
        &self.types
    }

    pub fn contains(&self, conn_type: ConnType) -> bool {
        self.types.contains(conn_type)
    }

    /// Add a type without touching its parameters. NONE is ignored.
    pub fn add_type(&mut self, conn_type: ConnType) -> bool {
        self.types.add(conn_type)
    }

    /// Drop a type from the active set. Stored parameters are kept.
    pub fn remove(&mut self, conn_type: ConnType) -> bool {
        self.types.remove(conn_type)
    }

    /// Prune types the device can no longer use
    pub fn remove_unsupported(&mut self, caps: &dyn DeviceCaps) -> ConnTypeSet {
        ConnTypeRegistry::remove_unsupported(caps, &mut self.types)
    }

    /// Add each supported type from `new_types` that isn't already present,
    /// filling its parameters from the local provider. Returns the types added.
    pub fn populate(
        &mut self,
        new_types: &ConnTypeSet,
        caps: &dyn DeviceCaps,
        provider: &dyn LocalAddrProvider,
    ) -> ConnTypeSet {
        let supported = ConnTypeRegistry::supported(caps);
        let mut added = ConnTypeSet::new();
        for conn_type in new_types.display_types() {
            if self.types.contains(conn_type) || !supported.contains(&conn_type) {
                continue;
            }
            self.set_defaults(conn_type, provider);
            self.types.add(conn_type);
            added.add(conn_type);
        }
        if !added.is_empty() {
            debug!(added = %added, "populated address");
        }
        added
    }

    fn set_defaults(&mut self, conn_type: ConnType, provider: &dyn LocalAddrProvider) {
        match conn_type {
            ConnType::Relay => self.relay = provider.relay(),
            ConnType::Bt => self.bt = provider.bt(),
            ConnType::Sms => self.sms = provider.sms(),
            ConnType::P2p => self.p2p = provider.p2p(),
            ConnType::Mqtt => self.mqtt = provider.mqtt(),
            ConnType::IpDirect => self.ip_direct = provider.ip_direct(),
            ConnType::None | ConnType::Ir | ConnType::Nfc => {}
        }
    }

    /// Whether enough is known to actually send on `conn_type`
    pub fn is_complete(&self, conn_type: ConnType) -> bool {
        if !self.contains(conn_type) {
            return false;
        }
        match conn_type {
            ConnType::Relay => !self.relay.host.is_empty(),
            ConnType::Bt => !self.bt.bt_addr.is_empty() || !self.bt.host_name.is_empty(),
            ConnType::Sms => !self.sms.phone.is_empty(),
            ConnType::P2p => !self.p2p.mac_addr.is_empty(),
            ConnType::Mqtt => self.mqtt.dev_id.is_set(),
            ConnType::IpDirect => !self.ip_direct.host_name.is_empty(),
            ConnType::Ir | ConnType::Nfc => true,
            ConnType::None => false,
        }
    }

    /// Whether moving from `self` to `other` needs the peer told or the
    /// session restarted
    pub fn changes_matter(&self, other: &AddrRecord) -> bool {
        if self.types != other.types {
            return true;
        }
        self.types.iter().any(|conn_type| {
            let matters = match conn_type {
                ConnType::Relay => {
                    self.relay.invite.is_empty()
                        || self.relay.invite != other.relay.invite
                        || self.relay.host != other.relay.host
                        || self.relay.port != other.relay.port
                }
                ConnType::Mqtt => self.mqtt.dev_id != other.mqtt.dev_id,
                ConnType::Bt => self.bt.bt_addr != other.bt.bt_addr,
                ConnType::Sms => {
                    self.sms.phone != other.sms.phone || self.sms.port != other.sms.port
                }
                ConnType::P2p => self.p2p.mac_addr != other.p2p.mac_addr,
                ConnType::IpDirect => {
                    self.ip_direct.host_name != other.ip_direct.host_name
                        || self.ip_direct.port != other.ip_direct.port
                }
                ConnType::Ir | ConnType::Nfc | ConnType::None => false,
            };
            if matters {
                debug!(conn_type = %conn_type, "address change matters");
            }
            matters
        })
    }

    /// Merge what `newer` knows into this record. Values from an older
    /// source only fill in fields that are still empty. Returns true if
    /// anything changed.
    pub fn augment(&mut self, newer: &AddrRecord, is_newer: bool) -> bool {
        let before = self.clone();
        for conn_type in newer.types.iter() {
            if self.types.add(conn_type) {
                self.copy_params(conn_type, newer);
                continue;
            }
            match conn_type {
                ConnType::Relay => {
                    merge_str(&mut self.relay.invite, &newer.relay.invite, is_newer);
                    merge_str(&mut self.relay.host, &newer.relay.host, is_newer);
                    merge_num(&mut self.relay.ip_addr, newer.relay.ip_addr, is_newer);
                    merge_num(&mut self.relay.port, newer.relay.port, is_newer);
                    if is_newer {
                        self.relay.seeks_public_room = newer.relay.seeks_public_room;
                        self.relay.advertise_room = newer.relay.advertise_room;
                    }
                }
                ConnType::Bt => {
                    merge_str(&mut self.bt.host_name, &newer.bt.host_name, is_newer);
                    merge_str(&mut self.bt.bt_addr, &newer.bt.bt_addr, is_newer);
                }
                ConnType::Sms => {
                    merge_str(&mut self.sms.phone, &newer.sms.phone, is_newer);
                    merge_num(&mut self.sms.port, newer.sms.port, is_newer);
                }
                ConnType::P2p => {
                    merge_str(&mut self.p2p.mac_addr, &newer.p2p.mac_addr, is_newer);
                }
                ConnType::Mqtt => {
                    if newer.mqtt.dev_id.is_set() && (is_newer || !self.mqtt.dev_id.is_set()) {
                        self.mqtt.dev_id = newer.mqtt.dev_id;
                    }
                }
                ConnType::IpDirect => {
                    merge_str(
                        &mut self.ip_direct.host_name,
                        &newer.ip_direct.host_name,
                        is_newer,
                    );
                    merge_num(&mut self.ip_direct.ip_addr, newer.ip_direct.ip_addr, is_newer);
                    merge_num(&mut self.ip_direct.port, newer.ip_direct.port, is_newer);
                }
                ConnType::Ir | ConnType::Nfc | ConnType::None => {}
            }
        }
        let changed = before != *self;
        trace!(changed, is_newer, "augmented address");
        changed
    }

    fn copy_params(&mut self, conn_type: ConnType, from: &AddrRecord) {
        match conn_type {
            ConnType::Relay => self.relay = from.relay.clone(),
            ConnType::Bt => self.bt = from.bt.clone(),
            ConnType::Sms => self.sms = from.sms.clone(),
            ConnType::P2p => self.p2p = from.p2p.clone(),
            ConnType::Mqtt => self.mqtt = from.mqtt.clone(),
            ConnType::IpDirect => self.ip_direct = from.ip_direct.clone(),
            ConnType::Ir | ConnType::Nfc | ConnType::None => {}
        }
    }

    // ------------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------------

    pub fn write_to(&self, out: &mut OutStream) -> Result<()> {
        if out.version() < version::MULTI_ADDR {
            // Old layout holds one ordinal; keep the first active type
            let first = self.types.iter().next().unwrap_or(ConnType::None);
            out.put_u8(first.ordinal());
        } else {
            out.put_u8(self.types.raw_bits());
        }

        for conn_type in self.types.iter() {
            match conn_type {
                ConnType::Bt => {
                    out.put_string(&self.bt.host_name)?;
                    out.put_string(&self.bt.bt_addr)?;
                }
                ConnType::IpDirect => {
                    out.put_string(&self.ip_direct.host_name)?;
                    out.put_u32(self.ip_direct.ip_addr);
                    out.put_u16(self.ip_direct.port);
                }
                ConnType::Relay => {
                    out.put_string(&self.relay.invite)?;
                    out.put_string(&self.relay.host)?;
                    out.put_u32(self.relay.ip_addr);
                    out.put_u16(self.relay.port);
                    out.put_bool(self.relay.seeks_public_room);
                    out.put_bool(self.relay.advertise_room);
                }
                ConnType::Sms => {
                    out.put_string(&self.sms.phone)?;
                    out.put_u16(self.sms.port);
                }
                ConnType::P2p => {
                    out.put_string(&self.p2p.mac_addr)?;
                }
                ConnType::Mqtt => {
                    out.put_raw(&self.mqtt.dev_id.to_be_bytes());
                }
                ConnType::Ir | ConnType::Nfc | ConnType::None => {}
            }
            if out.version() < version::MULTI_ADDR {
                break;
            }
        }
        Ok(())
    }

    pub fn read_from(input: &mut InStream<'_>) -> Result<Self> {
        let raw = input.get_u8()?;
        let types = if input.version() < version::MULTI_ADDR {
            ConnTypeSet::from_bits(raw as u32)
        } else {
            ConnTypeSet::from_raw_bits(raw)
        };

        let mut addr = AddrRecord {
            types,
            ..Default::default()
        };
        for conn_type in types.iter() {
            match conn_type {
                ConnType::Bt => {
                    addr.bt.host_name = input.get_string()?;
                    addr.bt.bt_addr = input.get_string()?;
                }
                ConnType::IpDirect => {
                    addr.ip_direct.host_name = input.get_string()?;
                    addr.ip_direct.ip_addr = input.get_u32()?;
                    addr.ip_direct.port = input.get_u16()?;
                }
                ConnType::Relay => {
                    addr.relay.invite = input.get_string()?;
                    addr.relay.host = input.get_string()?;
                    addr.relay.ip_addr = input.get_u32()?;
                    addr.relay.port = input.get_u16()?;
                    addr.relay.seeks_public_room = input.get_bool()?;
                    addr.relay.advertise_room = input.get_bool()?;
                }
                ConnType::Sms => {
                    addr.sms.phone = input.get_string()?;
                    addr.sms.port = input.get_u16()?;
                }
                ConnType::P2p => {
                    addr.p2p.mac_addr = input.get_string()?;
                }
                ConnType::Mqtt => {
                    addr.mqtt.dev_id = MqttDevId::new(input.get_u64()?);
                }
                ConnType::Ir | ConnType::Nfc | ConnType::None => {}
            }
        }
        Ok(addr)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = OutStream::new();
        self.write_to(&mut out)?;
        Ok(out.into_bytes())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::read_from(&mut InStream::new(bytes))
    }
}

fn merge_str(mine: &mut String, theirs: &str, is_newer: bool) {
    if !theirs.is_empty() && (is_newer || mine.is_empty()) {
        *mine = theirs.to_string();
    }
}

fn merge_num<N: Copy + Default + PartialEq>(mine: &mut N, theirs: N, is_newer: bool) {
    if theirs != N::default() && (is_newer || *mine == N::default()) {
        *mine = theirs;
    }
}

/// Records are equal when they list the same types and agree on the
/// parameters of every active type. Stale parameters are ignored.
impl PartialEq for AddrRecord {
    fn eq(&self, other: &Self) -> bool {
        self.types == other.types
            && self.types.iter().all(|conn_type| match conn_type {
                ConnType::Relay => self.relay == other.relay,
                ConnType::Bt => self.bt == other.bt,
                ConnType::Sms => self.sms == other.sms,
                ConnType::P2p => self.p2p == other.p2p,
                ConnType::Mqtt => self.mqtt == other.mqtt,
                ConnType::IpDirect => self.ip_direct == other.ip_direct,
                ConnType::Ir | ConnType::Nfc | ConnType::None => true,
            })
    }
}

impl Eq for AddrRecord {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn_type::StaticDeviceCaps;

    struct Local;

    impl LocalAddrProvider for Local {
        fn mqtt(&self) -> MqttParams {
            MqttParams {
                dev_id: MqttDevId::new(0xFEED),
            }
        }
        fn bt(&self) -> BtParams {
            BtParams {
                host_name: "pixel".into(),
                bt_addr: "AA:BB".into(),
            }
        }
    }

    fn relay_mqtt() -> AddrRecord {
        let mut addr = AddrRecord::with_relay("relay.example.org", 10997, "room-7");
        addr.relay.seeks_public_room = true;
        addr.add_type(ConnType::Mqtt);
        addr.mqtt.dev_id = MqttDevId::new(0x0123_4567_89AB_CDEF);
        addr
    }

    #[test]
    fn relay_and_mqtt_round_trip() {
        let addr = relay_mqtt();
        let bytes = addr.to_bytes().unwrap();
        assert_eq!(AddrRecord::from_bytes(&bytes).unwrap(), addr);
        // Type byte first: RELAY bit 2, MQTT bit 7
        assert_eq!(bytes[0], 0x84);
    }

    #[test]
    fn legacy_stream_reads_single_ordinal() {
        let mut out = OutStream::with_version(version::SINGLE_ADDR_TYPE);
        AddrRecord::with_sms("555-1212", 3344).write_to(&mut out).unwrap();
        assert_eq!(out.as_bytes()[0], ConnType::Sms.ordinal());

        let bytes = out.into_bytes();
        let mut input = InStream::with_version(&bytes, version::SINGLE_ADDR_TYPE);
        let addr = AddrRecord::read_from(&mut input).unwrap();
        assert_eq!(addr, AddrRecord::with_sms("555-1212", 3344));
    }

    #[test]
    fn populate_skips_present_and_unsupported() {
        let caps = StaticDeviceCaps {
            bt: true,
            mqtt: true,
            ..Default::default()
        };
        let mut addr = AddrRecord::with_mqtt(MqttDevId::new(0x42));
        let wanted: ConnTypeSet = [ConnType::Mqtt, ConnType::Bt, ConnType::Sms, ConnType::None]
            .into_iter()
            .collect();
        let added = addr.populate(&wanted, &caps, &Local);

        assert_eq!(added, ConnTypeSet::single(ConnType::Bt));
        assert_eq!(addr.mqtt.dev_id, MqttDevId::new(0x42));
        assert_eq!(addr.bt.bt_addr, "AA:BB");
        assert!(!addr.contains(ConnType::Sms));
    }

    #[test]
    fn remove_keeps_params() {
        let mut addr = relay_mqtt();
        addr.remove(ConnType::Mqtt);
        assert!(!addr.contains(ConnType::Mqtt));
        assert!(addr.mqtt.dev_id.is_set());
    }

    #[test]
    fn changes_matter_for_every_parameterised_type() {
        let base = relay_mqtt();
        assert!(!base.changes_matter(&base.clone()));

        let mut moved = base.clone();
        moved.relay.port += 1;
        assert!(base.changes_matter(&moved));

        let mut new_dev = base.clone();
        new_dev.mqtt.dev_id = MqttDevId::new(7);
        assert!(base.changes_matter(&new_dev));

        let bt = AddrRecord::with_bt("a", "11:22");
        assert!(bt.changes_matter(&AddrRecord::with_bt("a", "33:44")));
        // Host name alone isn't protocol-significant
        assert!(!bt.changes_matter(&AddrRecord::with_bt("b", "11:22")));

        let sms = AddrRecord::with_sms("1", 1);
        assert!(sms.changes_matter(&AddrRecord::with_sms("2", 1)));

        let mut p2p = AddrRecord::new();
        p2p.add_type(ConnType::P2p);
        p2p.p2p.mac_addr = "02:00:00:00:00:01".into();
        let mut new_mac = p2p.clone();
        new_mac.p2p.mac_addr = "02:00:00:00:00:02".into();
        assert!(p2p.changes_matter(&new_mac));

        let mut direct = AddrRecord::new();
        direct.add_type(ConnType::IpDirect);
        direct.ip_direct.host_name = "10.0.0.5".into();
        direct.ip_direct.port = 4000;
        let mut new_host = direct.clone();
        new_host.ip_direct.host_name = "10.0.0.6".into();
        assert!(direct.changes_matter(&new_host));
        let mut new_port = direct.clone();
        new_port.ip_direct.port = 4001;
        assert!(direct.changes_matter(&new_port));
        // The resolved address isn't compared
        let mut resolved = direct.clone();
        resolved.ip_direct.ip_addr = 0x0A00_0005;
        assert!(!direct.changes_matter(&resolved));

        let mut fewer = base.clone();
        fewer.remove(ConnType::Relay);
        assert!(base.changes_matter(&fewer));
    }

    #[test]
    fn unset_room_always_matters() {
        let addr = AddrRecord::with_relay("h", 1, "");
        assert!(addr.changes_matter(&addr.clone()));
    }

    #[test]
    fn augment_prefers_newer_but_fills_gaps_from_older() {
        let mut addr = AddrRecord::with_sms("111", 0);
        let other = AddrRecord::with_sms("222", 9000);

        assert!(addr.augment(&other, false));
        assert_eq!(addr.sms.phone, "111");
        assert_eq!(addr.sms.port, 9000);

        assert!(addr.augment(&other, true));
        assert_eq!(addr.sms.phone, "222");
        assert!(!addr.augment(&other, true));

        assert!(addr.augment(&AddrRecord::with_mqtt(MqttDevId::new(5)), false));
        assert!(addr.contains(ConnType::Mqtt));
        assert_eq!(addr.mqtt.dev_id, MqttDevId::new(5));
    }
}
