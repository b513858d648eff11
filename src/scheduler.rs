//! Downlink scheduler / stateless auto-responder (spec §4.9, C10).
//!
//! Grounded in `devices_sessions.py` / `downlink_scheduler.py`: a second,
//! independent consumer of the uplink broadcast stream that serves
//! non-test-engine devices. Per spec §4.9/§9's "two divergent `EndDevice`
//! classes" note, this module keeps its own minimal session container
//! rather than reusing [`crate::session::EndDevice`] — the scheduler's
//! AppNonce bookkeeping is deliberately simpler (no dedup against a history,
//! matching the one canonical `accept_join` chosen for §4.4, but without the
//! test engine's snapshot-for-JoinAccept-timing machinery it doesn't need).

use std::collections::HashMap;

use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::KnownDevice;
use crate::crypto::{self, Direction};
use crate::lorawan::codec::{MacPayload, MType};
use crate::lorawan::mhdr;
use crate::region;
use crate::udp::{DownlinkSender, UplinkEvent};

/// A scheduler-owned session row, keyed by DevAddr once joined (spec §4.9:
/// "own persistent session store (key = DevEUI)" for pending joins, DevAddr
/// afterwards).
#[derive(Debug, Clone)]
pub struct DeviceSession {
    pub dev_eui: [u8; 8],
    pub app_key: [u8; 16],
    pub dev_addr: [u8; 4],
    pub app_s_key: [u8; 16],
    pub nwk_s_key: [u8; 16],
    pub last_join_accept: Vec<u8>,
    pub used_devnonces: Vec<[u8; 2]>,
    pub command: Vec<u8>,
}

/// Static registry of devices the scheduler will accept Join-Requests from,
/// plus the live session rows keyed by DevAddr once joined.
#[derive(Default)]
pub struct DeviceRegistry {
    known: HashMap<[u8; 8], KnownDevice>,
    sessions_by_devaddr: HashMap<[u8; 4], DeviceSession>,
}

impl DeviceRegistry {
    pub fn new(known_devices: &[KnownDevice]) -> DeviceRegistry {
        let mut known = HashMap::new();
        for device in known_devices {
            if let Ok(bytes) = hex::decode(&device.dev_eui) {
                if let Ok(eui) = <[u8; 8]>::try_from(bytes.as_slice()) {
                    known.insert(eui, device.clone());
                }
            }
        }
        DeviceRegistry { known, sessions_by_devaddr: HashMap::new() }
    }

    fn session_for_devaddr(&self, dev_addr: &[u8; 4]) -> Option<&DeviceSession> {
        self.sessions_by_devaddr.get(dev_addr)
    }
}

/// Out-of-band worker for devices the test engine isn't driving (spec
/// §4.9). Independent of [`crate::testengine::TestSessionCoordinator`]; the
/// two never share in-memory state.
pub struct DownlinkScheduler {
    registry: DeviceRegistry,
    downlink: DownlinkSender,
}

impl DownlinkScheduler {
    pub fn new(registry: DeviceRegistry, downlink: DownlinkSender) -> DownlinkScheduler {
        DownlinkScheduler { registry, downlink }
    }

    pub async fn run(mut self, mut uplinks: broadcast::Receiver<UplinkEvent>) {
        loop {
            match uplinks.recv().await {
                Ok(event) => self.handle_uplink(event).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("scheduler uplink broadcast lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("scheduler uplink channel closed, stopping");
                    break;
                }
            }
        }
    }

    async fn handle_uplink(&mut self, event: UplinkEvent) {
        let phy = match event.frame.parse_phypayload(false) {
            Ok(phy) => phy,
            Err(e) => {
                warn!("scheduler dropping malformed frame: {}", e);
                return;
            }
        };

        match phy.mtype {
            MType::JoinRequest => self.handle_join_request(&event, &phy).await,
            MType::UnconfirmedUp => self.handle_unconfirmed_up(&event, &phy).await,
            _ => {}
        }
    }

    async fn handle_join_request(&mut self, event: &UplinkEvent, phy: &crate::lorawan::codec::PhyPayload) {
        let MacPayload::JoinRequest { dev_eui, dev_nonce, .. } = &phy.mac_payload else { return };

        let Some(known) = self.registry.known.get(dev_eui).cloned() else {
            return; // unknown DevEUI: silently dropped (spec §4.9)
        };
        let Ok(app_key_bytes) = hex::decode(&known.app_key) else { return };
        let Ok(app_key) = <[u8; 16]>::try_from(app_key_bytes.as_slice()) else { return };

        if let Some(existing) = self.registry.sessions_by_devaddr.values().find(|s| &s.dev_eui == dev_eui) {
            if existing.used_devnonces.contains(dev_nonce) {
                return; // duplicate DevNonce: dropped
            }
        }

        let accepted = accept_join(*dev_eui, app_key, *dev_nonce);
        self.registry.sessions_by_devaddr.insert(accepted.dev_addr, accepted.clone());

        let delay = region::recommended::JOIN_ACCEPT_DELAY1;
        let frame = event.frame.create_reply(
            &accepted.last_join_accept,
            delay,
            None,
            Some(region::recommended::RX1_DEFAULT_OFFSET),
            None,
        );
        if let Err(e) = self.downlink.send_downlink(&frame).await {
            warn!("scheduler failed to send Join-Accept: {}", e);
        }
    }

    async fn handle_unconfirmed_up(&mut self, event: &UplinkEvent, phy: &crate::lorawan::codec::PhyPayload) {
        let MacPayload::Data { dev_addr, .. } = &phy.mac_payload else { return };
        let Some(session) = self.registry.session_for_devaddr(dev_addr).cloned() else { return };

        if !phy.mic_is_valid(&session.nwk_s_key) {
            warn!("scheduler dropping frame with invalid MIC for {:?}", hex::encode(dev_addr));
            return;
        }

        let downlink_phy = build_command_downlink(&session);
        let frame = event.frame.create_reply(
            &downlink_phy,
            region::recommended::RECEIVE_DELAY1,
            None,
            Some(region::recommended::RX1_DEFAULT_OFFSET),
            None,
        );
        if let Err(e) = self.downlink.send_downlink(&frame).await {
            warn!("scheduler failed to send command downlink: {}", e);
        }
    }
}

/// The scheduler's own Join-Accept construction (spec §4.9's variant of
/// §4.4's `accept_join`, kept independent per the §9 "two divergent
/// `EndDevice`" note — resolved here by sharing the crypto/region helpers
/// but not the test engine's session type or AppNonce replay history).
fn accept_join(dev_eui: [u8; 8], app_key: [u8; 16], dev_nonce: [u8; 2]) -> DeviceSession {
    use rand::Rng;
    let mut rng = rand::thread_rng();

    let appnonce: u32 = rng.gen_range(0..(1 << 24));
    let devaddr_int: u32 = rng.gen();
    let nwkid = (devaddr_int & 0xFE00_0000) >> 25;
    let netid_int = (rng.gen_range(0u32..(1 << 24)) & 0xFFFF80) | nwkid;

    let devaddr = devaddr_int.to_be_bytes();
    let netid = netid_int.to_be_bytes();
    let netid3 = [netid[1], netid[2], netid[3]];
    let appnonce_bytes = appnonce.to_le_bytes();
    let appnonce3 = [appnonce_bytes[0], appnonce_bytes[1], appnonce_bytes[2]];

    let mut skey_material = Vec::with_capacity(8);
    skey_material.extend_from_slice(&appnonce3);
    skey_material.extend(netid3.iter().rev());
    skey_material.extend(dev_nonce.iter().rev());

    let mut nwkskey_input = vec![0x01u8];
    nwkskey_input.extend_from_slice(&skey_material);
    nwkskey_input.extend_from_slice(&[0u8; 7]);
    let nwk_s_key: [u8; 16] = crypto::aes128_encrypt(&app_key, &nwkskey_input).try_into().unwrap();

    let mut appskey_input = vec![0x02u8];
    appskey_input.extend_from_slice(&skey_material);
    appskey_input.extend_from_slice(&[0u8; 7]);
    let app_s_key: [u8; 16] = crypto::aes128_encrypt(&app_key, &appskey_input).try_into().unwrap();

    let dlsettings = 0u8;
    let rxdelay = 1u8;
    let cflist = [0u8; 16];

    let mut macpayload = Vec::with_capacity(29);
    macpayload.extend_from_slice(&appnonce3);
    macpayload.extend(netid3.iter().rev());
    macpayload.extend(devaddr.iter().rev());
    macpayload.push(dlsettings);
    macpayload.push(rxdelay);
    macpayload.extend_from_slice(&cflist);

    let mut mhdr_macpayload = vec![mhdr::JOIN_ACCEPT];
    mhdr_macpayload.extend_from_slice(&macpayload);
    let mic = crypto::mic_join(&app_key, &mhdr_macpayload);

    let mut to_decrypt = macpayload.clone();
    to_decrypt.extend_from_slice(&mic);
    let decrypted = crypto::aes128_decrypt(&app_key, &to_decrypt);

    let mut last_join_accept = vec![mhdr::JOIN_ACCEPT];
    last_join_accept.extend_from_slice(&decrypted);

    DeviceSession {
        dev_eui,
        app_key,
        dev_addr: devaddr,
        app_s_key,
        nwk_s_key,
        last_join_accept,
        used_devnonces: vec![dev_nonce],
        command: vec![0xC0, 0xFF, 0xEE],
    }
}

/// Builds the canned command downlink (spec §4.9: "the device-specific
/// 'command' string from the registry"), FPort 1, UNCONFIRMED_DOWN.
fn build_command_downlink(session: &DeviceSession) -> Vec<u8> {
    let fcnt = 0u16;
    let cipher = crypto::encrypt_frmpayload(&session.app_s_key, &session.command, Direction::Down, &session.dev_addr, fcnt as u32);

    let mac_payload = MacPayload::Data {
        dev_addr: session.dev_addr,
        fctrl: crate::lorawan::codec::FCtrl::default(),
        fcnt,
        fopts: vec![],
        fport: Some(1),
        frm_payload: cipher,
    };
    let without_mic = crate::lorawan::codec::PhyPayload { mtype: MType::UnconfirmedDown, mac_payload, mic: [0; 4] };
    let mic = without_mic.calculate_mic(&session.nwk_s_key);
    let mut out = without_mic.encode_without_mic();
    out.extend_from_slice(&mic);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_join_derives_valid_mic_join_accept() {
        let app_key = [0x2bu8, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, 0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf, 0x4f, 0x3c];
        let session = accept_join([1, 2, 3, 4, 5, 6, 7, 8], app_key, [0xAA, 0xBB]);
        assert_eq!(session.last_join_accept[0], mhdr::JOIN_ACCEPT);
        assert_eq!(session.last_join_accept.len(), 1 + 3 + 3 + 4 + 1 + 1 + 16 + 4);
    }

    #[test]
    fn duplicate_devnonce_is_recorded() {
        let app_key = [0u8; 16];
        let session = accept_join([0; 8], app_key, [1, 1]);
        assert!(session.used_devnonces.contains(&[1, 1]));
    }

    #[test]
    fn command_downlink_has_valid_mic() {
        let app_key = [0u8; 16];
        let session = accept_join([0; 8], app_key, [2, 2]);
        let phy_bytes = build_command_downlink(&session);
        let parsed = crate::lorawan::codec::PhyPayload::parse(&phy_bytes, false).unwrap();
        assert!(parsed.mic_is_valid(&session.nwk_s_key));
    }

    #[test]
    fn unknown_devices_are_kept_out_of_the_registry() {
        let registry = DeviceRegistry::new(&[KnownDevice { dev_eui: "0102030405060708".into(), app_key: "00".repeat(16) }]);
        assert_eq!(registry.known.len(), 1);
        assert!(registry.session_for_devaddr(&[0, 0, 0, 0]).is_none());
    }
}
