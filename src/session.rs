//! Device session state machine (spec §4.4, C4).
//!
//! Grounded in `lorawan/sessions.py` (`ChannelStructure`, `LoRaMACParameters`,
//! `EndDevice`). The canonical Join-Accept construction and
//! `prepare_lorawan_data` builder live here; the downlink scheduler (C10,
//! `src/scheduler.rs`) reuses the same [`crate::crypto`]/[`crate::region`]
//! functions but keeps its own minimal session container, per SPEC_FULL.md
//! §10.6 and §11.

use std::time::Duration;

use rand::Rng;

use crate::crypto::{self, Direction};
use crate::error::SessionError;
use crate::lorawan::codec::{FCtrl, MacPayload, PhyPayload};
use crate::lorawan::mhdr;
use crate::region::{self, Channel, DataRate, NUM_CHANNELS};

/// Ordered 16-slot channel database (spec §3).
#[derive(Debug, Clone)]
pub struct ChannelStructure {
    slots: [Channel; NUM_CHANNELS],
}

impl ChannelStructure {
    pub fn new_eu868_default() -> ChannelStructure {
        ChannelStructure { slots: region::default_channels() }
    }

    pub fn used_frequencies(&self) -> Vec<f64> {
        self.slots.iter().filter(|c| c.freq_mhz != 0.0).map(|c| c.freq_mhz).collect()
    }

    /// Adds `freq` at `idx` if given, else the first free non-mandatory slot.
    /// Never overwrites a mandatory slot or a duplicate frequency.
    pub fn add_frequency(&mut self, freq: f64, idx: Option<usize>) -> bool {
        if self.used_frequencies().contains(&freq) {
            return false;
        }
        let target = match idx {
            Some(i) if i < NUM_CHANNELS && !self.slots[i].mandatory => Some(i),
            Some(_) => None,
            None => self.slots.iter().position(|c| !c.mandatory && c.freq_mhz == 0.0),
        };
        match target {
            Some(i) => {
                self.slots[i] = Channel {
                    freq_mhz: freq,
                    min_dr: region::min_dr_for(freq),
                    max_dr: region::max_dr_for(freq),
                    mandatory: false,
                };
                true
            }
            None => false,
        }
    }

    /// Zeroes the non-mandatory slot(s) matching `idx` and/or `freq`.
    /// Mandatory slots (0,1,2 in the default EU868 plan) are never touched
    /// (testable property 5).
    pub fn remove_frequency(&mut self, idx: Option<usize>, freq: Option<f64>) {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.mandatory {
                continue;
            }
            let idx_matches = idx == Some(i);
            let freq_matches = freq.is_some() && freq == Some(slot.freq_mhz) && slot.freq_mhz != 0.0;
            if idx_matches || freq_matches {
                *slot = Channel { freq_mhz: 0.0, min_dr: DataRate::Dr0, max_dr: DataRate::Dr0, mandatory: false };
            }
        }
    }

    pub fn slots(&self) -> &[Channel; NUM_CHANNELS] {
        &self.slots
    }
}

/// Per-DUT LoRaMAC parameter block (spec §3/§4.4).
#[derive(Debug, Clone)]
pub struct LoRaMacParameters {
    pub dev_addr: [u8; 4],
    pub app_s_key: [u8; 16],
    pub nwk_s_key: [u8; 16],
    pub default_dr: DataRate,
    pub rx1_dr_offset: u8,
    pub rx2_dr: DataRate,
    pub rx1_delay: Duration,
    pub rx2_delay: Duration,
    pub rx2_frequency: f64,
    pub joinaccept_delay1: Duration,
    pub joinaccept_delay2: Duration,
    pub channels: ChannelStructure,
}

impl LoRaMacParameters {
    pub fn defaults(dev_addr: [u8; 4], app_s_key: [u8; 16], nwk_s_key: [u8; 16]) -> LoRaMacParameters {
        LoRaMacParameters {
            dev_addr,
            app_s_key,
            nwk_s_key,
            default_dr: DataRate::Dr5,
            rx1_dr_offset: region::recommended::RX1_DEFAULT_OFFSET,
            rx2_dr: DataRate::Dr0,
            rx1_delay: region::recommended::RECEIVE_DELAY1,
            rx2_delay: region::recommended::RECEIVE_DELAY2,
            rx2_frequency: region::recommended::RX2_DEFAULT_FREQ_MHZ,
            joinaccept_delay1: region::recommended::JOIN_ACCEPT_DELAY1,
            joinaccept_delay2: region::recommended::JOIN_ACCEPT_DELAY2,
            channels: ChannelStructure::new_eu868_default(),
        }
    }

    /// `rx1_delay` setter counterpart: rx2_delay is always derived as
    /// `rx1_delay + 1s` (spec §3).
    pub fn set_rx1_delay(&mut self, delay: Duration) {
        self.rx1_delay = delay;
        self.rx2_delay = delay + Duration::from_secs(1);
    }
}

/// `dlSettings` byte: bits 6..4 = RX1DROffset, bits 3..0 = RX2 DataRate.
fn dlsettings_byte(rx1_dr_offset: u8, rx2_dr: DataRate) -> u8 {
    ((rx1_dr_offset.min(region::recommended::MAX_RX1_DR_OFFSET) & 0x07) << 4) | (rx2_dr.index() & 0x0F)
}

/// `rxDelay` byte: low nibble = seconds, clamped to >= 1 by the receiver.
fn rxdelay_byte(seconds: u8) -> u8 {
    seconds & 0x0F
}

/// The DUT being certified: identity, MAC parameter block, frame counters,
/// and nonce bookkeeping (spec §3/§4.4).
#[derive(Debug, Clone)]
pub struct EndDevice {
    pub dev_eui: [u8; 8],
    pub app_key: [u8; 16],
    pub loramac_params: LoRaMacParameters,
    /// Snapshot taken just before the last `accept_join`; Join-Accept itself
    /// must be sent at the *old* RX1 offset / RX2 DR (spec §4.2 step 8 /
    /// §4.6 JoinRequestHandlerStep).
    pub loramac_previous_session: LoRaMacParameters,
    pub fcnt_up: u16,
    pub fcnt_down: u16,
    pub message_to_ack: bool,
    used_otaa_devnonces: Vec<[u8; 2]>,
    used_otaa_appnonces: Vec<u32>,
}

impl EndDevice {
    pub fn new(dev_eui: [u8; 8], dev_addr: [u8; 4], app_key: [u8; 16], app_s_key: [u8; 16], nwk_s_key: [u8; 16]) -> EndDevice {
        let params = LoRaMacParameters::defaults(dev_addr, app_s_key, nwk_s_key);
        EndDevice {
            dev_eui,
            app_key,
            loramac_previous_session: params.clone(),
            loramac_params: params,
            fcnt_up: 0,
            fcnt_down: 0,
            message_to_ack: false,
            used_otaa_devnonces: Vec::new(),
            used_otaa_appnonces: Vec::new(),
        }
    }

    pub fn add_frequency(&mut self, freq: f64) -> bool {
        self.loramac_params.channels.add_frequency(freq, None)
    }

    pub fn remove_frequency(&mut self, idx: usize) {
        self.loramac_params.channels.remove_frequency(Some(idx), None);
    }

    fn create_appnonce(&mut self) -> u32 {
        let mut rng = rand::thread_rng();
        loop {
            let nonce: u32 = rng.gen_range(0..(1 << 24));
            if !self.used_otaa_appnonces.contains(&nonce) {
                self.used_otaa_appnonces.push(nonce);
                return nonce;
            }
        }
    }

    /// Implements spec §4.2's Join-Accept construction end to end. Returns
    /// the on-air PHYPayload bytes. Raises `SessionError::DevNonceReplay`
    /// without mutating any session state (testable property 4) if
    /// `devnonce` was seen before.
    pub fn accept_join(
        &mut self,
        devnonce: [u8; 2],
        dlsettings: u8,
        rxdelay_seconds: u8,
        cflist: [u8; 16],
    ) -> Result<Vec<u8>, SessionError> {
        if self.used_otaa_devnonces.contains(&devnonce) {
            return Err(SessionError::DevNonceReplay(u16::from_be_bytes(devnonce)));
        }

        let appnonce = self.create_appnonce();
        let mut rng = rand::thread_rng();
        let devaddr_int: u32 = rng.gen();
        let nwkid = (devaddr_int & 0xFE00_0000) >> 25;
        let netid_int = (rng.gen_range(0u32..(1 << 24)) & 0xFFFF80) | nwkid;

        let devaddr = devaddr_int.to_be_bytes();
        let netid = netid_int.to_be_bytes();
        let netid3 = [netid[1], netid[2], netid[3]];
        let appnonce3 = appnonce.to_le_bytes();
        let appnonce3 = [appnonce3[0], appnonce3[1], appnonce3[2]];

        let mut skey_material = Vec::with_capacity(8);
        skey_material.extend_from_slice(&appnonce3);
        skey_material.extend(netid3.iter().rev());
        skey_material.extend(devnonce.iter().rev());

        let mut nwkskey_input = vec![0x01u8];
        nwkskey_input.extend_from_slice(&skey_material);
        nwkskey_input.extend_from_slice(&[0u8; 7]);
        let nwk_s_key: [u8; 16] = crypto::aes128_encrypt(&self.app_key, &nwkskey_input).try_into().unwrap();

        let mut appskey_input = vec![0x02u8];
        appskey_input.extend_from_slice(&skey_material);
        appskey_input.extend_from_slice(&[0u8; 7]);
        let app_s_key: [u8; 16] = crypto::aes128_encrypt(&self.app_key, &appskey_input).try_into().unwrap();

        self.used_otaa_devnonces.push(devnonce);

        let mut macpayload = Vec::with_capacity(29);
        macpayload.extend_from_slice(&appnonce3);
        macpayload.extend(netid3.iter().rev());
        macpayload.extend(devaddr.iter().rev());
        macpayload.push(dlsettings);
        macpayload.push(rxdelay_byte(rxdelay_seconds));
        macpayload.extend_from_slice(&cflist);

        let mut mhdr_macpayload = vec![mhdr::JOIN_ACCEPT];
        mhdr_macpayload.extend_from_slice(&macpayload);
        let mic = crypto::mic_join(&self.app_key, &mhdr_macpayload);

        let mut to_decrypt = macpayload.clone();
        to_decrypt.extend_from_slice(&mic);
        let decrypted = crypto::aes128_decrypt(&self.app_key, &to_decrypt);

        let mut join_accept_phypayload = vec![mhdr::JOIN_ACCEPT];
        join_accept_phypayload.extend_from_slice(&decrypted);

        // Snapshot before mutating; Join-Accept is sent at the *old* params.
        self.loramac_previous_session = self.loramac_params.clone();

        self.loramac_params.dev_addr = devaddr;
        self.loramac_params.app_s_key = app_s_key;
        self.loramac_params.nwk_s_key = nwk_s_key;
        self.fcnt_up = 0;
        self.fcnt_down = 0;

        self.loramac_params.rx1_dr_offset = (dlsettings & 0x70) >> 4;
        self.loramac_params.rx2_dr = DataRate::from_index(dlsettings & 0x0F);
        let seconds = (rxdelay_seconds & 0x0F).max(1);
        self.loramac_params.set_rx1_delay(Duration::from_secs(seconds as u64));

        for freq in region::decode_cflist(&cflist) {
            self.loramac_params.channels.add_frequency(freq, None);
        }

        Ok(join_accept_phypayload)
    }

    /// Builds a Data PHYPayload to send to the DUT (spec §4.4 step list).
    #[allow(clippy::too_many_arguments)]
    pub fn prepare_lorawan_data(
        &mut self,
        frmpayload: Option<&[u8]>,
        fport: Option<u8>,
        mhdr_byte: u8,
        mut fctrl: FCtrl,
        fopts: Vec<u8>,
        force_fcntdown: Option<u16>,
    ) -> Vec<u8> {
        let fcnt = match force_fcntdown {
            Some(forced) => forced,
            None => {
                let current = self.fcnt_down;
                self.fcnt_down = self.fcnt_down.wrapping_add(1);
                current
            }
        };

        let is_downlink_data = matches!(
            mhdr_byte,
            v if v == mhdr::UNCONFIRMED_DOWN || v == mhdr::CONFIRMED_DOWN
        );
        if self.message_to_ack && is_downlink_data {
            fctrl.ack = true;
        }

        let direction = if matches!(mhdr_byte, v if v == mhdr::JOIN_REQUEST || v == mhdr::UNCONFIRMED_UP || v == mhdr::CONFIRMED_UP) {
            Direction::Up
        } else {
            Direction::Down
        };

        fctrl.foptslen = fopts.len() as u8;
        let mac_payload = match (fport, frmpayload) {
            (Some(port), Some(payload)) => {
                let key = if port == 0 { &self.loramac_params.nwk_s_key } else { &self.loramac_params.app_s_key };
                let cipher = crypto::encrypt_frmpayload(key, payload, direction, &self.loramac_params.dev_addr, fcnt as u32);
                MacPayload::Data {
                    dev_addr: self.loramac_params.dev_addr,
                    fctrl,
                    fcnt,
                    fopts,
                    fport: Some(port),
                    frm_payload: cipher,
                }
            }
            _ => MacPayload::Data {
                dev_addr: self.loramac_params.dev_addr,
                fctrl,
                fcnt,
                fopts,
                fport: None,
                frm_payload: Vec::new(),
            },
        };

        let mtype = crate::lorawan::MType::from_index((mhdr_byte & 0xE0) >> 5).expect("valid mhdr byte");
        let without_mic = PhyPayload { mtype, mac_payload, mic: [0; 4] };
        // Invariant (spec §4.4): the MIC is always computed with NwkSKey,
        // regardless of which key ciphered the FRMPayload.
        let mic = without_mic.calculate_mic(&self.loramac_params.nwk_s_key);
        let mut out = without_mic.encode_without_mic();
        out.extend_from_slice(&mic);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_device() -> EndDevice {
        EndDevice::new(
            [1, 2, 3, 4, 5, 6, 7, 8],
            [0x01, 0x28, 0x29, 0x9F],
            [0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, 0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf, 0x4f, 0x3c],
            [0; 16],
            [0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, 0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf, 0x4f, 0x3c],
        )
    }

    #[test]
    fn devnonce_replay_is_rejected_without_mutating_state() {
        let mut device = fresh_device();
        let nonce = [0xAA, 0xBB];
        device.accept_join(nonce, 0, 1, [0; 16]).expect("first join succeeds");
        let appnonces_after_first = device.used_otaa_appnonces.len();
        let devaddr_after_first = device.loramac_params.dev_addr;

        let err = device.accept_join(nonce, 0, 1, [0; 16]).unwrap_err();
        assert!(matches!(err, SessionError::DevNonceReplay(_)));
        assert_eq!(device.used_otaa_appnonces.len(), appnonces_after_first);
        assert_eq!(device.loramac_params.dev_addr, devaddr_after_first);
    }

    #[test]
    fn mandatory_channels_cannot_be_removed() {
        let mut device = fresh_device();
        let before = device.loramac_params.channels.slots().clone();
        device.remove_frequency(0);
        device.remove_frequency(1);
        device.remove_frequency(2);
        assert_eq!(device.loramac_params.channels.slots(), &before);
    }

    #[test]
    fn fcnt_down_wraps_at_2_16() {
        let mut device = fresh_device();
        device.fcnt_down = u16::MAX;
        let _ = device.prepare_lorawan_data(None, None, mhdr::UNCONFIRMED_DOWN, FCtrl::default(), vec![], None);
        assert_eq!(device.fcnt_down, 0);
    }

    #[test]
    fn mic_self_consistency() {
        let mut device = fresh_device();
        let phy = device.prepare_lorawan_data(
            Some(&[1, 2, 3]),
            Some(1),
            mhdr::UNCONFIRMED_DOWN,
            FCtrl::default(),
            vec![],
            None,
        );
        let parsed = PhyPayload::parse(&phy, false).unwrap();
        assert!(parsed.mic_is_valid(&device.loramac_params.nwk_s_key));
    }

    #[test]
    fn accept_join_uses_previous_params_snapshot() {
        let mut device = fresh_device();
        device.loramac_params.rx1_dr_offset = 2;
        let dlsettings = dlsettings_byte(3, DataRate::Dr1);
        device.accept_join([0x01, 0x02], dlsettings, 1, [0; 16]).unwrap();
        assert_eq!(device.loramac_previous_session.rx1_dr_offset, 2);
        assert_eq!(device.loramac_params.rx1_dr_offset, 3);
    }
}
