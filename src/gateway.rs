//! Gateway-frame envelope (spec §5, C5).
//!
//! Grounded in `lorawan/parsing/flora_messages.py`'s `GatewayMessage`: a
//! received `rxpk` envelope plus the helpers to build the matching `txpk`
//! reply, decode the carried PHYPayload, and render an application-layer
//! JSON view of a decrypted frame. Unlike the original, this type is an
//! immutable value (spec §9's "materialize once" redesign) rather than a
//! mutable object whose property setters null a cached parse.

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::ConformanceError;
use crate::lorawan::codec::PhyPayload;
use crate::region::DataRate;

/// One received uplink frame, as handed up from the UDP bridge (C10/`udp`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RxFrame {
    /// Gateway internal timestamp, microseconds, used to schedule RX1/RX2.
    pub tmst: u32,
    /// Center frequency, MHz.
    pub freq: f64,
    /// Channel number on the gateway concentrator.
    pub chan: u32,
    /// Modulation, always "LORA" for this tool.
    pub modu: String,
    /// Spreading-factor/bandwidth label, e.g. "SF7BW125".
    pub datr: String,
    /// Coding rate, e.g. "4/5".
    pub codr: String,
    /// Raw PHYPayload bytes (already base64-decoded by the bridge).
    pub data: Vec<u8>,
    pub size: u32,
}

impl RxFrame {
    pub fn parse_phypayload(&self, ignore_errors: bool) -> Result<PhyPayload, ConformanceError> {
        PhyPayload::parse(&self.data, ignore_errors)
    }

    /// Builds the matching downlink reply. Exactly one of `data_rate` or
    /// `datr_offset` must be given: a fresh data rate (RX2, which uses a
    /// fixed DR independent of the uplink) or an offset from the uplink's
    /// own data rate (RX1). Mirrors `create_nwk_response_str`'s contract.
    pub fn create_reply(
        &self,
        phypayload: &[u8],
        delay: std::time::Duration,
        data_rate: Option<DataRate>,
        datr_offset: Option<u8>,
        frequency: Option<f64>,
    ) -> TxFrame {
        assert!(
            data_rate.is_some() ^ datr_offset.is_some(),
            "create_reply needs exactly one of data_rate or datr_offset"
        );
        let dr = match (data_rate, datr_offset) {
            (Some(dr), None) => dr,
            (None, Some(offset)) => {
                let uplink_dr = DataRate::from_label(&self.datr).unwrap_or(DataRate::Dr0);
                crate::region::rx1_dr_offset(uplink_dr, offset)
            }
            _ => unreachable!("checked by the assert above"),
        };
        TxFrame {
            tmst: self.tmst.wrapping_add(delay.as_micros() as u32),
            freq: frequency.unwrap_or(self.freq),
            modu: self.modu.clone(),
            datr: dr.label().to_string(),
            codr: self.codr.clone(),
            data: phypayload.to_vec(),
            ipol: true,
            powe: 14,
        }
    }

    /// Flat application-layer view of a decrypted Data frame (mirrors
    /// `create_appmessage_str`): `{dev_addr, fcnt, dir, fport, frm_payload}`.
    pub fn decode_application_message(&self, app_s_key: &[u8; 16]) -> Result<AppMessage, ConformanceError> {
        let phy = self.parse_phypayload(false)?;
        match &phy.mac_payload {
            crate::lorawan::codec::MacPayload::Data { dev_addr, fcnt, fport, .. } => {
                let plaintext = phy.frmpayload_plaintext(app_s_key);
                Ok(AppMessage {
                    dev_addr: hex::encode(dev_addr),
                    fcnt: *fcnt,
                    dir: phy.direction().map(|d| format!("{d:?}")).unwrap_or_default(),
                    fport: *fport,
                    frm_payload: base64::engine::general_purpose::STANDARD.encode(plaintext),
                })
            }
            crate::lorawan::codec::MacPayload::JoinRequest { .. } => {
                Err(ConformanceError::MacPayload("cannot render a JoinRequest as an application message".into()))
            }
        }
    }
}

/// Flat JSON view of a decrypted application payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppMessage {
    pub dev_addr: String,
    pub fcnt: u16,
    pub dir: String,
    pub fport: Option<u8>,
    pub frm_payload: String,
}

/// A downlink ready to hand to the gateway bridge (spec §5's `txpk`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxFrame {
    pub tmst: u32,
    pub freq: f64,
    pub modu: String,
    pub datr: String,
    pub codr: String,
    pub data: Vec<u8>,
    pub ipol: bool,
    pub powe: u8,
}

impl TxFrame {
    /// Wraps the frame in the Semtech `{"txpk": {...}}` envelope, with the
    /// payload base64-encoded the way the packet forwarder protocol expects.
    pub fn to_txpk_json(&self) -> serde_json::Value {
        serde_json::json!({
            "txpk": {
                "imme": false,
                "tmst": self.tmst,
                "freq": self.freq,
                "rfch": 0,
                "powe": self.powe,
                "modu": self.modu,
                "datr": self.datr,
                "codr": self.codr,
                "ipol": self.ipol,
                "size": self.data.len(),
                "data": base64::engine::general_purpose::STANDARD.encode(&self.data),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_rx() -> RxFrame {
        RxFrame {
            tmst: 1_000_000,
            freq: 868.1,
            chan: 0,
            modu: "LORA".into(),
            datr: "SF7BW125".into(),
            codr: "4/5".into(),
            data: vec![0x40, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
            size: 12,
        }
    }

    #[test]
    fn reply_with_datr_offset_steps_down_from_uplink_dr() {
        let rx = sample_rx();
        let reply = rx.create_reply(&[0x60, 1, 2, 3], std::time::Duration::from_secs(1), None, Some(1), None);
        assert_eq!(reply.datr, DataRate::Dr4.label());
        assert_eq!(reply.tmst, 2_000_000);
    }

    #[test]
    fn reply_with_explicit_data_rate_ignores_uplink_dr() {
        let rx = sample_rx();
        let reply = rx.create_reply(&[0x60], std::time::Duration::from_secs(2), Some(DataRate::Dr0), None, Some(869.525));
        assert_eq!(reply.datr, DataRate::Dr0.label());
        assert_eq!(reply.freq, 869.525);
    }

    #[test]
    #[should_panic]
    fn reply_rejects_both_data_rate_and_offset() {
        let rx = sample_rx();
        let _ = rx.create_reply(&[0x60], std::time::Duration::from_secs(1), Some(DataRate::Dr0), Some(1), None);
    }

    #[test]
    fn txpk_json_encodes_payload_as_base64() {
        let tx = TxFrame {
            tmst: 0,
            freq: 868.1,
            modu: "LORA".into(),
            datr: "SF7BW125".into(),
            codr: "4/5".into(),
            data: vec![1, 2, 3],
            ipol: true,
            powe: 14,
        };
        let json = tx.to_txpk_json();
        assert_eq!(json["txpk"]["data"], base64::engine::general_purpose::STANDARD.encode([1, 2, 3]));
        assert_eq!(json["txpk"]["size"], 3);
    }
}
