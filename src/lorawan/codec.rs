//! LoRaWAN 1.0.2 PHYPayload codec (spec §4.2, C2).
//!
//! Grounded in `lorawan/parsing/lorawan.py` (`LoRaWANMessage`, `LoRaWANMHDR`,
//! `LoRaWANMACPayload`, `LoRaWANFHDR`, `LoRaWANFCtrl`) and in the byte layout
//! already sketched by the teacher's `src/lorawan/mod.rs`
//! (`decode_phy_payload`, `decode_join_request`, `decode_data_frame`),
//! generalized to the full spec: real MIC verification via [`crate::crypto`],
//! piggybacked MAC command parsing, and a `parse(.., ignore_errors)` contract
//! matching the original's `ConditionalRaiser`.
//!
//! Byte-ordering contract (spec §4.2): on the wire, DevAddr/AppEUI/DevEUI/
//! DevNonce/FCnt are least-significant-byte-first; this codec always exposes
//! them MSB-first in memory and reverses at the wire boundary.

use crate::crypto::{self, Direction};
use crate::error::ConformanceError;
use crate::lorawan::mac_commands::{self, MacCommand};

/// MAC message type, encoded in the top 3 bits of MHDR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MType {
    JoinRequest,
    JoinAccept,
    UnconfirmedUp,
    UnconfirmedDown,
    ConfirmedUp,
    ConfirmedDown,
    Rfu,
    Proprietary,
}

impl MType {
    pub fn from_index(idx: u8) -> Result<MType, ConformanceError> {
        Ok(match idx {
            0 => MType::JoinRequest,
            1 => MType::JoinAccept,
            2 => MType::UnconfirmedUp,
            3 => MType::UnconfirmedDown,
            4 => MType::ConfirmedUp,
            5 => MType::ConfirmedDown,
            6 => return Err(ConformanceError::Mhdr("RFU mtype (6) is reserved".into())),
            7 => MType::Proprietary,
            other => return Err(ConformanceError::Mhdr(format!("mtype index out of range: {other}"))),
        })
    }

    pub fn index(self) -> u8 {
        match self {
            MType::JoinRequest => 0,
            MType::JoinAccept => 1,
            MType::UnconfirmedUp => 2,
            MType::UnconfirmedDown => 3,
            MType::ConfirmedUp => 4,
            MType::ConfirmedDown => 5,
            MType::Rfu => 6,
            MType::Proprietary => 7,
        }
    }

    pub fn mhdr_byte(self) -> u8 {
        self.index() << 5
    }

    /// `None` for RFU, which carries no defined direction.
    pub fn direction(self) -> Option<Direction> {
        match self {
            MType::JoinRequest | MType::UnconfirmedUp | MType::ConfirmedUp => Some(Direction::Up),
            MType::JoinAccept | MType::UnconfirmedDown | MType::ConfirmedDown => Some(Direction::Down),
            MType::Rfu | MType::Proprietary => None,
        }
    }

    pub fn is_confirmed_up(self) -> bool {
        matches!(self, MType::ConfirmedUp)
    }
}

/// FCtrl byte (spec §3): field meaning of bits 6 and 4 is direction-dependent
/// (ADRACKReq vs RFU, FPending vs RFU) but the storage is uniform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FCtrl {
    pub adr: bool,
    pub adr_ack_req: bool,
    pub ack: bool,
    pub fpending_or_class_b: bool,
    pub foptslen: u8,
}

impl FCtrl {
    pub fn from_byte(b: u8) -> FCtrl {
        FCtrl {
            adr: b & 0x80 != 0,
            adr_ack_req: b & 0x40 != 0,
            ack: b & 0x20 != 0,
            fpending_or_class_b: b & 0x10 != 0,
            foptslen: b & 0x0F,
        }
    }

    pub fn to_byte(self) -> u8 {
        let mut b = 0u8;
        if self.adr {
            b |= 0x80;
        }
        if self.adr_ack_req {
            b |= 0x40;
        }
        if self.ack {
            b |= 0x20;
        }
        if self.fpending_or_class_b {
            b |= 0x10;
        }
        b | (self.foptslen & 0x0F)
    }
}

#[derive(Debug, Clone)]
pub enum MacPayload {
    JoinRequest {
        app_eui: [u8; 8],
        dev_eui: [u8; 8],
        dev_nonce: [u8; 2],
    },
    Data {
        dev_addr: [u8; 4],
        fctrl: FCtrl,
        fcnt: u16,
        fopts: Vec<u8>,
        /// `None` means no FPort/FRMPayload at all.
        fport: Option<u8>,
        frm_payload: Vec<u8>,
    },
}

#[derive(Debug, Clone)]
pub struct PhyPayload {
    pub mtype: MType,
    pub mac_payload: MacPayload,
    pub mic: [u8; 4],
}

fn reversed4(b: &[u8]) -> [u8; 4] {
    [b[3], b[2], b[1], b[0]]
}
fn reversed8(b: &[u8]) -> [u8; 8] {
    [b[7], b[6], b[5], b[4], b[3], b[2], b[1], b[0]]
}
fn reversed2(b: &[u8]) -> [u8; 2] {
    [b[1], b[0]]
}

impl PhyPayload {
    /// Parses a PHYPayload byte sequence. Mirrors `LoRaWANMessage.__init__` /
    /// `ConditionalRaiser`: with `ignore_errors`, format violations are
    /// tolerated where the original tool tolerates them (callers that only
    /// want the MIC/MHDR, e.g. diagnostics).
    pub fn parse(bytes: &[u8], ignore_errors: bool) -> Result<PhyPayload, ConformanceError> {
        if bytes.len() < 12 && !ignore_errors {
            return Err(ConformanceError::MacPayload(format!(
                "PHYPayload too short: {} bytes (need >= 12)",
                bytes.len()
            )));
        }
        if bytes.is_empty() {
            return Err(ConformanceError::MacPayload("empty PHYPayload".into()));
        }
        let mhdr = bytes[0];
        let mtype = MType::from_index((mhdr & 0xE0) >> 5)?;
        let body_end = bytes.len().saturating_sub(4).max(1).min(bytes.len());
        let raw_body = &bytes[1.min(body_end)..body_end];
        let mic = if bytes.len() >= 4 {
            let m = &bytes[bytes.len() - 4..];
            [m[0], m[1], m[2], m[3]]
        } else {
            [0; 4]
        };

        // When tolerating malformed input, pad the working copy so fixed-width
        // field slicing below never panics; the padding bytes never affect a
        // rejection path because rejection already happened above.
        let min_len = if matches!(mtype, MType::JoinRequest) { 18 } else { 7 };
        let body: std::borrow::Cow<[u8]> = if ignore_errors && raw_body.len() < min_len {
            let mut padded = raw_body.to_vec();
            padded.resize(min_len, 0);
            std::borrow::Cow::Owned(padded)
        } else {
            std::borrow::Cow::Borrowed(raw_body)
        };
        let body = &body[..];

        let mac_payload = match mtype {
            MType::JoinRequest => {
                if body.len() != 18 && !ignore_errors {
                    return Err(ConformanceError::JoinRequest(format!(
                        "JoinRequest MACPayload must be 18 bytes, got {}",
                        body.len()
                    )));
                }
                MacPayload::JoinRequest {
                    app_eui: reversed8(&body[0..8]),
                    dev_eui: reversed8(&body[8..16]),
                    dev_nonce: reversed2(&body[16..18]),
                }
            }
            _ => {
                if body.len() < 7 && !ignore_errors {
                    return Err(ConformanceError::Fhdr("MACPayload shorter than FHDR (7 bytes)".into()));
                }
                let dev_addr = reversed4(&body[0..4]);
                let fctrl = FCtrl::from_byte(body[4]);
                let fcnt = u16::from_le_bytes([body[5], body[6]]);
                let foptslen = fctrl.foptslen as usize;
                if body.len() < 7 + foptslen && !ignore_errors {
                    return Err(ConformanceError::Fhdr("FOptsLen exceeds MACPayload length".into()));
                }
                let fopts = body[7..7 + foptslen.min(body.len() - 7)].to_vec();
                let rest = &body[(7 + foptslen).min(body.len())..];
                let (fport, frm_payload) = if rest.len() > 1 {
                    (Some(rest[0]), rest[1..].to_vec())
                } else {
                    (None, Vec::new())
                };
                if fport == Some(0) && !fopts.is_empty() && !ignore_errors {
                    return Err(ConformanceError::MacPiggybackedAndPort0);
                }
                MacPayload::Data { dev_addr, fctrl, fcnt, fopts, fport, frm_payload }
            }
        };

        Ok(PhyPayload { mtype, mac_payload, mic })
    }

    pub fn direction(&self) -> Option<Direction> {
        self.mtype.direction()
    }

    /// `mhdr || macpayload` (everything but the trailing MIC), as needed by
    /// both MIC computation and the Join-Accept "decrypt-to-encrypt" step.
    pub fn encode_without_mic(&self) -> Vec<u8> {
        let mut out = vec![self.mtype.mhdr_byte()];
        match &self.mac_payload {
            MacPayload::JoinRequest { app_eui, dev_eui, dev_nonce } => {
                out.extend(app_eui.iter().rev());
                out.extend(dev_eui.iter().rev());
                out.extend(dev_nonce.iter().rev());
            }
            MacPayload::Data { dev_addr, fctrl, fcnt, fopts, fport, frm_payload } => {
                out.extend(dev_addr.iter().rev());
                out.push(fctrl.to_byte());
                out.extend_from_slice(&fcnt.to_le_bytes());
                out.extend_from_slice(fopts);
                if let Some(port) = fport {
                    out.push(*port);
                    out.extend_from_slice(frm_payload);
                }
            }
        }
        out
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.encode_without_mic();
        out.extend_from_slice(&self.mic);
        out
    }

    /// Computes the MIC this message *should* carry under `key`, given the
    /// correct devaddr/fcnt/direction context (for Data messages).
    pub fn calculate_mic(&self, key: &[u8; 16]) -> [u8; 4] {
        match &self.mac_payload {
            MacPayload::JoinRequest { .. } => crypto::mic_join(key, &self.encode_without_mic()),
            MacPayload::Data { dev_addr, fcnt, .. } => {
                let direction = self.direction().expect("data message always has a direction");
                crypto::mic_data(key, &self.encode_without_mic(), direction, dev_addr, *fcnt as u32)
            }
        }
    }

    pub fn mic_is_valid(&self, key: &[u8; 16]) -> bool {
        self.calculate_mic(key) == self.mic
    }

    /// Decrypts (or, by the same stream-cipher call, "encrypts") the
    /// FRMPayload of a Data message.
    pub fn frmpayload_plaintext(&self, key: &[u8; 16]) -> Vec<u8> {
        match &self.mac_payload {
            MacPayload::Data { dev_addr, fcnt, frm_payload, .. } => {
                let direction = self.direction().expect("data message always has a direction");
                crypto::encrypt_frmpayload(key, frm_payload, direction, dev_addr, *fcnt as u32)
            }
            MacPayload::JoinRequest { .. } => Vec::new(),
        }
    }

    /// MAC commands piggybacked in FOpts, if any.
    pub fn piggybacked_commands(&self) -> Vec<MacCommand> {
        match &self.mac_payload {
            MacPayload::Data { fopts, .. } => {
                let up = self.direction() == Some(Direction::Up);
                mac_commands::parse_mac_commands(fopts, up)
            }
            MacPayload::JoinRequest { .. } => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mtype_direction_mapping() {
        assert_eq!(MType::JoinRequest.direction(), Some(Direction::Up));
        assert_eq!(MType::JoinAccept.direction(), Some(Direction::Down));
        assert_eq!(MType::UnconfirmedUp.direction(), Some(Direction::Up));
        assert_eq!(MType::ConfirmedDown.direction(), Some(Direction::Down));
        assert_eq!(MType::Rfu.direction(), None);
    }

    #[test]
    fn rfu_mtype_rejected() {
        let idx = 6u8;
        assert!(MType::from_index(idx).is_err());
    }

    #[test]
    fn fctrl_byte_roundtrip() {
        let fctrl = FCtrl { adr: true, adr_ack_req: false, ack: true, fpending_or_class_b: false, foptslen: 3 };
        assert_eq!(FCtrl::from_byte(fctrl.to_byte()), fctrl);
    }

    #[test]
    fn join_request_parse_reverses_fields() {
        let mut phy = vec![0x00u8];
        phy.extend([0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]); // AppEUI on wire
        phy.extend([0xA1, 0xA2, 0xA3, 0xA4, 0xA5, 0xA6, 0xA7, 0xA8]); // DevEUI on wire
        phy.extend([0x42, 0x00]); // DevNonce on wire
        phy.extend([0xAA, 0xBB, 0xCC, 0xDD]); // MIC
        let parsed = PhyPayload::parse(&phy, false).unwrap();
        match parsed.mac_payload {
            MacPayload::JoinRequest { app_eui, dev_eui, dev_nonce } => {
                assert_eq!(app_eui, [0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
                assert_eq!(dev_eui, [0xA8, 0xA7, 0xA6, 0xA5, 0xA4, 0xA3, 0xA2, 0xA1]);
                assert_eq!(dev_nonce, [0x00, 0x42]);
            }
            _ => panic!("expected JoinRequest"),
        }
    }

    #[test]
    fn port0_with_piggyback_is_rejected() {
        // mhdr=unconfirmed up, devaddr=4B, fctrl with foptslen=1, fcnt=2B, fopts=1B, fport=0, frmpayload=1B, mic=4B
        let mut phy = vec![0x40u8];
        phy.extend([0, 0, 0, 0]); // devaddr
        phy.push(0x01); // fctrl foptslen=1
        phy.extend([0, 0]); // fcnt
        phy.push(0x06); // fopts (DevStatusReq CID)
        phy.push(0x00); // fport = 0
        phy.push(0xFF); // frmpayload byte
        phy.extend([0, 0, 0, 0]); // mic
        let err = PhyPayload::parse(&phy, false).unwrap_err();
        assert!(matches!(err, ConformanceError::MacPiggybackedAndPort0));
    }

    #[test]
    fn too_short_is_rejected_unless_ignored() {
        let phy = vec![0x40u8, 0, 0];
        assert!(PhyPayload::parse(&phy, false).is_err());
        assert!(PhyPayload::parse(&phy, true).is_ok());
    }
}
