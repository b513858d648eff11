//! MAC command registry (spec §4.2 table; C2).
//!
//! Grounded in `lorawan/parsing/mac_commands.py`. The original dispatches on
//! command name via `eval(...)` — a closed `match` over `(direction, cid)`
//! replaces that (spec §9 REDESIGN FLAGS, §10.2 of SPEC_FULL.md). Only the
//! two command families the spec names are modeled: DevStatus and
//! NewChannel.

/// A single parsed MAC command (content only; CID is implied by the variant).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MacCommand {
    DevStatusReq,
    DevStatusAns { battery: u8, margin: i8 },
    NewChannelReq { ch_index: u8, freq_mhz: f64, max_dr: u8, min_dr: u8 },
    NewChannelAns { dr_ok: bool, freq_ok: bool },
}

impl MacCommand {
    pub fn cid(&self) -> u8 {
        match self {
            MacCommand::DevStatusReq | MacCommand::DevStatusAns { .. } => 0x06,
            MacCommand::NewChannelReq { .. } | MacCommand::NewChannelAns { .. } => 0x07,
        }
    }

    pub fn is_ok(&self) -> bool {
        match self {
            MacCommand::NewChannelAns { dr_ok, freq_ok } => *dr_ok && *freq_ok,
            _ => false,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.cid()];
        match self {
            MacCommand::DevStatusReq => {}
            MacCommand::DevStatusAns { battery, margin } => {
                out.push(*battery);
                out.push(*margin as u8);
            }
            MacCommand::NewChannelReq { ch_index, freq_mhz, max_dr, min_dr } => {
                out.push(*ch_index);
                let hz_units = (freq_mhz * 10_000.0).round() as u32;
                let b = hz_units.to_le_bytes();
                out.extend_from_slice(&b[0..3]);
                out.push((max_dr << 4) | (min_dr & 0x0F));
            }
            MacCommand::NewChannelAns { dr_ok, freq_ok } => {
                let mut status = 0u8;
                if *dr_ok {
                    status |= 0b10;
                }
                if *freq_ok {
                    status |= 0b01;
                }
                out.push(status);
            }
        }
        out
    }
}

/// Parses one command from the front of `bytes` given the direction
/// (`direction_up == true` means this sequence came from the DUT, so the
/// expected command kinds are the "up" answers; `false` means the harness's
/// own outgoing "down" requests, used when re-parsing what we just built).
fn parse_one(bytes: &[u8], direction_up: bool) -> Option<(MacCommand, usize)> {
    if bytes.is_empty() {
        return None;
    }
    let cid = bytes[0];
    match (direction_up, cid) {
        (true, 0x06) if bytes.len() >= 3 => {
            Some((MacCommand::DevStatusAns { battery: bytes[1], margin: bytes[2] as i8 }, 3))
        }
        (false, 0x06) => Some((MacCommand::DevStatusReq, 1)),
        (true, 0x07) if bytes.len() >= 2 => {
            let status = bytes[1];
            Some((
                MacCommand::NewChannelAns { dr_ok: status & 0b10 != 0, freq_ok: status & 0b01 != 0 },
                2,
            ))
        }
        (false, 0x07) if bytes.len() >= 6 => {
            let hz_units = u32::from_le_bytes([bytes[2], bytes[3], bytes[4], 0]);
            let drrange = bytes[5];
            Some((
                MacCommand::NewChannelReq {
                    ch_index: bytes[1],
                    freq_mhz: hz_units as f64 / 10_000.0,
                    max_dr: (drrange >> 4) & 0x0F,
                    min_dr: drrange & 0x0F,
                },
                6,
            ))
        }
        _ => None,
    }
}

/// Iterates until the byte stream is exhausted; unknown/truncated CIDs
/// terminate iteration silently (spec §4.2: "lenient consumer").
pub fn parse_mac_commands(bytes: &[u8], direction_up: bool) -> Vec<MacCommand> {
    let mut commands = Vec::new();
    let mut rest = bytes;
    while !rest.is_empty() {
        match parse_one(rest, direction_up) {
            Some((cmd, consumed)) => {
                rest = &rest[consumed..];
                commands.push(cmd);
            }
            None => break,
        }
    }
    commands
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn devstatus_req_ans_roundtrip() {
        let req = MacCommand::DevStatusReq;
        let encoded = req.encode();
        let parsed = parse_mac_commands(&encoded, false);
        assert_eq!(parsed, vec![MacCommand::DevStatusReq]);

        let ans = MacCommand::DevStatusAns { battery: 200, margin: -5 };
        let parsed = parse_mac_commands(&ans.encode(), true);
        assert_eq!(parsed, vec![ans]);
    }

    #[test]
    fn newchannel_req_ans_roundtrip() {
        let req = MacCommand::NewChannelReq { ch_index: 3, freq_mhz: 868.7, max_dr: 5, min_dr: 0 };
        let parsed = parse_mac_commands(&req.encode(), false);
        assert_eq!(parsed.len(), 1);
        match &parsed[0] {
            MacCommand::NewChannelReq { ch_index, max_dr, min_dr, .. } => {
                assert_eq!(*ch_index, 3);
                assert_eq!(*max_dr, 5);
                assert_eq!(*min_dr, 0);
            }
            _ => panic!("expected NewChannelReq"),
        }

        let ans = MacCommand::NewChannelAns { dr_ok: true, freq_ok: true };
        assert!(ans.is_ok());
        let parsed = parse_mac_commands(&ans.encode(), true);
        assert_eq!(parsed, vec![ans]);
    }

    #[test]
    fn unknown_cid_stops_iteration_silently() {
        let bytes = [0x42, 0xFF, 0xFF];
        assert!(parse_mac_commands(&bytes, true).is_empty());
    }

    #[test]
    fn multiple_commands_concatenated() {
        let mut bytes = MacCommand::DevStatusReq.encode();
        bytes.extend(MacCommand::NewChannelReq { ch_index: 1, freq_mhz: 868.8, max_dr: 5, min_dr: 0 }.encode());
        let parsed = parse_mac_commands(&bytes, false);
        assert_eq!(parsed.len(), 2);
    }
}
