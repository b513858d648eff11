//! EU868 regional parameters (spec §4.3).
//!
//! Grounded in `lorawan/lorawan_parameters/region_eu868.py` and
//! `lorawan/lorawan_parameters/general.py`, and in the "named constants of a
//! `Duration`-typed `recommended` module" idiom used by `codyps-lorawan`'s
//! `parameters.rs`. Only EU868 is modeled (spec §1 Non-goals).

use std::time::Duration;

/// EU868 data rates DR0..DR6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum DataRate {
    Dr0 = 0,
    Dr1 = 1,
    Dr2 = 2,
    Dr3 = 3,
    Dr4 = 4,
    Dr5 = 5,
    Dr6 = 6,
}

impl DataRate {
    pub const ALL: [DataRate; 7] = [
        DataRate::Dr0,
        DataRate::Dr1,
        DataRate::Dr2,
        DataRate::Dr3,
        DataRate::Dr4,
        DataRate::Dr5,
        DataRate::Dr6,
    ];

    pub fn index(self) -> u8 {
        self as u8
    }

    pub fn from_index(idx: u8) -> DataRate {
        DataRate::ALL[idx.min(6) as usize]
    }

    /// Spreading-factor/bandwidth label as carried in a gateway envelope's `datr` field.
    pub fn label(self) -> &'static str {
        match self {
            DataRate::Dr0 => "SF12BW125",
            DataRate::Dr1 => "SF11BW125",
            DataRate::Dr2 => "SF10BW125",
            DataRate::Dr3 => "SF9BW125",
            DataRate::Dr4 => "SF8BW125",
            DataRate::Dr5 => "SF7BW125",
            DataRate::Dr6 => "SF7BW250",
        }
    }

    pub fn from_label(label: &str) -> Option<DataRate> {
        DataRate::ALL.into_iter().find(|dr| dr.label() == label)
    }
}

/// Data-rate offset arithmetic (testable property 6): `rx1_dr(DR_i, k) ==
/// DR_max(i-k, 0)` for all i in [0,6], k in [0,5].
pub fn rx1_dr_offset(initial: DataRate, offset: u8) -> DataRate {
    let offset = offset.min(recommended::MAX_RX1_DR_OFFSET);
    let idx = initial.index().saturating_sub(offset);
    DataRate::from_index(idx)
}

/// One slot of the 16-entry channel database (spec §3 "Channel database").
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Channel {
    pub freq_mhz: f64,
    pub min_dr: DataRate,
    pub max_dr: DataRate,
    pub mandatory: bool,
}

impl Channel {
    fn empty() -> Channel {
        Channel { freq_mhz: 0.0, min_dr: DataRate::Dr0, max_dr: DataRate::Dr0, mandatory: false }
    }
}

pub const NUM_CHANNELS: usize = 16;

/// Mandatory EU868 default channels: 868.1 / 868.3 / 868.5 MHz, DR0..DR5.
pub fn default_channels() -> [Channel; NUM_CHANNELS] {
    let mut slots = [Channel::empty(); NUM_CHANNELS];
    for (i, freq) in [868.1, 868.3, 868.5].into_iter().enumerate() {
        slots[i] = Channel { freq_mhz: freq, min_dr: DataRate::Dr0, max_dr: DataRate::Dr5, mandatory: true };
    }
    slots
}

/// EU868 valid frequency ranges for dynamically-added channels.
pub fn is_valid_frequency(freq_mhz: f64) -> bool {
    (863.1..=869.5).contains(&freq_mhz) || freq_mhz == 869.525 || freq_mhz == 869.85
}

pub fn min_dr_for(_freq_mhz: f64) -> DataRate {
    DataRate::Dr0
}

pub fn max_dr_for(freq_mhz: f64) -> DataRate {
    if is_valid_frequency(freq_mhz) {
        DataRate::Dr5
    } else {
        DataRate::Dr0
    }
}

/// Encode up to 5 frequencies as a 16-byte CFList (spec §4.3, S5).
pub fn encode_cflist(frequencies: &[f64]) -> [u8; 16] {
    assert!(frequencies.len() <= 5, "CFList holds at most 5 frequencies");
    let mut out = [0u8; 16];
    for (i, freq) in frequencies.iter().enumerate() {
        let hz_units = (freq * 10_000.0).round() as u32;
        let bytes = hz_units.to_le_bytes();
        out[i * 3] = bytes[0];
        out[i * 3 + 1] = bytes[1];
        out[i * 3 + 2] = bytes[2];
    }
    out
}

/// Decode a 16-byte CFList into its non-empty frequencies, MHz.
pub fn decode_cflist(cflist: &[u8; 16]) -> Vec<f64> {
    cflist
        .chunks_exact(3)
        .filter(|c| *c != [0, 0, 0])
        .map(|c| {
            let hz_units = u32::from_le_bytes([c[0], c[1], c[2], 0]);
            hz_units as f64 / 10_000.0
        })
        .collect()
}

/// Named default timing/retry constants, kept as a `recommended` submodule of
/// `Duration`-typed values (the idiom `codyps-lorawan`'s `parameters.rs` uses),
/// rather than raw microsecond integers as in the original source.
pub mod recommended {
    use super::Duration;

    pub const RECEIVE_DELAY1: Duration = Duration::from_secs(1);
    pub const RECEIVE_DELAY2: Duration = Duration::from_secs(2);
    pub const JOIN_ACCEPT_DELAY1: Duration = Duration::from_secs(5);
    pub const JOIN_ACCEPT_DELAY2: Duration = Duration::from_secs(6);
    pub const RX2_DEFAULT_FREQ_MHZ: f64 = 869.525;
    pub const MAX_FCNT_GAP: u32 = 16384;
    pub const ADR_ACK_LIMIT: u32 = 64;
    pub const ADR_ACK_DELAY: u32 = 32;
    pub const ACK_TIMEOUT: Duration = Duration::from_secs(2);
    pub const MIN_RX1_DR_OFFSET: u8 = 0;
    pub const MAX_RX1_DR_OFFSET: u8 = 5;
    pub const RX1_DEFAULT_OFFSET: u8 = 0;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dr_offset_monotonicity() {
        for i in 0u8..=6 {
            for k in 0u8..=5 {
                let expected = DataRate::from_index(i.saturating_sub(k));
                assert_eq!(rx1_dr_offset(DataRate::from_index(i), k), expected);
            }
        }
    }

    #[test]
    fn cflist_roundtrip_known_vector() {
        let freqs = [868.7, 868.9, 869.1, 869.3, 869.5];
        let encoded = encode_cflist(&freqs);
        assert_eq!(hex::encode(encoded), "988d84689584389d8408a584d8ac8400");
        let decoded = decode_cflist(&encoded);
        assert_eq!(decoded, freqs);
    }

    #[test]
    fn mandatory_channels_are_seeded() {
        let channels = default_channels();
        assert!(channels[0].mandatory && channels[0].freq_mhz == 868.1);
        assert!(channels[1].mandatory && channels[1].freq_mhz == 868.3);
        assert!(channels[2].mandatory && channels[2].freq_mhz == 868.5);
        for slot in &channels[3..] {
            assert!(!slot.mandatory);
            assert_eq!(slot.freq_mhz, 0.0);
        }
    }
}
