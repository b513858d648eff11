//! LoRaWAN 1.0.2 MAC layer: codec (C2), MAC command registry, and test-code
//! constants shared by the step library (C7).

pub mod codec;
pub mod mac_commands;
pub mod test_codes;

pub use codec::{FCtrl, MType, MacPayload, PhyPayload};

/// MHDR byte values (spec §4.2 table / `lorawan_parameters/general.py` `MHDR`).
pub mod mhdr {
    pub const JOIN_REQUEST: u8 = 0x00;
    pub const JOIN_ACCEPT: u8 = 0x20;
    pub const UNCONFIRMED_UP: u8 = 0x40;
    pub const UNCONFIRMED_DOWN: u8 = 0x60;
    pub const CONFIRMED_UP: u8 = 0x80;
    pub const CONFIRMED_DOWN: u8 = 0xA0;
    pub const RFU: u8 = 0xC0;
    pub const PROPRIETARY: u8 = 0xE0;
}
