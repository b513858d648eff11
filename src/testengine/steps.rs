//! LoRaWAN step library (spec §4.6/§4.7, C7).
//!
//! Thin, named constructors over the [`super::step::Step`] variants, so the
//! catalogue (C8) reads close to the spec's own step names rather than
//! against bare enum literals.

use super::step::{Next, Step};
use crate::lorawan::mac_commands::MacCommand;

pub fn wait_act_ok(on_pass: Next) -> Step {
    Step::WaitActOk { on_pass }
}

pub fn actok_to_ping(on_pass: Next) -> Step {
    Step::ActokToPing { on_pass }
}

pub fn wait_pong(on_pass: Next) -> Step {
    Step::WaitPong { on_pass }
}

pub fn counting_fcnt_up(count_limit: u32, on_pass: Next) -> Step {
    Step::CountingFcntUp { count_limit, last_fcnt: None, on_pass }
}

pub fn frequency_check(limit: u32, on_pass: Next) -> Step {
    Step::FrequencyCheck { limit, on_pass }
}

pub fn forbidden_frequency(forbidden: Vec<f64>, limit: u32, on_pass: Next) -> Step {
    Step::ForbiddenFrequency { forbidden, limit, on_pass }
}

pub fn join_request_handler(dlsettings: u8, rxdelay_seconds: u8, cflist: [u8; 16], on_pass: Next) -> Step {
    Step::JoinRequestHandler { dlsettings, rxdelay_seconds, cflist, on_pass }
}

pub fn wait_data_to_activate(join_dlsettings: u8, join_rxdelay_seconds: u8, join_cflist: [u8; 16], on_pass: Next) -> Step {
    Step::WaitDataToActivate { join_dlsettings, join_rxdelay_seconds, join_cflist, on_pass }
}

pub fn wait_confirmed_act_ok(on_pass: Next) -> Step {
    Step::WaitConfirmedActOk { on_pass }
}

pub fn actok_to_dev_status_req(piggyback: bool, port0: bool, on_pass: Next) -> Step {
    Step::ActokToMacCommand { command: MacCommand::DevStatusReq, piggyback, port0, on_pass }
}

pub fn dev_status_ans_check(expected_count: u32, on_pass: Next) -> Step {
    Step::MacCommandAnsCheck { expected_cid: 0x06, expected_count, expect_ok: false, on_pass }
}

pub fn no_mac_command_check(rounds_required: u32, on_pass: Next) -> Step {
    Step::NoMacCommandCheck { rounds_required, rounds_seen: 0, on_pass }
}

pub fn actok_to_new_channel_req(requests: Vec<(f64, u8)>, on_pass: Next) -> Step {
    Step::ActokToNewChannelReq { requests, on_pass }
}

pub fn new_channel_ans_check(expected_count: u32, expect_ok: bool, on_pass: Next) -> Step {
    Step::MacCommandAnsCheck { expected_cid: 0x07, expected_count, expect_ok, on_pass }
}

pub fn send_bad_mic_then_wait_act_ok(on_pass: Next) -> Step {
    Step::SendBadMicThenWaitActOk { on_pass }
}

/// Default, all-zero CFList: no additional channels offered at Join-Accept.
pub const NO_CFLIST: [u8; 16] = [0; 16];

/// `dlSettings` byte builder (spec §4.2 step 5 / `session::dlsettings_byte`
/// is private to that module, so the catalogue builds the raw byte itself —
/// bits 6..4 = RX1DROffset, bits 3..0 = RX2 DataRate index).
pub fn dlsettings(rx1_dr_offset: u8, rx2_dr_index: u8) -> u8 {
    ((rx1_dr_offset & 0x07) << 4) | (rx2_dr_index & 0x0F)
}
