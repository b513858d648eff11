//! Test-protocol constants shared by the step library (C7) and test-case
//! catalogue (C8). Grounded in `lorawan_parameters/testing.py`.

/// Fixed FPort used for every test-protocol exchange between harness and DUT.
pub const TESTING_PORT: u8 = 224;

/// One-byte codes carried as the first byte of a FRMPayload on `TESTING_PORT`.
pub mod test_code {
    pub const DEACTIVATE: u8 = 0x00;
    pub const ACTIVATE: u8 = 0x01;
    pub const USE_CONFIRMED: u8 = 0x02;
    pub const USE_UNCONFIRMED: u8 = 0x03;
    pub const PINGPONG: u8 = 0x04;
    pub const LINKCHECK: u8 = 0x05;
    pub const TRIGGER_JOIN: u8 = 0x06;
}

/// Fixed FRMPayload values for the activation handshake.
pub const FRMPAYLOAD_TEST_DEACTIVATE: &[u8] = &[0x00];
pub const FRMPAYLOAD_TEST_ACT: &[u8] = &[0x01, 0x01, 0x01, 0x01];
