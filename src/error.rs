//! Typed error hierarchy for the conformance tool.
//!
//! Mirrors the original testing tool's exception tree (`TestingToolError` and
//! its subclasses) as a flat set of `thiserror` enums linked by `#[from]`
//! conversions, rather than a Python-style class hierarchy. Each leaf keeps
//! the fields the original tool attaches to a failed test case: a
//! description, the test case name, the step name, and (when available) the
//! last received message for the fail report.

use thiserror::Error;

/// A defect in the byte layout of a received PHYPayload.
#[derive(Debug, Error)]
pub enum ConformanceError {
    #[error("MHDR error: {0}")]
    Mhdr(String),
    #[error("MACPayload error: {0}")]
    MacPayload(String),
    #[error("FHDR error: {0}")]
    Fhdr(String),
    #[error("FCtrl error: {0}")]
    Fctrl(String),
    #[error("FCnt error: {0}")]
    Fcnt(String),
    #[error("FPort error: {0}")]
    Fport(String),
    #[error("FRMPayload error: {0}")]
    FrmPayload(String),
    #[error("JoinRequest error: {0}")]
    JoinRequest(String),
    #[error("MIC mismatch: expected {expected}, got {received}")]
    Mic { expected: String, received: String },
    #[error("FPort 0 used with non-empty FOpts (MAC commands in both places)")]
    MacPiggybackedAndPort0,
}

/// Defects in DUT behaviour at the session/identity level.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("unknown device: {0}")]
    UnknownDevice(String),
    #[error("join rejected: {0}")]
    JoinRejected(String),
    #[error("DevNonce {0:04x} already used (replay)")]
    DevNonceReplay(u16),
}

/// A DUT response that doesn't match what the protocol or a prior step requires.
#[derive(Debug, Error)]
pub enum InteroperabilityError {
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
    #[error("echo mismatch: {0}")]
    Echo(String),
    #[error("TAOK counter mismatch: expected {expected}, got {received}")]
    ActokCounter { expected: u16, received: u16 },
    #[error("frequency error: {0}")]
    Frequency(String),
    #[error("no MAC response: {0}")]
    NoMacResponse(String),
    #[error("wrong MAC command format: {0}")]
    WrongMacFormat(String),
    #[error("MAC configuration exchange failed: {0}")]
    MacConfigurationExchange(String),
}

/// Root of the per-test-case failure hierarchy: always ends with a DUT reset.
#[derive(Debug, Error)]
#[error("{description} (tc={tc}, step={step})")]
pub struct TestFailError {
    pub description: String,
    pub tc: String,
    pub step: String,
    pub last_message: Option<String>,
    #[source]
    pub kind: TestFailKind,
}

#[derive(Debug, Error)]
pub enum TestFailKind {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Conformance(#[from] ConformanceError),
    #[error(transparent)]
    Interoperability(#[from] InteroperabilityError),
    #[error("timed out waiting for the DUT")]
    TimeOut,
}

impl TestFailError {
    pub fn new(tc: impl Into<String>, step: impl Into<String>, kind: impl Into<TestFailKind>) -> Self {
        let kind = kind.into();
        Self {
            description: kind.to_string(),
            tc: tc.into(),
            step: step.into(),
            last_message: None,
            kind,
        }
    }

    pub fn with_last_message(mut self, last_message: impl Into<String>) -> Self {
        self.last_message = Some(last_message.into());
        self
    }
}

impl From<SessionError> for TestFailKind {
    fn from(e: SessionError) -> Self {
        TestFailKind::Session(e)
    }
}
impl From<ConformanceError> for TestFailKind {
    fn from(e: ConformanceError) -> Self {
        TestFailKind::Conformance(e)
    }
}
impl From<InteroperabilityError> for TestFailKind {
    fn from(e: InteroperabilityError) -> Self {
        TestFailKind::Interoperability(e)
    }
}

/// Root error of the whole tool.
#[derive(Debug, Error)]
pub enum TestingToolError {
    #[error("unknown test case: {0}")]
    UnknownTest(String),
    #[error("session terminated: {0}")]
    SessionTerminated(String),
    #[error(transparent)]
    TestFail(#[from] TestFailError),
}
