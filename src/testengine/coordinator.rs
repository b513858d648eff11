//! Session coordinator (spec §4.8, C9).
//!
//! Grounded in `testingtool_services.py`'s `TestSessionCoordinator`: runs the
//! requested test list against one DUT, consuming uplinks from the bridge's
//! broadcast stream and driving the current [`TestManager`] to PASS/FAIL.
//! Per spec §9, the original's process-wide singletons (UI publisher, bus
//! connection) become explicit constructor dependencies here.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::error::{TestFailError, TestFailKind};
use crate::lorawan::mhdr;
use crate::session::EndDevice;
use crate::udp::{DownlinkSender, UplinkEvent};

use super::catalogue;
use super::step::TestManagerResult;

/// One row of the final PASS/FAIL report (spec §7 "report block").
#[derive(Debug, Clone)]
pub struct ReportRow {
    pub tc_name: String,
    pub passed: bool,
    pub detail: Option<String>,
}

/// Drives `requested_tests` (with `td_lorawan_act_01` prepended and
/// `td_lorawan_deactivate` appended, per spec §4.8's initial handshake)
/// against one DUT session.
pub struct TestSessionCoordinator {
    requested_tests: Vec<String>,
    next_test_index: usize,
    reset_dut: bool,
    downlink_counter: u16,
    device_under_test: EndDevice,
    current_test: Option<super::step::TestManager>,
    downlink: DownlinkSender,
    step_timeout: Duration,
    report: Vec<ReportRow>,
}

impl TestSessionCoordinator {
    pub fn new(
        device_under_test: EndDevice,
        downlink: DownlinkSender,
        requested_tests: Vec<String>,
        step_timeout: Duration,
    ) -> TestSessionCoordinator {
        let mut tests = vec!["td_lorawan_act_01".to_string()];
        tests.extend(requested_tests);
        tests.push("td_lorawan_deactivate".to_string());

        TestSessionCoordinator {
            requested_tests: tests,
            next_test_index: 0,
            reset_dut: false,
            downlink_counter: 0,
            device_under_test,
            current_test: None,
            downlink,
            step_timeout,
            report: Vec::new(),
        }
    }

    /// Consumes uplinks until the requested test list is exhausted (or the
    /// uplink stream itself closes, the `SessionTerminatedError` analogue),
    /// returning the accumulated PASS/FAIL report.
    pub async fn run(mut self, mut uplinks: broadcast::Receiver<UplinkEvent>) -> Vec<ReportRow> {
        loop {
            if self.current_test.is_none() {
                match self.start_next_test().await {
                    StartOutcome::Started => {}
                    StartOutcome::Exhausted => break,
                }
            }

            let event = match timeout(self.step_timeout, uplinks.recv()).await {
                Ok(Ok(event)) => event,
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    warn!("uplink broadcast lagged, skipped {} events", skipped);
                    continue;
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    info!("uplink channel closed, ending session");
                    break;
                }
                Err(_) => {
                    self.fail_current(TestFailKind::TimeOut);
                    continue;
                }
            };

            self.handle_uplink(event).await;
        }

        self.report
    }

    async fn start_next_test(&mut self) -> StartOutcome {
        let tc_name = if self.reset_dut {
            self.reset_dut = false;
            "td_lorawan_reset".to_string()
        } else if self.next_test_index < self.requested_tests.len() {
            let name = self.requested_tests[self.next_test_index].clone();
            self.next_test_index += 1;
            name
        } else {
            return StartOutcome::Exhausted;
        };

        match catalogue::build(&tc_name) {
            Some(mut manager) => {
                info!("starting test case {}", tc_name);
                if let Some(frame) = manager.enter_current(&mut self.device_under_test, &mut self.downlink_counter) {
                    self.send(frame).await;
                }
                self.current_test = Some(manager);
            }
            None => {
                warn!("unknown test case requested: {}", tc_name);
                self.report.push(ReportRow { tc_name, passed: false, detail: Some("unknown test case".into()) });
            }
        }
        StartOutcome::Started
    }

    async fn handle_uplink(&mut self, event: UplinkEvent) {
        let phy = match event.frame.parse_phypayload(false) {
            Ok(phy) => phy,
            Err(e) => {
                self.fail_current(TestFailKind::Conformance(e));
                return;
            }
        };

        if !matches!(phy.mtype, crate::lorawan::codec::MType::JoinRequest) {
            if !phy.mic_is_valid(&self.device_under_test.loramac_params.nwk_s_key) {
                self.fail_current(TestFailKind::Conformance(crate::error::ConformanceError::Mic {
                    expected: hex::encode(phy.calculate_mic(&self.device_under_test.loramac_params.nwk_s_key)),
                    received: hex::encode(phy.mic),
                }));
                return;
            }
            self.device_under_test.message_to_ack = phy.mtype.is_confirmed_up();
        }

        let plaintext = match &phy.mac_payload {
            crate::lorawan::codec::MacPayload::Data { fport, .. } => {
                let key = if *fport == Some(0) {
                    &self.device_under_test.loramac_params.nwk_s_key
                } else {
                    &self.device_under_test.loramac_params.app_s_key
                };
                phy.frmpayload_plaintext(key)
            }
            crate::lorawan::codec::MacPayload::JoinRequest { .. } => Vec::new(),
        };

        let Some(manager) = self.current_test.as_mut() else { return };
        manager.mark_frequency_seen(event.frame.freq);

        let result = manager.on_uplink(&mut self.device_under_test, &mut self.downlink_counter, &phy, plaintext);
        match result {
            TestManagerResult::Continue(downlink) => {
                if let Some(frame) = downlink {
                    self.send_timed(&event, frame).await;
                }
            }
            TestManagerResult::Pass => {
                let tc_name = self.current_test.take().unwrap().tc_name;
                info!("test case {} PASSED", tc_name);
                self.report.push(ReportRow { tc_name, passed: true, detail: None });
            }
            TestManagerResult::Fail(e) => self.report_failure(e),
        }
    }

    fn fail_current(&mut self, kind: TestFailKind) {
        let tc_name = self.current_test.as_ref().map(|m| m.tc_name.clone()).unwrap_or_default();
        self.report_failure(TestFailError::new(tc_name, "uplink", kind));
    }

    fn report_failure(&mut self, e: TestFailError) {
        error!("test case {} FAILED: {}", e.tc, e.description);
        self.reset_dut = true;
        self.report.push(ReportRow { tc_name: e.tc.clone(), passed: false, detail: Some(e.description.clone()) });
        self.current_test = None;
    }

    async fn send(&mut self, frame: crate::gateway::TxFrame) {
        if let Err(e) = self.downlink.send_downlink(&frame).await {
            warn!("failed to send downlink: {}", e);
        }
    }

    /// Re-derives the real RX1 timing/frequency/datr from the triggering
    /// uplink envelope; a `Step` only knows the payload bytes, not the
    /// gateway's clock (spec §4.5's `create_downlink_reply` contract).
    async fn send_timed(&mut self, event: &UplinkEvent, step_frame: crate::gateway::TxFrame) {
        let is_join_accept = step_frame.data.first().copied() == Some(mhdr::JOIN_ACCEPT);
        let delay = if is_join_accept {
            self.device_under_test.loramac_previous_session.joinaccept_delay1
        } else {
            self.device_under_test.loramac_params.rx1_delay
        };
        let offset = if is_join_accept {
            self.device_under_test.loramac_previous_session.rx1_dr_offset
        } else {
            self.device_under_test.loramac_params.rx1_dr_offset
        };
        let frame = event.frame.create_reply(&step_frame.data, delay, None, Some(offset), None);
        self.send(frame).await;
    }

    pub fn report(&self) -> &[ReportRow] {
        &self.report
    }
}

enum StartOutcome {
    Started,
    Exhausted,
}
