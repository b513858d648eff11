pub mod protocol;

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::gateway::{RxFrame, TxFrame};
use protocol::{GwmpPacket, PullRespPayload, PushDataPayload, Rxpk, Txpk};

/// An uplink handed up from the bridge (spec §6's narrow "uplink-event
/// channel" interface). Both the test coordinator (C9) and the downlink
/// scheduler (C10) subscribe to the same broadcast stream independently.
#[derive(Debug, Clone)]
pub struct UplinkEvent {
    pub gateway_eui: [u8; 8],
    pub rssi: f64,
    pub lsnr: Option<f64>,
    pub frame: RxFrame,
}

/// Shared state for tracking the gateway's address (learned from PULL_DATA
/// keepalives). The gateway sends periodic PULL_DATA packets; the source
/// address from those tells us where to send PULL_RESP (downlink) packets.
#[derive(Debug, Clone)]
pub struct GatewayTracker {
    inner: Arc<RwLock<Option<SocketAddr>>>,
}

impl GatewayTracker {
    pub fn new() -> Self {
        Self { inner: Arc::new(RwLock::new(None)) }
    }

    pub async fn set(&self, addr: SocketAddr) {
        let mut guard = self.inner.write().await;
        let changed = *guard != Some(addr);
        *guard = Some(addr);
        if changed {
            info!("Gateway address updated: {}", addr);
        }
    }

    pub async fn get(&self) -> Option<SocketAddr> {
        *self.inner.read().await
    }
}

impl Default for GatewayTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle for sending downlink packets through the UDP socket. Cloneable;
/// both the coordinator and the scheduler hold one (spec §6's "downlink
/// sink" interface).
#[derive(Clone)]
pub struct DownlinkSender {
    socket: Arc<UdpSocket>,
    gateway: GatewayTracker,
}

impl DownlinkSender {
    /// Send a PULL_RESP downlink to the tracked gateway.
    pub async fn send_downlink(&self, frame: &TxFrame) -> anyhow::Result<()> {
        let gw_addr = self
            .gateway
            .get()
            .await
            .ok_or_else(|| anyhow::anyhow!("no gateway address known (no PULL_DATA received yet)"))?;

        let txpk: Txpk = to_wire_txpk(frame);
        let payload = PullRespPayload { txpk };
        let json = serde_json::to_string(&payload)?;

        let token: u16 = rand_token();
        let packet = GwmpPacket::pull_resp(token, &json);

        self.socket.send_to(&packet, gw_addr).await?;
        info!("Sent PULL_RESP to gateway {} (token=0x{:04x}, {} bytes)", gw_addr, token, json.len());

        Ok(())
    }
}

fn to_wire_txpk(frame: &TxFrame) -> Txpk {
    use base64::Engine;
    Txpk {
        imme: Some(false),
        tmst: Some(frame.tmst),
        freq: frame.freq,
        rfch: Some(0),
        powe: Some(frame.powe),
        modu: Some(frame.modu.clone()),
        datr: frame.datr.clone(),
        codr: Some(frame.codr.clone()),
        ipol: Some(frame.ipol),
        size: frame.data.len() as u16,
        data: base64::engine::general_purpose::STANDARD.encode(&frame.data),
        ncrc: Some(true),
    }
}

fn rand_token() -> u16 {
    use rand::Rng;
    rand::thread_rng().gen()
}

/// Start the UDP server as a background task; returns a `DownlinkSender`
/// handle plus the uplink broadcast sender (so callers can subscribe more
/// than once without racing the first subscriber).
pub async fn start_server(config: &Config) -> anyhow::Result<(DownlinkSender, broadcast::Sender<UplinkEvent>)> {
    let socket = Arc::new(UdpSocket::bind(&config.udp.bind).await?);
    info!("UDP server listening on {}", config.udp.bind);

    let gateway = GatewayTracker::new();
    let downlink_sender = DownlinkSender { socket: socket.clone(), gateway: gateway.clone() };
    let (uplink_tx, _rx) = broadcast::channel(256);
    let uplink_tx_task = uplink_tx.clone();

    tokio::spawn(async move {
        let mut buf = vec![0u8; 65535];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, src)) => {
                    debug!("Received {} bytes from {}", len, src);
                    match GwmpPacket::parse(&buf[..len]) {
                        Ok(packet) => handle_packet(&socket, src, packet, &uplink_tx_task, &gateway).await,
                        Err(e) => warn!("Failed to parse GWMP packet from {}: {}", src, e),
                    }
                }
                Err(e) => error!("UDP recv error: {}", e),
            }
        }
    });

    Ok((downlink_sender, uplink_tx))
}

async fn handle_packet(
    socket: &UdpSocket,
    src: SocketAddr,
    packet: GwmpPacket,
    uplink_tx: &broadcast::Sender<UplinkEvent>,
    gateway: &GatewayTracker,
) {
    match packet {
        GwmpPacket::PushData { random_token, gateway_eui, json_payload } => {
            let gw_eui_hex = hex::encode(gateway_eui);
            info!("PUSH_DATA from gateway {} (token: 0x{:04x})", gw_eui_hex, random_token);

            let ack = GwmpPacket::push_ack(random_token);
            if let Err(e) = socket.send_to(&ack, src).await {
                error!("Failed to send PUSH_ACK to {}: {}", src, e);
            }

            match serde_json::from_str::<PushDataPayload>(&json_payload) {
                Ok(payload) => {
                    if let Some(rxpks) = payload.rxpk {
                        for rxpk in rxpks {
                            info!("  rxpk: freq={} MHz, rssi={} dBm, datr={}, size={} bytes", rxpk.freq, rxpk.rssi, rxpk.datr, rxpk.size);
                            match rxpk_to_event(&rxpk, gateway_eui) {
                                Ok(event) => {
                                    // No active subscribers is not an error: the
                                    // simulator binaries run the bridge standalone.
                                    let _ = uplink_tx.send(event);
                                }
                                Err(e) => warn!("  Failed to decode rxpk: {}", e),
                            }
                        }
                    }
                    if let Some(stat) = payload.stat {
                        debug!("  Gateway status: {}", stat);
                    }
                }
                Err(e) => {
                    warn!("Failed to parse PUSH_DATA JSON: {}", e);
                    debug!("  Raw JSON: {}", json_payload);
                }
            }
        }
        GwmpPacket::PullData { random_token, gateway_eui } => {
            let gw_eui_hex = hex::encode(gateway_eui);
            debug!("PULL_DATA from gateway {} (token: 0x{:04x})", gw_eui_hex, random_token);
            gateway.set(src).await;
            let ack = GwmpPacket::pull_ack(random_token);
            if let Err(e) = socket.send_to(&ack, src).await {
                error!("Failed to send PULL_ACK to {}: {}", src, e);
            }
        }
        GwmpPacket::TxAck { random_token, gateway_eui, json_payload } => {
            let gw_eui_hex = hex::encode(gateway_eui);
            let error = json_payload
                .as_deref()
                .and_then(|j| serde_json::from_str::<serde_json::Value>(j).ok())
                .and_then(|v| v.get("txpk_ack").and_then(|a| a.get("error")).and_then(|e| e.as_str()).map(str::to_string));
            match error.as_deref() {
                None | Some("NONE") => info!("TX_ACK from gateway {} (token: 0x{:04x}): SUCCESS", gw_eui_hex, random_token),
                Some(err) => warn!("TX_ACK from gateway {} (token: 0x{:04x}): ERROR: {}", gw_eui_hex, random_token, err),
            }
        }
        GwmpPacket::PushAck { random_token } => debug!("PUSH_ACK (token: 0x{:04x})", random_token),
        GwmpPacket::PullAck { random_token } => debug!("PULL_ACK (token: 0x{:04x})", random_token),
        GwmpPacket::PullResp { random_token, json_payload } => {
            debug!("PULL_RESP (token: 0x{:04x}): {} bytes", random_token, json_payload.len());
        }
    }
}

fn rxpk_to_event(rxpk: &Rxpk, gateway_eui: [u8; 8]) -> anyhow::Result<UplinkEvent> {
    use base64::Engine;
    let data = base64::engine::general_purpose::STANDARD.decode(&rxpk.data)?;
    let frame = RxFrame {
        tmst: rxpk.tmst.unwrap_or(0) as u32,
        freq: rxpk.freq,
        chan: rxpk.chan.unwrap_or(0) as u32,
        modu: rxpk.modu.clone().unwrap_or_else(|| "LORA".to_string()),
        datr: rxpk.datr.clone(),
        codr: rxpk.codr.clone().unwrap_or_else(|| "4/5".to_string()),
        size: rxpk.size as u32,
        data,
    };
    Ok(UplinkEvent { gateway_eui, rssi: rxpk.rssi, lsnr: rxpk.lsnr, frame })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn gateway_tracker_keeps_latest_address() {
        let tracker = GatewayTracker::new();
        assert!(tracker.get().await.is_none());

        let addr: SocketAddr = "127.0.0.1:1700".parse().unwrap();
        tracker.set(addr).await;
        assert_eq!(tracker.get().await, Some(addr));

        let addr2: SocketAddr = "127.0.0.1:1701".parse().unwrap();
        tracker.set(addr2).await;
        assert_eq!(tracker.get().await, Some(addr2));
    }

    #[test]
    fn rxpk_decodes_into_uplink_event() {
        use base64::Engine;
        let rxpk = Rxpk {
            time: None,
            tmst: Some(12345),
            tmms: None,
            chan: Some(1),
            rfch: None,
            freq: 868.1,
            lsnr: Some(7.5),
            rssi: -42.0,
            modu: Some("LORA".into()),
            datr: "SF7BW125".into(),
            codr: Some("4/5".into()),
            size: 4,
            data: base64::engine::general_purpose::STANDARD.encode([1, 2, 3, 4]),
        };
        let event = rxpk_to_event(&rxpk, [0; 8]).unwrap();
        assert_eq!(event.frame.data, vec![1, 2, 3, 4]);
        assert_eq!(event.rssi, -42.0);
    }

    #[test]
    fn to_wire_txpk_base64_encodes_data() {
        use base64::Engine;
        let frame = TxFrame {
            tmst: 1000,
            freq: 869.525,
            modu: "LORA".into(),
            datr: "SF12BW125".into(),
            codr: "4/5".into(),
            data: vec![9, 9, 9],
            ipol: true,
            powe: 14,
        };
        let txpk = to_wire_txpk(&frame);
        assert_eq!(txpk.data, base64::engine::general_purpose::STANDARD.encode([9, 9, 9]));
        assert_eq!(txpk.size, 3);
        assert_eq!(txpk.imme, Some(false));
    }
}
