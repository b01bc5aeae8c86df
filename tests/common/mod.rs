#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ciborium::value::Value;
use pikey::backend::cipher::AesGcmCipher;
use pikey::backend::{FallbackManager, SoftwareBackend};
use pikey::config::AlgorithmMode;
use pikey::ctap2::Authenticator;
use pikey::ctaphid::types::*;
use pikey::store::CredentialStore;
use pikey::up::{AutoConfirm, UserPresence};
use tokio::sync::mpsc;
use tokio::time::timeout;

pub fn software_backend(dir: &Path) -> Arc<FallbackManager> {
    let sw = SoftwareBackend::open(dir, Box::new(AesGcmCipher::new([3u8; 32])), 64, [4u8; 32]).unwrap();
    Arc::new(FallbackManager::new(None, sw))
}

pub fn authenticator_with(dir: &Path, presence: Box<dyn UserPresence>) -> Arc<Authenticator> {
    let backend = software_backend(dir);
    let store = CredentialStore::open(backend.clone(), None).unwrap();
    Arc::new(
        Authenticator::new(store, backend, presence, AlgorithmMode::Classical, Duration::from_secs(2)).unwrap(),
    )
}

pub fn authenticator(dir: &Path) -> Arc<Authenticator> {
    authenticator_with(dir, Box::new(AutoConfirm))
}

pub fn make_init_packet(cid: u32, cmd: u8, payload: &[u8]) -> Report {
    let mut pkt = [0u8; 64];
    pkt[0..4].copy_from_slice(&cid.to_be_bytes());
    pkt[4] = cmd | 0x80;
    let bcnt = payload.len() as u16;
    pkt[5..7].copy_from_slice(&bcnt.to_be_bytes());
    let len = payload.len().min(INIT_DATA_SIZE);
    pkt[7..7 + len].copy_from_slice(&payload[..len]);
    pkt
}

/// A host talking to a running CTAPHID loop over in-memory report channels.
pub struct Host {
    pub tx: mpsc::Sender<Report>,
    pub rx: mpsc::Receiver<Report>,
}

impl Host {
    pub fn start(auth: Arc<Authenticator>) -> Self {
        let (tx, incoming_rx) = mpsc::channel(64);
        let (outgoing_tx, rx) = mpsc::channel(64);
        tokio::spawn(pikey::ctaphid::run_ctaphid_loop(incoming_rx, outgoing_tx, auth));
        Self { tx, rx }
    }

    pub async fn send(&self, cid: u32, cmd: u8, payload: &[u8]) {
        for report in pikey::ctaphid::packet::fragment(cid, cmd, payload) {
            self.tx.send(report).await.unwrap();
        }
    }

    pub async fn recv_report(&mut self) -> Report {
        timeout(Duration::from_secs(5), self.rx.recv())
            .await
            .expect("timed out waiting for a report")
            .expect("loop closed its outgoing channel")
    }

    /// Next complete message, skipping keepalives.
    pub async fn recv(&mut self) -> (u32, u8, Vec<u8>) {
        let first = loop {
            let report = self.recv_report().await;
            if report[4] != CMD_KEEPALIVE | 0x80 {
                break report;
            }
        };
        let cid = u32::from_be_bytes([first[0], first[1], first[2], first[3]]);
        let cmd = first[4] & 0x7F;
        let bcnt = u16::from_be_bytes([first[5], first[6]]) as usize;
        let mut payload = first[7..7 + bcnt.min(INIT_DATA_SIZE)].to_vec();
        let mut seq = 0u8;
        while payload.len() < bcnt {
            let cont = self.recv_report().await;
            assert_eq!(u32::from_be_bytes([cont[0], cont[1], cont[2], cont[3]]), cid);
            assert_eq!(cont[4], seq);
            seq += 1;
            let take = (bcnt - payload.len()).min(CONT_DATA_SIZE);
            payload.extend_from_slice(&cont[5..5 + take]);
        }
        (cid, cmd, payload)
    }

    /// INIT on the broadcast channel; returns the allocated CID.
    pub async fn init(&mut self) -> u32 {
        let nonce = [9u8; 8];
        self.send(BROADCAST_CID, CMD_INIT, &nonce).await;
        let (cid, cmd, payload) = self.recv().await;
        assert_eq!(cid, BROADCAST_CID);
        assert_eq!(cmd, CMD_INIT);
        assert_eq!(&payload[..8], &nonce);
        u32::from_be_bytes([payload[8], payload[9], payload[10], payload[11]])
    }

    /// One CBOR command; returns the status byte and the CBOR body.
    pub async fn cbor(&mut self, cid: u32, command: u8, params: Option<Value>) -> (u8, Vec<u8>) {
        let mut payload = vec![command];
        if let Some(params) = params {
            ciborium::into_writer(&params, &mut payload).unwrap();
        }
        self.send(cid, CMD_CBOR, &payload).await;
        let (resp_cid, cmd, body) = self.recv().await;
        assert_eq!(resp_cid, cid);
        assert_eq!(cmd, CMD_CBOR);
        (body[0], body[1..].to_vec())
    }
}

pub fn iv(i: i64) -> Value {
    Value::Integer(i.into())
}

pub fn tv(s: &str) -> Value {
    Value::Text(s.into())
}

pub fn bv(b: &[u8]) -> Value {
    Value::Bytes(b.to_vec())
}

pub fn cbor_map_get<'a>(map: &'a [(Value, Value)], key: i64) -> Option<&'a Value> {
    map.iter().find(|(k, _)| k == &iv(key)).map(|(_, v)| v)
}

pub fn parse_map(bytes: &[u8]) -> Vec<(Value, Value)> {
    match ciborium::from_reader(bytes).unwrap() {
        Value::Map(map) => map,
        other => panic!("expected a CBOR map, got {other:?}"),
    }
}

pub fn as_bytes(value: Option<&Value>) -> Vec<u8> {
    match value {
        Some(Value::Bytes(b)) => b.clone(),
        other => panic!("expected bytes, got {other:?}"),
    }
}
