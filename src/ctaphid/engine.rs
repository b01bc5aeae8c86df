//! CTAPHID transaction state machine.
//!
//! The engine is synchronous and owns all channel state. The dispatch loop
//! feeds it reports and acts on the returned [`Action`]; CTAP2 work happens
//! elsewhere and comes back through [`Engine::finish`].

use std::time::Instant;

use super::channel::{Assembly, ChannelTable, Message};
use super::packet::{error_report, fragment, parse_frame, Frame};
use super::types::*;
use super::CtapHidError;

#[derive(Debug)]
pub enum EngineState {
    Idle,
    Receiving(Assembly),
    Dispatching { cid: u32, cmd: u8 },
    Responding { cid: u32 },
    /// Cancel acknowledged; the worker has not returned yet.
    Cancelled { cid: u32 },
}

#[derive(Debug, PartialEq, Eq)]
pub enum Action {
    Reply(Vec<Report>),
    Dispatch(Message),
    /// Raise the worker's cancel flag for `cid` and send `reply`.
    Cancel { cid: u32, reply: Vec<Report> },
    None,
}

pub struct Engine {
    channels: ChannelTable,
    state: EngineState,
}

impl Engine {
    pub fn new(max_channels: usize) -> Self {
        Self { channels: ChannelTable::new(max_channels), state: EngineState::Idle }
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, EngineState::Idle)
    }

    /// Channel owed keepalives while a worker runs.
    pub fn keepalive_cid(&self) -> Option<u32> {
        match self.state {
            EngineState::Dispatching { cid, .. } => Some(cid),
            _ => None,
        }
    }

    fn transaction_cid(&self) -> Option<u32> {
        match &self.state {
            EngineState::Receiving(asm) => Some(asm.cid),
            EngineState::Dispatching { cid, .. } | EngineState::Cancelled { cid } => Some(*cid),
            EngineState::Idle | EngineState::Responding { .. } => None,
        }
    }

    /// Channel that must outlive reaping: the transaction owner, or the
    /// channel whose response is still going out.
    fn reap_exempt_cid(&self) -> Option<u32> {
        match self.state {
            EngineState::Responding { cid } => Some(cid),
            _ => self.transaction_cid(),
        }
    }

    pub fn on_report(&mut self, report: &Report, now: Instant) -> Action {
        match parse_frame(report) {
            Frame::Init { cid, cmd, bcnt, data } => {
                tracing::trace!(cid = format!("{cid:#010x}"), cmd = format!("{cmd:#04x}"), bcnt, "INIT frame");
                self.on_init(cid, cmd, bcnt, data, now)
            }
            Frame::Cont { cid, seq, data } => {
                tracing::trace!(cid = format!("{cid:#010x}"), seq, "CONT frame");
                self.on_cont(cid, seq, &data, now)
            }
        }
    }

    fn on_init(&mut self, cid: u32, cmd: u8, bcnt: u16, data: Vec<u8>, now: Instant) -> Action {
        if cid == RESERVED_CID {
            return reject(BROADCAST_CID, CtapHidError::InvalidChannel(cid));
        }
        if cmd == CMD_INIT {
            return self.handle_init(cid, bcnt, &data, now);
        }
        if cid == BROADCAST_CID || !self.channels.contains(cid) {
            return reject(cid, CtapHidError::InvalidChannel(cid));
        }
        if bcnt as usize > MAX_MESSAGE_SIZE {
            return reject(cid, CtapHidError::InvalidLen(bcnt as usize));
        }

        match &self.state {
            EngineState::Idle | EngineState::Responding { .. } => {}
            EngineState::Receiving(asm) if asm.cid != cid => return reject(cid, CtapHidError::ChannelBusy),
            EngineState::Receiving(asm) => {
                let pending = asm.cmd;
                self.state = EngineState::Idle;
                if cmd == CMD_CANCEL {
                    tracing::debug!(cid = format!("{cid:#010x}"), "Partial message cancelled");
                    return Action::Reply(cancel_reply(cid, pending));
                }
                tracing::debug!(cid = format!("{cid:#010x}"), "New command interrupted reassembly");
                return Action::Reply(vec![error_report(cid, ERR_INVALID_SEQ)]);
            }
            EngineState::Dispatching { cid: active, cmd: pending } => {
                let (active, pending) = (*active, *pending);
                if active != cid || cmd != CMD_CANCEL {
                    return reject(cid, CtapHidError::ChannelBusy);
                }
                tracing::info!(cid = format!("{cid:#010x}"), "Request cancelled");
                self.state = EngineState::Cancelled { cid };
                return Action::Cancel { cid, reply: cancel_reply(cid, pending) };
            }
            EngineState::Cancelled { cid: active } => {
                if *active == cid && cmd == CMD_CANCEL {
                    return Action::None;
                }
                return reject(cid, CtapHidError::ChannelBusy);
            }
        }

        if cmd == CMD_CANCEL {
            // Nothing in flight.
            return Action::None;
        }
        self.channels.touch(cid, now);
        if bcnt as usize <= INIT_DATA_SIZE {
            return self.complete(Message { cid, cmd, payload: data });
        }
        self.state = EngineState::Receiving(Assembly::start(cid, cmd, bcnt, data, now));
        Action::None
    }

    fn on_cont(&mut self, cid: u32, seq: u8, data: &[u8], now: Instant) -> Action {
        let busy = self.transaction_cid().is_some_and(|active| active != cid);
        let EngineState::Receiving(asm) = &mut self.state else {
            return reject(cid, if busy { CtapHidError::ChannelBusy } else { CtapHidError::InvalidSeq(seq) });
        };
        if busy {
            return reject(cid, CtapHidError::ChannelBusy);
        }
        match asm.push(seq, data) {
            Ok(None) => Action::None,
            Ok(Some(msg)) => {
                self.state = EngineState::Idle;
                self.channels.touch(cid, now);
                self.complete(msg)
            }
            Err(e) => {
                self.state = EngineState::Idle;
                reject(cid, e)
            }
        }
    }

    fn handle_init(&mut self, cid: u32, bcnt: u16, nonce: &[u8], now: Instant) -> Action {
        if bcnt as usize != INIT_NONCE_SIZE {
            return reject(cid, CtapHidError::InvalidLen(bcnt as usize));
        }
        let new_cid = if cid == BROADCAST_CID {
            let exempt = self.reap_exempt_cid();
            match self.channels.allocate(now, exempt) {
                Ok(new_cid) => new_cid,
                Err(e) => {
                    tracing::warn!("All channels in use, rejecting INIT");
                    return reject(cid, e);
                }
            }
        } else if self.channels.contains(cid) {
            self.channels.touch(cid, now);
            cid
        } else {
            return reject(cid, CtapHidError::InvalidChannel(cid));
        };
        tracing::debug!(cid = format!("{new_cid:#010x}"), "Channel ready");

        let mut response = [0u8; INIT_RESPONSE_SIZE];
        response[0..8].copy_from_slice(&nonce[..INIT_NONCE_SIZE]);
        response[8..12].copy_from_slice(&new_cid.to_be_bytes());
        response[12] = CTAPHID_PROTOCOL_VERSION;
        response[13] = DEVICE_VERSION_MAJOR;
        response[14] = DEVICE_VERSION_MINOR;
        response[15] = DEVICE_VERSION_BUILD;
        response[16] = PIKEY_CAPABILITIES;
        let reply = fragment(cid, CMD_INIT, &response);

        // INIT on the channel that owns the transaction aborts it.
        match self.state {
            EngineState::Receiving(ref asm) if asm.cid == cid => {
                self.state = EngineState::Idle;
                Action::Reply(reply)
            }
            EngineState::Dispatching { cid: active, .. } if active == cid => {
                self.state = EngineState::Cancelled { cid };
                Action::Cancel { cid, reply }
            }
            _ => Action::Reply(reply),
        }
    }

    fn complete(&mut self, msg: Message) -> Action {
        let cid = msg.cid;
        match msg.cmd {
            CMD_PING => Action::Reply(fragment(cid, CMD_PING, &msg.payload)),
            CMD_WINK => {
                tracing::info!(cid = format!("{cid:#010x}"), "Wink");
                Action::Reply(fragment(cid, CMD_WINK, &[]))
            }
            CMD_CBOR if msg.payload.is_empty() => reject(cid, CtapHidError::InvalidLen(0)),
            CMD_CBOR | CMD_STATUS => {
                self.state = EngineState::Dispatching { cid, cmd: msg.cmd };
                Action::Dispatch(msg)
            }
            CMD_CANCEL => Action::None,
            other => reject(cid, CtapHidError::InvalidCmd(other)),
        }
    }

    /// Frame a worker result. A result for a cancelled request is dropped.
    pub fn finish(&mut self, cid: u32, cmd: u8, response: &[u8]) -> Vec<Report> {
        match self.state {
            EngineState::Dispatching { cid: active, .. } if active == cid => {
                self.state = EngineState::Responding { cid };
                fragment(cid, cmd, response)
            }
            EngineState::Cancelled { cid: active } if active == cid => {
                tracing::debug!(cid = format!("{cid:#010x}"), "Discarding result of cancelled request");
                self.state = EngineState::Idle;
                Vec::new()
            }
            _ => {
                tracing::warn!(cid = format!("{cid:#010x}"), "Result for a request that is no longer active");
                Vec::new()
            }
        }
    }

    /// The response reports have been handed to the transport.
    pub fn sent(&mut self) {
        if let EngineState::Responding { cid } = self.state {
            self.state = EngineState::Idle;
            self.channels.touch(cid, Instant::now());
        }
    }

    /// Periodic housekeeping: abandon a stalled reassembly and reap idle
    /// channels.
    pub fn expire(&mut self, now: Instant) -> Option<Report> {
        if let EngineState::Receiving(asm) = &self.state {
            if now >= asm.deadline {
                let cid = asm.cid;
                tracing::warn!(cid = format!("{cid:#010x}"), "Message assembly timed out");
                self.state = EngineState::Idle;
                return Some(error_report(cid, CtapHidError::Timeout.code()));
            }
        }
        if self.is_idle() {
            self.channels.reap(now, None);
        }
        None
    }
}

fn reject(cid: u32, e: CtapHidError) -> Action {
    tracing::debug!(cid = format!("{cid:#010x}"), error = %e, "Frame rejected");
    Action::Reply(vec![error_report(cid, e.code())])
}

fn cancel_reply(cid: u32, pending: u8) -> Vec<Report> {
    if pending == CMD_CBOR {
        fragment(cid, CMD_CBOR, &[CTAP2_ERR_KEEPALIVE_CANCEL])
    } else {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CHANNEL_TIMEOUT_SECS;
    use std::time::Duration;

    fn open_channel(engine: &mut Engine, now: Instant) -> u32 {
        let reports = fragment(BROADCAST_CID, CMD_INIT, &[1, 2, 3, 4, 5, 6, 7, 8]);
        let Action::Reply(reply) = engine.on_report(&reports[0], now) else {
            panic!("INIT must be answered inline");
        };
        assert_eq!(&reply[0][7..15], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(reply[0][23], PIKEY_CAPABILITIES);
        u32::from_be_bytes([reply[0][15], reply[0][16], reply[0][17], reply[0][18]])
    }

    fn error_code(action: &Action) -> Option<u8> {
        match action {
            Action::Reply(reports) if reports.len() == 1 && reports[0][4] == CMD_ERROR | 0x80 => Some(reports[0][7]),
            _ => None,
        }
    }

    #[test]
    fn test_reassembles_one_to_sixteen_continuation_frames() {
        let now = Instant::now();
        let mut engine = Engine::new(4);
        let cid = open_channel(&mut engine, now);

        for n in 1..=16usize {
            let len = INIT_DATA_SIZE + (n - 1) * CONT_DATA_SIZE + 1;
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let reports = fragment(cid, CMD_CBOR, &payload);
            assert_eq!(reports.len(), n + 1);

            for report in &reports[..n] {
                assert_eq!(engine.on_report(report, now), Action::None);
            }
            let action = engine.on_report(&reports[n], now);
            assert_eq!(action, Action::Dispatch(Message { cid, cmd: CMD_CBOR, payload }));

            let out = engine.finish(cid, CMD_CBOR, &[0x00]);
            assert_eq!(out.len(), 1);
            engine.sent();
            assert!(engine.is_idle());
        }
    }

    #[test]
    fn test_cancel_after_first_frame_returns_to_idle() {
        let now = Instant::now();
        let mut engine = Engine::new(4);
        let cid = open_channel(&mut engine, now);
        let reports = fragment(cid, CMD_CBOR, &[7u8; 300]);
        assert_eq!(engine.on_report(&reports[0], now), Action::None);

        let cancel = fragment(cid, CMD_CANCEL, &[]);
        let Action::Reply(reply) = engine.on_report(&cancel[0], now) else {
            panic!("cancel mid-receive must reply");
        };
        assert_eq!(reply[0][4], CMD_CBOR | 0x80);
        assert_eq!(reply[0][7], CTAP2_ERR_KEEPALIVE_CANCEL);
        assert!(engine.is_idle());

        // The rest of the abandoned message is rejected, fresh commands work.
        assert_eq!(error_code(&engine.on_report(&reports[1], now)), Some(ERR_INVALID_SEQ));
        let ping = fragment(cid, CMD_PING, b"again");
        assert_eq!(engine.on_report(&ping[0], now), Action::Reply(fragment(cid, CMD_PING, b"again")));
    }

    #[test]
    fn test_other_channel_is_busy_while_receiving() {
        let now = Instant::now();
        let mut engine = Engine::new(4);
        let a = open_channel(&mut engine, now);
        let b = open_channel(&mut engine, now);
        let reports = fragment(a, CMD_CBOR, &[1u8; 100]);
        engine.on_report(&reports[0], now);

        let ping = fragment(b, CMD_PING, b"x");
        assert_eq!(error_code(&engine.on_report(&ping[0], now)), Some(ERR_CHANNEL_BUSY));
        let cont = fragment(b, CMD_CBOR, &[0u8; 100]);
        assert_eq!(error_code(&engine.on_report(&cont[1], now)), Some(ERR_CHANNEL_BUSY));

        // Broadcast INIT is always served.
        open_channel(&mut engine, now);
        assert!(matches!(engine.state(), EngineState::Receiving(_)));

        assert!(matches!(engine.on_report(&reports[1], now), Action::Dispatch(_)));
        assert_eq!(error_code(&engine.on_report(&ping[0], now)), Some(ERR_CHANNEL_BUSY));
    }

    #[test]
    fn test_framing_errors() {
        let now = Instant::now();
        let mut engine = Engine::new(4);
        let cid = open_channel(&mut engine, now);

        let cont = fragment(cid, CMD_CBOR, &[0u8; 100]);
        assert_eq!(error_code(&engine.on_report(&cont[1], now)), Some(ERR_INVALID_SEQ));

        let mut oversized = fragment(cid, CMD_CBOR, &[0u8; 10])[0];
        oversized[5..7].copy_from_slice(&((MAX_MESSAGE_SIZE + 1) as u16).to_be_bytes());
        assert_eq!(error_code(&engine.on_report(&oversized, now)), Some(ERR_INVALID_LEN));

        let unknown = fragment(0x1234_5678, CMD_PING, b"x");
        assert_eq!(error_code(&engine.on_report(&unknown[0], now)), Some(ERR_INVALID_CHANNEL));

        let bad_cmd = fragment(cid, 0x7E, &[]);
        assert_eq!(error_code(&engine.on_report(&bad_cmd[0], now)), Some(ERR_INVALID_CMD));

        let empty_cbor = fragment(cid, CMD_CBOR, &[]);
        assert_eq!(error_code(&engine.on_report(&empty_cbor[0], now)), Some(ERR_INVALID_LEN));

        let cancel = fragment(cid, CMD_CANCEL, &[]);
        assert_eq!(engine.on_report(&cancel[0], now), Action::None);
    }

    #[test]
    fn test_different_command_mid_receive() {
        let now = Instant::now();
        let mut engine = Engine::new(4);
        let cid = open_channel(&mut engine, now);
        engine.on_report(&fragment(cid, CMD_CBOR, &[0u8; 100])[0], now);
        let ping = fragment(cid, CMD_PING, b"x");
        assert_eq!(error_code(&engine.on_report(&ping[0], now)), Some(ERR_INVALID_SEQ));
        assert!(engine.is_idle());
    }

    #[test]
    fn test_cancel_during_dispatch_discards_result() {
        let now = Instant::now();
        let mut engine = Engine::new(4);
        let cid = open_channel(&mut engine, now);
        assert!(matches!(engine.on_report(&fragment(cid, CMD_CBOR, &[0x04])[0], now), Action::Dispatch(_)));
        assert_eq!(engine.keepalive_cid(), Some(cid));

        let cancel = fragment(cid, CMD_CANCEL, &[]);
        let Action::Cancel { cid: cancelled, reply } = engine.on_report(&cancel[0], now) else {
            panic!("cancel during dispatch must raise the flag");
        };
        assert_eq!(cancelled, cid);
        assert_eq!(reply[0][7], CTAP2_ERR_KEEPALIVE_CANCEL);
        assert_eq!(engine.keepalive_cid(), None);

        assert!(engine.finish(cid, CMD_CBOR, &[0x00, 0xA0]).is_empty());
        assert!(engine.is_idle());
    }

    #[test]
    fn test_init_on_receiving_channel_aborts() {
        let now = Instant::now();
        let mut engine = Engine::new(4);
        let cid = open_channel(&mut engine, now);
        engine.on_report(&fragment(cid, CMD_CBOR, &[0u8; 100])[0], now);

        let init = fragment(cid, CMD_INIT, &[9u8; 8]);
        let Action::Reply(reply) = engine.on_report(&init[0], now) else {
            panic!("INIT must be answered");
        };
        assert_eq!(u32::from_be_bytes([reply[0][15], reply[0][16], reply[0][17], reply[0][18]]), cid);
        assert!(engine.is_idle());
    }

    #[test]
    fn test_stalled_assembly_times_out() {
        let now = Instant::now();
        let mut engine = Engine::new(4);
        let cid = open_channel(&mut engine, now);
        engine.on_report(&fragment(cid, CMD_CBOR, &[0u8; 100])[0], now);

        assert!(engine.expire(now + Duration::from_millis(100)).is_none());
        let report = engine.expire(now + Duration::from_millis(3100)).unwrap();
        assert_eq!(report[7], ERR_MSG_TIMEOUT);
        assert!(engine.is_idle());
    }

    #[test]
    fn test_status_is_dispatched() {
        let now = Instant::now();
        let mut engine = Engine::new(4);
        let cid = open_channel(&mut engine, now);
        let status = fragment(cid, CMD_STATUS, &[]);
        assert_eq!(
            engine.on_report(&status[0], now),
            Action::Dispatch(Message { cid, cmd: CMD_STATUS, payload: vec![] })
        );
    }

    #[test]
    fn test_long_request_channel_survives_broadcast_init() {
        let now = Instant::now();
        let mut engine = Engine::new(4);
        let cid = open_channel(&mut engine, now);
        assert!(matches!(engine.on_report(&fragment(cid, CMD_CBOR, &[0x01])[0], now), Action::Dispatch(_)));

        // User presence takes longer than the idle timeout; another client
        // opens a channel meanwhile.
        let later = now + Duration::from_secs(CHANNEL_TIMEOUT_SECS + 1);
        let other = open_channel(&mut engine, later);
        assert_ne!(other, cid);
        assert_eq!(engine.keepalive_cid(), Some(cid));

        let out = engine.finish(cid, CMD_CBOR, &[0x00]);
        assert_eq!(out, fragment(cid, CMD_CBOR, &[0x00]));
        engine.sent();
        let ping = fragment(cid, CMD_PING, b"still here");
        assert_eq!(engine.on_report(&ping[0], later), Action::Reply(fragment(cid, CMD_PING, b"still here")));
    }

    #[test]
    fn test_response_channel_survives_broadcast_init() {
        let now = Instant::now();
        let mut engine = Engine::new(4);
        let cid = open_channel(&mut engine, now);
        engine.on_report(&fragment(cid, CMD_CBOR, &[0x04])[0], now);
        let later = now + Duration::from_secs(CHANNEL_TIMEOUT_SECS + 1);
        assert!(!engine.finish(cid, CMD_CBOR, &[0x00]).is_empty());

        open_channel(&mut engine, later);
        engine.sent();
        let ping = fragment(cid, CMD_PING, b"x");
        assert_eq!(engine.on_report(&ping[0], later), Action::Reply(fragment(cid, CMD_PING, b"x")));
    }
}
