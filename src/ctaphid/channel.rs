use super::{CtapHidError, types::*};
use crate::config::{CHANNEL_TIMEOUT_SECS, MESSAGE_TIMEOUT_MS};
use rand::{Rng, SeedableRng, rngs::StdRng};
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub cid: u32,
    pub cmd: u8,
    pub payload: Vec<u8>,
}

/// Allocated channel ids and when each was last used.
pub struct ChannelTable {
    channels: HashMap<u32, Instant>,
    max_channels: usize,
    rng: StdRng,
}

impl ChannelTable {
    pub fn new(max_channels: usize) -> Self {
        Self {
            channels: HashMap::new(),
            max_channels,
            rng: StdRng::from_entropy(),
        }
    }

    /// Allocate a fresh channel id. `busy` names a channel with a transaction
    /// in flight, which survives the reap that precedes allocation.
    pub fn allocate(&mut self, now: Instant, busy: Option<u32>) -> Result<u32, CtapHidError> {
        self.reap(now, busy);
        if self.channels.len() >= self.max_channels {
            return Err(CtapHidError::ChannelBusy);
        }
        loop {
            let cid: u32 = self.rng.r#gen();
            if cid != RESERVED_CID && cid != BROADCAST_CID && !self.channels.contains_key(&cid) {
                self.channels.insert(cid, now);
                return Ok(cid);
            }
        }
    }

    pub fn contains(&self, cid: u32) -> bool {
        self.channels.contains_key(&cid)
    }

    pub fn touch(&mut self, cid: u32, now: Instant) {
        if let Some(last) = self.channels.get_mut(&cid) {
            *last = now;
        }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Forget channels idle for longer than the channel timeout, except `busy`.
    pub fn reap(&mut self, now: Instant, busy: Option<u32>) {
        let timeout = Duration::from_secs(CHANNEL_TIMEOUT_SECS);
        let before = self.channels.len();
        self.channels
            .retain(|cid, last| busy == Some(*cid) || now.saturating_duration_since(*last) < timeout);
        let reaped = before - self.channels.len();
        if reaped > 0 {
            tracing::debug!(reaped, "Reaped idle channels");
        }
    }
}

/// A message being reassembled from continuation frames.
#[derive(Debug)]
pub struct Assembly {
    pub cid: u32,
    pub cmd: u8,
    bcnt: usize,
    data: Vec<u8>,
    next_seq: u8,
    pub deadline: Instant,
}

impl Assembly {
    pub fn start(cid: u32, cmd: u8, bcnt: u16, data: Vec<u8>, now: Instant) -> Self {
        Self {
            cid,
            cmd,
            bcnt: bcnt as usize,
            data,
            next_seq: 0,
            deadline: now + Duration::from_millis(MESSAGE_TIMEOUT_MS),
        }
    }

    /// Append one continuation frame. Returns the message once `bcnt` bytes
    /// have arrived.
    pub fn push(&mut self, seq: u8, chunk: &[u8]) -> Result<Option<Message>, CtapHidError> {
        if seq != self.next_seq || seq > MAX_SEQ {
            return Err(CtapHidError::InvalidSeq(seq));
        }
        self.next_seq += 1;
        let take = (self.bcnt - self.data.len()).min(chunk.len());
        self.data.extend_from_slice(&chunk[..take]);
        if self.data.len() < self.bcnt {
            return Ok(None);
        }
        Ok(Some(Message { cid: self.cid, cmd: self.cmd, payload: std::mem::take(&mut self.data) }))
    }
}
