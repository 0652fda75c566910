//! Channel bookkeeping for one session.
//!
//! Channel 0 is the control channel and is never in these maps. Nonzero ids
//! are allocated by the sender independently in each direction, so the same
//! id may be live inbound and outbound at once. Outbound channels drain in
//! round-robin order; one big transfer cannot starve the others.

use std::collections::{HashMap, VecDeque};

use nocturne_shared::types::FileId;

use crate::error::{Result, SessionError};
use crate::transfer::{InboundFile, OutboundFile};

pub const CONTROL_CHANNEL: u32 = 0;

#[derive(Default)]
pub struct ChannelMap {
    next_outbound: u32,
    outbound: HashMap<u32, OutboundFile>,
    inbound: HashMap<u32, InboundFile>,
    ready: VecDeque<u32>,
}

impl ChannelMap {
    pub fn new() -> Self {
        Self {
            next_outbound: 1,
            ..Self::default()
        }
    }

    /// Hand out the next outbound channel id. Ids are advertised in the
    /// file offer; the channel itself starts once the peer accepts.
    pub fn allocate_outbound(&mut self) -> u32 {
        let id = self.next_outbound;
        self.next_outbound = self.next_outbound.wrapping_add(1).max(1);
        id
    }

    pub fn start_outbound(&mut self, file: OutboundFile) {
        let channel = file.channel;
        self.outbound.insert(channel, file);
        self.ready.push_back(channel);
    }

    pub fn bind_inbound(&mut self, channel: u32, file: InboundFile) -> Result<()> {
        if channel == CONTROL_CHANNEL {
            return Err(SessionError::Protocol(
                "file data may not use the control channel".into(),
            ));
        }
        if self.inbound.contains_key(&channel) {
            return Err(SessionError::Protocol(format!(
                "inbound channel {channel} already bound"
            )));
        }
        self.inbound.insert(channel, file);
        Ok(())
    }

    pub fn inbound_mut(&mut self, channel: u32) -> Option<&mut InboundFile> {
        self.inbound.get_mut(&channel)
    }

    pub fn take_inbound(&mut self, channel: u32) -> Option<InboundFile> {
        self.inbound.remove(&channel)
    }

    pub fn outbound_mut(&mut self, channel: u32) -> Option<&mut OutboundFile> {
        self.outbound.get_mut(&channel)
    }

    /// Next outbound channel in round-robin order. The caller re-queues it
    /// with [`requeue`](Self::requeue) if the transfer is still going.
    pub fn next_ready(&mut self) -> Option<u32> {
        while let Some(channel) = self.ready.pop_front() {
            if self.outbound.contains_key(&channel) {
                return Some(channel);
            }
        }
        None
    }

    pub fn requeue(&mut self, channel: u32) {
        if self.outbound.contains_key(&channel) {
            self.ready.push_back(channel);
        }
    }

    pub fn has_ready(&self) -> bool {
        self.ready.iter().any(|c| self.outbound.contains_key(c))
    }

    pub fn remove_outbound(&mut self, channel: u32) -> Option<OutboundFile> {
        self.outbound.remove(&channel)
    }

    pub fn find_outbound_by_file(&self, file_id: FileId) -> Option<u32> {
        self.outbound
            .iter()
            .find(|(_, f)| f.file_id == file_id)
            .map(|(c, _)| *c)
    }

    pub fn find_inbound_by_file(&self, file_id: FileId) -> Option<u32> {
        self.inbound
            .iter()
            .find(|(_, f)| f.file_id == file_id)
            .map(|(c, _)| *c)
    }

    /// Tear everything down, returning the file ids that were mid-transfer.
    pub fn drain(&mut self) -> Vec<FileId> {
        self.ready.clear();
        let mut files: Vec<FileId> = self.outbound.drain().map(|(_, f)| f.file_id).collect();
        files.extend(self.inbound.drain().map(|(_, f)| f.file_id));
        files
    }
}
