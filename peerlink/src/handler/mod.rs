pub(crate) mod candidate;
pub(crate) mod channel;
pub(crate) mod demuxer;
pub(crate) mod media;
pub(crate) mod message;
pub(crate) mod mux;
pub(crate) mod secure;

use std::collections::VecDeque;

use log::warn;

use shared::error::Result;
use shared::{Protocol, TaggedBytesMut};

use crate::connection::Connection;
use crate::handler::candidate::{CandidateContext, CandidateHandler};
use crate::handler::channel::{ChannelContext, ChannelHandler};
use crate::handler::demuxer::{DemuxerContext, DemuxerHandler};
use crate::handler::media::{MediaContext, MediaHandler};
use crate::handler::message::TaggedEngineMessage;
use crate::handler::mux::{MuxContext, MuxHandler};
use crate::handler::secure::{SecureContext, SecureHandler};

/*
 Pipeline flow (read path):
 Raw bytes -> Demuxer -> Candidate -> Secure -> Mux -> Channel -> Media -> queues/events

 Pipeline flow (write path):
 Application -> Media -> Channel -> Mux -> Secure -> Candidate -> Demuxer -> Raw bytes
*/

#[derive(Default)]
pub(crate) struct PipelineContext {
    pub(crate) demuxer: DemuxerContext,
    pub(crate) candidate: CandidateContext,
    pub(crate) secure: SecureContext,
    pub(crate) mux: MuxContext,
    pub(crate) channel: ChannelContext,
    pub(crate) media: MediaContext,

    /// Application messages queued for the next write walk
    pub(crate) write_ins: VecDeque<TaggedEngineMessage>,
    /// Finished raw datagrams awaiting the embedder
    pub(crate) raw_outs: VecDeque<TaggedBytesMut>,
}

impl Connection {
    pub(crate) fn get_demuxer_handler(&mut self) -> DemuxerHandler<'_> {
        DemuxerHandler::new(&mut self.pipeline.demuxer)
    }

    pub(crate) fn get_candidate_handler(&mut self) -> CandidateHandler<'_> {
        CandidateHandler::new(&mut self.pipeline.candidate)
    }

    pub(crate) fn get_secure_handler(&mut self) -> SecureHandler<'_> {
        SecureHandler::new(&mut self.pipeline.secure)
    }

    pub(crate) fn get_mux_handler(&mut self) -> MuxHandler<'_> {
        MuxHandler::new(&mut self.pipeline.mux)
    }

    pub(crate) fn get_channel_handler(&mut self) -> ChannelHandler<'_> {
        ChannelHandler::new(
            &mut self.pipeline.channel,
            &mut self.channels,
            &mut self.stream_index,
        )
    }

    pub(crate) fn get_media_handler(&mut self) -> MediaHandler<'_> {
        MediaHandler::new(
            &mut self.pipeline.media,
            &mut self.tracks,
            &mut self.ssrc_index,
        )
    }

    /// Run one raw datagram up the read pipeline.
    pub(crate) fn pipeline_read(&mut self, msg: TaggedBytesMut) -> Result<()> {
        let mut queue: VecDeque<TaggedEngineMessage> = VecDeque::new();
        {
            let mut handler = self.get_demuxer_handler();
            handler.handle_read(msg)?;
            while let Some(out) = handler.poll_read() {
                queue.push_back(out);
            }
        }

        macro_rules! read_stage {
            ($getter:ident) => {{
                let mut handler = self.$getter();
                while let Some(msg) = queue.pop_front() {
                    handler.handle_read(msg)?;
                }
                while let Some(out) = handler.poll_read() {
                    queue.push_back(out);
                }
            }};
        }

        read_stage!(get_candidate_handler);
        read_stage!(get_secure_handler);
        read_stage!(get_mux_handler);
        read_stage!(get_channel_handler);
        read_stage!(get_media_handler);

        for leftover in queue {
            warn!("unrouted inbound message {:?}", leftover.message);
        }
        Ok(())
    }

    /// Walk the write pipeline: queued application messages flow down,
    /// and every layer drains its own pending output on the way.
    pub(crate) fn pipeline_write_flush(&mut self) {
        let mut queue: VecDeque<TaggedEngineMessage> =
            std::mem::take(&mut self.pipeline.write_ins);

        macro_rules! write_stage {
            ($getter:ident) => {{
                let mut handler = self.$getter();
                while let Some(msg) = queue.pop_front() {
                    if let Err(err) = handler.handle_write(msg) {
                        warn!("{}.handle_write got error: {}", handler.name(), err);
                    }
                }
                while let Some(out) = handler.poll_write() {
                    queue.push_back(out);
                }
            }};
        }

        write_stage!(get_media_handler);
        write_stage!(get_channel_handler);
        write_stage!(get_mux_handler);
        write_stage!(get_secure_handler);
        write_stage!(get_candidate_handler);

        // The demuxer flattens whatever survived into raw datagrams
        let mut finished: Vec<TaggedBytesMut> = Vec::new();
        {
            let mut handler = self.get_demuxer_handler();
            while let Some(msg) = queue.pop_front() {
                if let Err(err) = handler.handle_write(msg) {
                    warn!("{}.handle_write got error: {}", handler.name(), err);
                }
            }
            while let Some(raw) = handler.poll_write() {
                finished.push(raw);
            }
        }
        self.pipeline.raw_outs.extend(finished);
    }
}
