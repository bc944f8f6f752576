//! Frame codec
//!
//! Reassembles frames from a byte stream. Partial frames stay buffered until
//! the rest arrives; several frames in one read are yielded one by one.

use crate::network::message::{Frame, Header, HEADER_LEN};
use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Frame codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Frame body of {len} bytes exceeds limit of {max}")]
    Oversized { len: usize, max: usize },
}

/// Length-prefixed frame codec
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_body: usize,
}

impl FrameCodec {
    pub fn new(max_body: usize) -> Self {
        Self { max_body }
    }

    pub fn max_body(&self) -> usize {
        self.max_body
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match Header::peek(src) {
            Some(header) => header,
            None => return Ok(None),
        };

        let len = header.len as usize;
        if len > self.max_body {
            return Err(CodecError::Oversized {
                len,
                max: self.max_body,
            });
        }

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();

        Ok(Some(Frame {
            version: header.version,
            ctrl: header.ctrl,
            action: header.action,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.payload.len() > self.max_body {
            return Err(CodecError::Oversized {
                len: item.payload.len(),
                max: self.max_body,
            });
        }

        dst.reserve(item.wire_len());
        item.header().write(dst);
        dst.put_slice(&item.payload);
        Ok(())
    }
}
