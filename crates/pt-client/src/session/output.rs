//! Terminal output decoding

use std::io::{self, Read};

use bytes::Bytes;
use pt_protocol::{TerminalData, MAX_MESSAGE_SIZE};

/// Largest decompressed payload accepted from one frame
pub const MAX_INFLATED_SIZE: usize = MAX_MESSAGE_SIZE;

/// Decompress a zstd payload into `out`, failing once it would exceed `limit`
pub fn inflate_into(data: &[u8], limit: usize, out: &mut Vec<u8>) -> io::Result<()> {
    let mut limited = zstd::stream::read::Decoder::new(data)?.take(limit as u64 + 1);
    limited.read_to_end(out)?;
    if out.len() > limit {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("compressed frame inflates past {} bytes", limit),
        ));
    }
    Ok(())
}

/// Turns incoming data frames into raw terminal bytes
#[derive(Debug, Default)]
pub struct OutputDecoder {
    scratch: Vec<u8>,
}

impl OutputDecoder {
    /// Create a decoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw bytes of one frame, decompressing zstd frames when flagged
    pub fn decode(&mut self, frame: TerminalData) -> io::Result<Bytes> {
        if !frame.compressed {
            return Ok(frame.data);
        }

        self.scratch.clear();
        let inflated = inflate_into(&frame.data, MAX_INFLATED_SIZE, &mut self.scratch);
        let result = inflated.map(|()| Bytes::copy_from_slice(&self.scratch));
        self.scratch.clear();
        result
    }
}
