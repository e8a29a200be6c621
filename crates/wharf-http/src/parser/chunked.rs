use bytes::{Buf, Bytes, BytesMut};

use crate::{
    headers::Headers,
    parser::{read_line, trim},
    HttpConfig, ParseError,
};

/// Decoder for `Transfer-Encoding: chunked` bodies.
#[derive(Default)]
pub(crate) struct ChunkedDecoder {
    state: ChunkState,
    line: Vec<u8>,
}

#[derive(Default)]
enum ChunkState {
    #[default]
    Size,
    Data(usize),
    DataEnd,
    Trailer,
}

impl ChunkedDecoder {
    /// Decode chunk data from `data` into `body`, and trailer fields into `trailer`.
    ///
    /// Returns true once the terminating chunk and trailer have been read.
    pub fn decode(
        &mut self,
        data: &mut Bytes,
        body: &mut BytesMut,
        trailer: &mut Headers,
        config: &HttpConfig,
    ) -> Result<bool, ParseError> {
        loop {
            match &mut self.state {
                ChunkState::Size => {
                    let Some(line) = read_line(&mut self.line, data, config.max_line_length)? else {
                        return Ok(false);
                    };

                    // Chunk extensions are ignored
                    let size = line.split(';').next().map(trim).unwrap_or("");
                    let size = usize::from_str_radix(size, 16)
                        .map_err(|_| ParseError::bad_request("Wrong content encoding"))?;

                    if body.len().saturating_add(size) > config.max_content_length {
                        return Err(ParseError::new(413, "Content too large"));
                    }

                    self.state = if size == 0 {
                        ChunkState::Trailer
                    } else {
                        ChunkState::Data(size)
                    };
                }
                ChunkState::Data(remaining) => {
                    if data.is_empty() {
                        return Ok(false);
                    }

                    let count = (*remaining).min(data.len());
                    *remaining -= count;
                    if *remaining == 0 {
                        self.state = ChunkState::DataEnd;
                    }

                    body.extend_from_slice(&data.split_to(count));
                }
                ChunkState::DataEnd => {
                    let Some(&byte) = data.first() else {
                        return Ok(false);
                    };

                    // Chunk data must be followed directly by the line terminator
                    match byte {
                        b'\r' => data.advance(1),
                        b'\n' => {
                            data.advance(1);
                            self.state = ChunkState::Size;
                        }
                        _ => return Err(ParseError::bad_request("Content to long")),
                    }
                }
                ChunkState::Trailer => {
                    let Some(line) = read_line(&mut self.line, data, config.max_line_length)? else {
                        return Ok(false);
                    };

                    if line.is_empty() {
                        return Ok(true);
                    }

                    let Some((field, value)) = line.split_once(':') else {
                        return Err(ParseError::bad_request("Wrong content encoding"));
                    };
                    trailer.insert_merged(&field.to_ascii_lowercase(), trim(value));
                }
            }
        }
    }
}
