//! Record payloads (§4.7 / §6): an in-memory/stream payload type, and the
//! inline-vs-external size threshold that decides whether a `Write`'s data
//! travels embedded in the message (`encodedData`) or by reference
//! (`dataCid`) into the external [`crate::store::DataStore`].

use std::io::{Cursor, Read};

use crate::{Result, unexpected};

/// Payloads at or below this size (bytes) are stored inline as
/// `encodedData`; larger payloads are persisted via [`crate::store::DataStore`]
/// and referenced by `dataCid`. Matches the `dataSizeInlineThreshold`
/// configuration option's default.
pub const MAX_ENCODED_SIZE: usize = 64 * 1024;

/// A record payload. Wraps an in-memory buffer behind `std::io::Read` so
/// builders and handlers share one type regardless of payload size.
#[derive(Debug)]
pub struct DataStream {
    inner: Cursor<Vec<u8>>,
}

impl DataStream {
    /// Reads the stream to completion, returning the buffered bytes.
    ///
    /// # Errors
    /// Returns [`crate::Error::InternalError`] if the underlying read fails.
    pub fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        Read::read_to_end(&mut self.inner, &mut buf)
            .map_err(|e| unexpected!("failed reading data stream: {e}"))?;
        Ok(buf)
    }

    /// The number of bytes remaining in the stream.
    #[must_use]
    pub fn len(&self) -> usize {
        let pos = self.inner.position() as usize;
        self.inner.get_ref().len().saturating_sub(pos)
    }

    /// Whether the stream has no remaining bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Vec<u8>> for DataStream {
    fn from(bytes: Vec<u8>) -> Self {
        Self { inner: Cursor::new(bytes) }
    }
}

impl Clone for DataStream {
    fn clone(&self) -> Self {
        Self { inner: Cursor::new(self.inner.get_ref().clone()) }
    }
}

impl Read for DataStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_bytes() {
        let mut stream = DataStream::from(b"hello".to_vec());
        assert_eq!(stream.read_to_end().unwrap(), b"hello");
    }
}
