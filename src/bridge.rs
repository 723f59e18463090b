//! Lookup interface for the external file-tree server.
//!
//! The server resolves a client's walk to a service name and needs nothing
//! from this crate beyond these four operations: acquire a readable stream
//! (or its raw byte queue) and release it again.

use crate::device::{ByteQueueHandle, DvbDevice};
use crate::error::Result;
use crate::remux::stream::ServiceStream;

pub trait StreamLookup {
    /// Acquires a readable single-program TS stream for a named service.
    fn get_stream(&self, service_name: &str) -> Result<ServiceStream>;

    /// Releases a stream; the last release on a transponder tears the
    /// tuner chain down.
    fn free_stream(&self, stream: ServiceStream);

    /// As [`get_stream`](Self::get_stream), but exposing the blocking byte
    /// queue directly.
    fn get_byte_queue(&self, service_name: &str) -> Result<ByteQueueHandle>;

    fn free_byte_queue(&self, queue: ByteQueueHandle);
}

impl StreamLookup for DvbDevice {
    fn get_stream(&self, service_name: &str) -> Result<ServiceStream> {
        DvbDevice::get_stream(self, service_name)
    }

    fn free_stream(&self, stream: ServiceStream) {
        DvbDevice::free_stream(self, stream)
    }

    fn get_byte_queue(&self, service_name: &str) -> Result<ByteQueueHandle> {
        DvbDevice::get_byte_queue(self, service_name)
    }

    fn free_byte_queue(&self, queue: ByteQueueHandle) {
        DvbDevice::free_byte_queue(self, queue)
    }
}
