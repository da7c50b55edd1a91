use crate::state::{Endpoint, FlowKey, Transport};

/// One frame as handed over by the transport layer.
#[derive(Debug, Clone)]
pub struct Packet<'a> {
    pub data: &'a [u8],
    pub source: Endpoint,
    pub destination: Endpoint,
    pub transport: Transport,
    pub frame: u64,
    pub first_pass: bool,
    /// Absolute stream offset of `data[0]`, for stream transports.
    pub stream_offset: u64,
}

impl<'a> Packet<'a> {
    pub fn new(
        frame: u64,
        data: &'a [u8],
        source: Endpoint,
        destination: Endpoint,
        transport: Transport,
    ) -> Self {
        Self {
            data,
            source,
            destination,
            transport,
            frame,
            first_pass: true,
            stream_offset: 0,
        }
    }

    /// The same frame, presented again for redisplay.
    pub fn replay(mut self) -> Self {
        self.first_pass = false;
        self
    }

    pub fn at_stream_offset(mut self, offset: u64) -> Self {
        self.stream_offset = offset;
        self
    }

    pub fn key(&self) -> FlowKey {
        FlowKey::new(self.source.clone(), self.destination.clone(), self.transport)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn ports(&self) -> (Option<u16>, Option<u16>) {
        (self.source.port, self.destination.port)
    }

    pub fn involves_port(&self, ports: &[u16]) -> bool {
        let (src, dst) = self.ports();
        [src, dst]
            .into_iter()
            .flatten()
            .any(|port| ports.contains(&port))
    }
}
