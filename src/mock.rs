//! Scripted in-memory transport for exercising the engine without a device.

use std::collections::VecDeque;
use std::io::ErrorKind;

use crate::protocol::ACK;
use crate::{Options, Programmer, Transport};

/// Fake device end of the wire.
///
/// Answers are scripted up front as a flat byte queue; everything the engine
/// sends is recorded, flattened, in `sent`.
pub struct MockTransport {
    pub open: bool,
    pub responses: VecDeque<u8>,
    pub sent: Vec<u8>,
    pub clears: usize,
    /// When set, every send fails with a timeout.
    pub fail_sends: bool,
}

impl MockTransport {
    pub fn closed() -> MockTransport {
        MockTransport {
            open: false,
            responses: VecDeque::new(),
            sent: Vec::new(),
            clears: 0,
            fail_sends: false,
        }
    }

    pub fn ready(responses: &[u8]) -> MockTransport {
        MockTransport {
            open: true,
            responses: responses.iter().copied().collect(),
            ..MockTransport::closed()
        }
    }
}

impl Transport<ErrorKind> for MockTransport {
    fn open(&mut self) -> Result<(), ErrorKind> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), ErrorKind> {
        self.open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn clear_buffers(&mut self) -> Result<(), ErrorKind> {
        self.clears += 1;
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> Result<(), ErrorKind> {
        if self.fail_sends {
            return Err(ErrorKind::TimedOut);
        }
        self.sent.extend_from_slice(data);
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<(), ErrorKind> {
        for byte in buf.iter_mut() {
            *byte = self.responses.pop_front().ok_or(ErrorKind::TimedOut)?;
        }
        Ok(())
    }

    fn set_rts(&mut self, _level: bool) -> Result<(), ErrorKind> {
        Ok(())
    }

    fn set_dtr(&mut self, _level: bool) -> Result<(), ErrorKind> {
        Ok(())
    }
}

/// Programmer that has already completed the handshake, with `responses`
/// queued as the device's subsequent answers.
pub fn ready_programmer(responses: &[u8]) -> Programmer<MockTransport, ErrorKind> {
    let mut scripted = vec![ACK];
    scripted.extend_from_slice(responses);

    let mut programmer = Programmer::new(MockTransport::ready(&scripted), Options::default());
    programmer.init().expect("scripted handshake failed");

    let transport = programmer.transport_mut();
    transport.sent.clear();
    transport.clears = 0;

    programmer
}
