//! Plug connection (`spec.md §4.8`): "the bus library's point-to-point
//! helper, asymmetric by role: talker connects an input plug on the
//! peer, listener connects an output plug on the peer."
//!
//! Grounded on `AudioDeviceStream.cpp`'s `connectPlug`/`disconnectPlug`
//! pair, which dispatch to the input- or output-plug helper depending
//! on direction and return the helper's error verbatim.

use isoch_core::Result;

/// Point-to-point plug helper. A real implementation wraps the bus
/// library's AV/C plug-connect call; `LoopbackPlugConnector` is the
/// in-memory test double.
pub trait PlugConnector: Send {
    fn connect_input_plug(&mut self) -> Result<()>;
    fn connect_output_plug(&mut self) -> Result<()>;
    fn disconnect_input_plug(&mut self) -> Result<()>;
    fn disconnect_output_plug(&mut self) -> Result<()>;
}

/// In-memory plug double: every call succeeds and records the call
/// count, with no peer-side state to simulate.
#[derive(Default)]
pub struct LoopbackPlugConnector {
    pub input_connects: u32,
    pub output_connects: u32,
    pub input_disconnects: u32,
    pub output_disconnects: u32,
}

impl LoopbackPlugConnector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PlugConnector for LoopbackPlugConnector {
    fn connect_input_plug(&mut self) -> Result<()> {
        self.input_connects += 1;
        Ok(())
    }

    fn connect_output_plug(&mut self) -> Result<()> {
        self.output_connects += 1;
        Ok(())
    }

    fn disconnect_input_plug(&mut self) -> Result<()> {
        self.input_disconnects += 1;
        Ok(())
    }

    fn disconnect_output_plug(&mut self) -> Result<()> {
        self.output_disconnects += 1;
        Ok(())
    }
}
