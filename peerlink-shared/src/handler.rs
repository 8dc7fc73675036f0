use std::time::Instant;

/// Sans-I/O protocol surface shared by every layer of the engine.
///
/// A `Protocol` never performs I/O: inbound data, application writes and
/// timer expirations are handed in through the `handle_*` methods, and the
/// layer's output is drained through the matching `poll_*` methods. The
/// embedder (or an outer layer) owns the loop.
///
/// `Rin`/`Win`/`Ein` are the inbound read, write and event message types;
/// the associated types name what the layer emits in each direction.
pub trait Protocol<Rin, Win, Ein> {
    /// Read output message type, flowing toward the application
    type Rout;
    /// Write output message type, flowing toward the wire
    type Wout;
    /// Event output message type
    type Eout;
    /// Error type surfaced by the handle methods
    type Error;

    /// Handles an inbound message
    fn handle_read(&mut self, msg: Rin) -> Result<(), Self::Error>;

    /// Polls the next read output for the layer above
    fn poll_read(&mut self) -> Option<Self::Rout>;

    /// Handles an outbound message
    fn handle_write(&mut self, msg: Win) -> Result<(), Self::Error>;

    /// Polls the next write output for the layer below
    fn poll_write(&mut self) -> Option<Self::Wout>;

    /// Handles an event
    fn handle_event(&mut self, _evt: Ein) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Polls the next event output
    fn poll_event(&mut self) -> Option<Self::Eout> {
        None
    }

    /// Handles timer expiration
    fn handle_timeout(&mut self, _now: Instant) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Polls the earliest deadline this layer needs a `handle_timeout` call at
    fn poll_timeout(&mut self) -> Option<Instant> {
        None
    }

    /// Tears the layer down, cancelling pending timers and in-flight work
    fn close(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}
