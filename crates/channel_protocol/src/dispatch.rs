//! Static opcode dispatch.
//!
//! The dispatch table is built exactly once during server construction and
//! shared read-only by every session's packet loop. There is no package-level
//! one-time initializer; whoever constructs the server owns the table and
//! passes it (behind an `Arc`) into the components that need it.

use crate::frame::Opcode;
use futures::future::BoxFuture;
use std::collections::HashMap;

/// Failure inside a single packet handler.
///
/// These never escalate past the session's packet loop; the loop logs them
/// and continues with the next frame.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The payload could not be decoded into the handler's expected shape
    #[error("Decode error: {0}")]
    Decode(String),
    /// The handler ran but the operation failed
    #[error("Handler execution error: {0}")]
    Execution(String),
    /// The session's connection is gone; the loop should stop
    #[error("Session closed")]
    SessionClosed,
}

/// The future a handler returns for one inbound unit.
pub type HandlerFuture = BoxFuture<'static, Result<(), HandlerError>>;

type Handler<C> = Box<dyn Fn(C, Vec<u8>) -> HandlerFuture + Send + Sync>;

/// Immutable opcode-to-handler routing table.
///
/// `C` is the per-dispatch context the owning server provides (typically a
/// handle to the server plus the session the frame arrived on).
pub struct DispatchTable<C> {
    handlers: HashMap<u16, Handler<C>>,
}

impl<C> DispatchTable<C> {
    /// Starts building a table.
    pub fn builder() -> DispatchTableBuilder<C> {
        DispatchTableBuilder { handlers: HashMap::new() }
    }

    /// Looks up the handler for `opcode` and starts it with the given context
    /// and payload. Returns `None` for an unregistered opcode.
    pub fn dispatch(&self, ctx: C, opcode: Opcode, payload: Vec<u8>) -> Option<HandlerFuture> {
        self.handlers.get(&opcode.0).map(|h| h(ctx, payload))
    }

    /// Whether a handler is registered for the given opcode.
    pub fn handles(&self, opcode: Opcode) -> bool {
        self.handlers.contains_key(&opcode.0)
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Builder for [`DispatchTable`]. Registration happens only here; once built,
/// the table is immutable.
pub struct DispatchTableBuilder<C> {
    handlers: HashMap<u16, Handler<C>>,
}

impl<C> DispatchTableBuilder<C> {
    /// Registers a handler for `opcode`, replacing any previous registration.
    pub fn register<F>(mut self, opcode: Opcode, handler: F) -> Self
    where
        F: Fn(C, Vec<u8>) -> HandlerFuture + Send + Sync + 'static,
    {
        self.handlers.insert(opcode.0, Box::new(handler));
        self
    }

    /// Finalizes the table.
    pub fn build(self) -> DispatchTable<C> {
        DispatchTable { handlers: self.handlers }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[tokio::test]
    async fn dispatches_registered_opcode() {
        let table: DispatchTable<u32> = DispatchTable::builder()
            .register(Opcode(5), |ctx, payload| {
                async move {
                    assert_eq!(ctx, 42);
                    assert_eq!(payload, vec![9]);
                    Ok(())
                }
                .boxed()
            })
            .build();

        assert!(table.handles(Opcode(5)));
        let fut = table.dispatch(42, Opcode(5), vec![9]).expect("handler registered");
        fut.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_opcode_yields_none() {
        let table: DispatchTable<()> = DispatchTable::builder().build();
        assert!(table.is_empty());
        assert!(table.dispatch((), Opcode(0xFFFF), Vec::new()).is_none());
    }
}
