//! Message consumption for the scan orchestrator.
//!
//! [`MessageLoop`] is transport agnostic; production wires it to a broker
//! subscription while tests and local runs use [`InMemoryMessageSource`].

mod message_loop;
mod source;

pub use message_loop::*;
pub use source::*;
