//! Session state machine, long-poll multiplexer and relay pipeline of the gateway.

pub mod gateway;
pub mod multiplexer;
pub mod registry;
pub mod relay;
pub mod session;
mod task;
pub mod transport;

pub use gateway::{Gateway, GatewaySettings, GatewayTasks, RemoteFactory, SessionStatus};
pub use multiplexer::{Multiplexer, MultiplexerSettings, SessionResolver};
pub use registry::{spawn_registry, RegistryHandle};
pub use relay::{RelayPipeline, RenderStep, StepOutcome};
pub use session::{
    Credentials, FetchOutcome, PollOutcome, Session, SessionContext, SessionSettings,
    SessionSignal, SessionSnapshot, TaggedSignal,
};
pub use transport::{BroadcastTransport, Transport, TransportError};

#[cfg(test)]
#[path = "tests/support.rs"]
mod support;
#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod session_tests;
#[cfg(test)]
#[path = "tests/relay_tests.rs"]
mod relay_tests;
#[cfg(test)]
#[path = "tests/multiplexer_tests.rs"]
mod multiplexer_tests;
#[cfg(test)]
#[path = "tests/gateway_tests.rs"]
mod gateway_tests;
#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod transport_tests;
