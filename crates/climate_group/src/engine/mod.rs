mod engine;
mod event;
mod host;
mod memory;
mod message;
mod restore;
pub mod state;

pub use engine::Engine;
pub use engine::PERSIST_INTERVAL;
pub use event::StateChangedEvent;
pub use host::Host;
pub use host::HostError;
pub use host::Service;
pub use host::ServiceCall;
pub use host::EVENT_CHANNEL_SIZE;
pub use memory::Behaviour;
pub use memory::MemoryHost;
pub use message::GroupMessage;
pub use restore::RestoreError;
pub use restore::RestoreStore;
pub use state::Attributes;
pub use state::CorrelationId;
pub use state::EntityState;
pub use state::MalformedValue;
pub use state::State;
pub use state::STATE_UNAVAILABLE;
pub use state::STATE_UNKNOWN;
