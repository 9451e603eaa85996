//! Host Command interface: the narrow boundary to the voice-switch host
//! itself. The core never talks to the host's audio pipeline, dial-plan
//! engine, or user directory directly — it submits command strings and
//! reads back textual results, and subscribes to the host's raw event
//! stream.

use tokio::sync::mpsc;

use crate::error::Result;

/// A raw event as the host emits it, unparsed. Parsing event bodies into
/// typed telephony events is outside this crate's scope.
#[derive(Debug, Clone)]
pub struct HostEvent {
    pub name: String,
    pub body: String,
}

/// Submits command strings to the host and reads back its textual
/// result. Implemented by whatever actually talks to the switch (an
/// event-socket client, an IPC pipe, …); this crate only depends on the
/// contract.
#[async_trait::async_trait]
pub trait HostCommandSender: Send + Sync {
    async fn submit(&self, command: &str) -> Result<String>;
}

/// Subscribes to the host's raw event stream. `subscribe` returns a
/// receiver fed by a background task the implementor owns; dropping the
/// receiver is the unsubscribe signal.
#[async_trait::async_trait]
pub trait HostEventSource: Send + Sync {
    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<HostEvent>>;
}
