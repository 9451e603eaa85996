//! C4: RFC 3261 §17 transaction state machines (client/server ×
//! INVITE/non-INVITE), the timer wheel that drives their retransmission
//! and timeout behavior, and the key used to match a message to its
//! transaction.

pub mod key;
pub mod state;
pub mod timer;
pub mod transaction;

pub use key::{TransactionKey, TransactionRole};
pub use state::{TransactionKind, TransactionState, TransactionTimer, TimerConfig};
pub use timer::Timer;
pub use transaction::{Transaction, TransactionEvent, TransactionEventReceiver, TransactionEventSender};
