pub mod dialog;
pub mod id;
pub mod invitation;
pub mod manager;
pub mod registration;
pub mod state;

pub use dialog::Dialog;
pub use id::DialogId;
pub use invitation::{invite, InviteOption};
pub use manager::DialogManager;
pub use registration::{start_auto_registration, Registration};
pub use state::{DialogState, InviteStatus};
