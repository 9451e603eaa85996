pub mod agent;
pub mod config;
pub mod endpoint;

pub use agent::{AgentHandler, Core, IncomingRequest};
pub use config::{Credentials, StackConfig, StackConfigBuilder};
pub use endpoint::{CoreInner, CoreInnerRef};
