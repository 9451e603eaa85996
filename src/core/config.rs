use std::sync::RwLock;
use std::time::Duration;

use crate::message::Uri;
use crate::transaction::state::TimerConfig;
use crate::transport::TransportConfig;

/// Digest credentials a `Core` uses to answer 401/407 challenges when
/// `auto_authenticate` is enabled.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub user_name: String,
    pub password: String,
}

/// Programmatically-constructed configuration for a `Core`. Built with
/// `StackConfig::builder()`; never parsed from a file or CLI flags.
#[derive(Debug)]
pub struct StackConfig {
    pub local_contact: RwLock<Option<Uri>>,
    pub outbound_proxy: RwLock<Option<Uri>>,
    pub user_agent: String,
    pub auto_authenticate: bool,
    pub credentials: Option<Credentials>,
    pub server_transaction_ttl: Duration,
    pub early_dialog_ttl: Duration,
    pub timers: TimerConfig,
    pub transports: Vec<TransportConfig>,
}

impl StackConfig {
    pub fn builder() -> StackConfigBuilder {
        StackConfigBuilder::default()
    }

    pub fn local_contact(&self) -> Option<Uri> {
        self.local_contact.read().unwrap().clone()
    }

    pub fn set_local_contact(&self, uri: Uri) {
        *self.local_contact.write().unwrap() = Some(uri);
    }

    pub fn outbound_proxy(&self) -> Option<Uri> {
        self.outbound_proxy.read().unwrap().clone()
    }

    pub fn set_outbound_proxy(&self, uri: Uri) {
        *self.outbound_proxy.write().unwrap() = Some(uri);
    }
}

pub struct StackConfigBuilder {
    local_contact: Option<Uri>,
    outbound_proxy: Option<Uri>,
    user_agent: String,
    auto_authenticate: bool,
    credentials: Option<Credentials>,
    server_transaction_ttl: Duration,
    early_dialog_ttl: Duration,
    timers: TimerConfig,
    transports: Vec<TransportConfig>,
}

impl Default for StackConfigBuilder {
    fn default() -> Self {
        let timers = TimerConfig::default();
        Self {
            local_contact: None,
            outbound_proxy: None,
            user_agent: "sipstack".to_string(),
            auto_authenticate: false,
            credentials: None,
            server_transaction_ttl: timers.t1 * 32,
            early_dialog_ttl: timers.t1 * 32,
            timers,
            transports: Vec::new(),
        }
    }
}

impl StackConfigBuilder {
    pub fn local_contact(mut self, uri: Uri) -> Self {
        self.local_contact = Some(uri);
        self
    }

    pub fn outbound_proxy(mut self, uri: Uri) -> Self {
        self.outbound_proxy = Some(uri);
        self
    }

    pub fn user_agent(mut self, value: impl Into<String>) -> Self {
        self.user_agent = value.into();
        self
    }

    pub fn auto_authenticate(mut self, credentials: Credentials) -> Self {
        self.auto_authenticate = true;
        self.credentials = Some(credentials);
        self
    }

    pub fn server_transaction_ttl(mut self, ttl: Duration) -> Self {
        self.server_transaction_ttl = ttl;
        self
    }

    pub fn early_dialog_ttl(mut self, ttl: Duration) -> Self {
        self.early_dialog_ttl = ttl;
        self
    }

    pub fn timers(mut self, timers: TimerConfig) -> Self {
        self.timers = timers;
        self
    }

    pub fn transport(mut self, transport: TransportConfig) -> Self {
        self.transports.push(transport);
        self
    }

    pub fn build(self) -> StackConfig {
        StackConfig {
            local_contact: RwLock::new(self.local_contact),
            outbound_proxy: RwLock::new(self.outbound_proxy),
            user_agent: self.user_agent,
            auto_authenticate: self.auto_authenticate,
            credentials: self.credentials,
            server_transaction_ttl: self.server_transaction_ttl,
            early_dialog_ttl: self.early_dialog_ttl,
            timers: self.timers,
            transports: self.transports,
        }
    }
}
