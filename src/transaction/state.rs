use std::time::Duration;

use super::key::TransactionKey;

/// RFC 3261 §17 transaction states, unified across all four transaction
/// kinds. Not every state is reachable by every kind (e.g. only a server
/// INVITE transaction visits `Confirmed`); `Transaction::can_transition`
/// enforces the per-kind subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Calling,
    Trying,
    Proceeding,
    Completed,
    Confirmed,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    ClientInvite,
    ClientNonInvite,
    ServerInvite,
    ServerNonInvite,
}

impl TransactionKind {
    pub fn is_client(&self) -> bool {
        matches!(self, TransactionKind::ClientInvite | TransactionKind::ClientNonInvite)
    }

    pub fn is_invite(&self) -> bool {
        matches!(self, TransactionKind::ClientInvite | TransactionKind::ServerInvite)
    }
}

/// A fired transaction timer, carrying the key (so the manager's single
/// background poller can route it back to the right transaction) and,
/// for the retransmission timers, the duration just elapsed (needed to
/// compute the next, doubled, interval).
#[derive(Debug, Clone)]
pub enum TransactionTimer {
    TimerA(TransactionKey, Duration),
    TimerB(TransactionKey),
    TimerD(TransactionKey),
    TimerE(TransactionKey, Duration),
    TimerF(TransactionKey),
    TimerG(TransactionKey, Duration),
    TimerH(TransactionKey),
    TimerI(TransactionKey),
    TimerK(TransactionKey),
}

impl TransactionTimer {
    pub fn key(&self) -> &TransactionKey {
        match self {
            TransactionTimer::TimerA(k, _)
            | TransactionTimer::TimerB(k)
            | TransactionTimer::TimerD(k)
            | TransactionTimer::TimerE(k, _)
            | TransactionTimer::TimerF(k)
            | TransactionTimer::TimerG(k, _)
            | TransactionTimer::TimerH(k)
            | TransactionTimer::TimerI(k)
            | TransactionTimer::TimerK(k) => k,
        }
    }
}

/// Base timer values from RFC 3261 §17.1.1.1 table. T1 is the estimated
/// round-trip time; T2 is the maximum retransmit interval for non-INVITE
/// and INVITE responses; T4 is the maximum lifetime a message can stay in
/// the network.
#[derive(Debug, Clone, Copy)]
pub struct TimerConfig {
    pub t1: Duration,
    pub t2: Duration,
    pub t4: Duration,
}

impl TimerConfig {
    pub fn t1x64(&self) -> Duration {
        self.t1 * 64
    }
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
        }
    }
}
