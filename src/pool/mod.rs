mod credential;
mod failover;

pub use credential::{
    Credential, CredentialId, CredentialPool, CredentialSnapshot, CredentialStatus, PoolPolicy,
};
pub use failover::{CallOptions, FailoverInvoker, Invoker};

#[cfg(test)]
pub(crate) use failover::testing;
