//! Secrets broker: encrypted credential storage with audited reads.

mod broker;

pub use broker::{AuditRow, ResolvedCredential, SecretsBroker};
