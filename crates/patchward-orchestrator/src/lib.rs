mod error;
mod host;
mod orchestrator;
mod recovery;
mod request;
mod shutdown;
mod transaction;

pub use error::{FailureContext, UpgradeError, UpgradeErrorKind};
pub use host::HostServices;
pub use orchestrator::UpgradeOrchestrator;
pub use recovery::{recover_interrupted, RecoveryOutcome};
pub use request::{UpgradeOutcome, UpgradeRequest};
pub use shutdown::ShutdownHooks;

#[cfg(test)]
mod tests;
