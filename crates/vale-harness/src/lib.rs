//! Test-harness plumbing for VALE / veth network-function tests.
//!
//! Every resource acquisition is a guarded call: the external tool's exit
//! code is checked against an expected value and a mismatch is fatal. Each
//! successful acquisition pushes its teardown onto a LIFO cleanup stack that
//! is drained exactly once when the run terminates, whether it completed,
//! failed, or was interrupted by a signal.

pub mod cleanup;
pub mod config;
pub mod error;
pub mod fd_server;
pub mod harness;
pub mod link;
pub mod runner;
pub mod scenario;
pub mod signals;
pub mod status;
pub mod vale;

pub mod test_util;

pub use cleanup::{CleanupAction, CleanupStack, Phase, TrapSignal};
pub use error::{Abort, HarnessError};
pub use harness::Harness;
pub use runner::{CommandRunner, Diagnostics, DryRunRunner, SystemRunner};
pub use status::{ExitExpectation, StatusChannel};
