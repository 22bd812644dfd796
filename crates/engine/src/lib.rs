//! Provisioning engine.
//!
//! Sequences long-running, failure-prone provisioning steps so that an
//! interrupted run can be resumed without repeating completed work.
//!
//! - [`ledger`]: persisted checkpoint flags and derived secrets
//! - [`poller`] / [`probe`]: bounded readiness polling for DNS and HTTP
//! - [`process`]: external binaries with a scoped working directory and env overlay
//! - [`executor`]: ordered, resumable step execution
//!
//! # Example
//!
//! ```ignore
//! use provision_engine::{Executor, Ledger, Step};
//!
//! let mut ledger = Ledger::load("state.json")?;
//! let steps: Vec<Box<dyn Step>> = vec![/* ... */];
//! let report = Executor::new().run(&steps, &mut ledger).await?;
//! println!("{} completed, {} skipped", report.completed(), report.skipped());
//! ```

#![allow(clippy::doc_markdown)]

pub mod executor;
pub mod ledger;
pub mod poller;
pub mod probe;
pub mod process;

pub use executor::{Executor, ExecutorError, RunReport, Step, StepState};
pub use ledger::{Ledger, LedgerError, LedgerValue};
pub use poller::{AttemptState, PollError, Poller};
pub use probe::{http_ready, txt_record_resolves, FallbackResolver, TxtResolver};
pub use process::{BackgroundProcess, Invocation, ProcessError, ProcessRunner};
