//! Browser automation module
//!
//! Launches and drives a single Chrome/Chromium instance per vote attempt,
//! one proxy-bound session at a time.

mod session;
mod errors;
mod registry;
mod worker;

pub use session::{BrowserSession, BrowserSessionConfig};
pub use errors::BrowserError;
pub use registry::ActiveBrowsers;
pub use worker::{run as run_worker, WorkerAttempt, WorkerConfig, WorkerResult};
