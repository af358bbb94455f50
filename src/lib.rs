//! taptree - hierarchical concurrent tests with an ordered TAP stream
//!
//! Tests and their subtests run concurrently on tokio. Results are streamed
//! as TAP in declaration order, as soon as that order allows.
//!
//! ```no_run
//! use taptree::{Harness, HarnessConfig};
//!
//! # async fn demo() -> Result<(), taptree::HarnessError> {
//! let mut harness = Harness::stdout(HarnessConfig::default());
//! harness.test("math", |ctx| async move {
//!     ctx.test("addition", |_| async {
//!         anyhow::ensure!(1 + 1 == 2, "addition is broken");
//!         Ok(())
//!     })
//!     .await;
//!     Ok(())
//! });
//! let report = harness.run().await?;
//! std::process::exit(report.summary.exit_code());
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod error;
pub mod executor;
pub mod models;
pub mod output;
pub mod process;
pub mod utils;

pub use config::HarnessConfig;
pub use error::HarnessError;
pub use executor::{
    report_uncaught, report_unhandled, Attribution, Extensions, Harness, RunReport, Subtest,
    TestContext, TestExtension,
};
pub use models::{FailureKind, RunSummary, TestOutcome, TestStatus};
