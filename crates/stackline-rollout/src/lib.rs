//! stackline-rollout: resolves deployment targets and drives a
//! multi-account deployment unit to completion.
//!
//! The [`TargetResolver`] turns stored target configuration into concrete
//! (account, region) pairs and walks promotion chains. The
//! [`DeploymentDriver`] creates or updates the unit through a
//! [`UnitProvider`], provisions instances, polls both status dimensions and
//! aggregates per-target results into the build ledger.

pub mod aggregate;
pub mod driver;
pub mod error;
pub mod local;
pub mod parameters;
pub mod poller;
pub mod provider;
pub mod resolver;
pub mod status;

pub use aggregate::{DeploymentSummary, Verdict};
pub use driver::{DeploymentDriver, DriverSettings, ProvisionOutcome, UnitOperation, UnitOutcome};
pub use error::{RolloutError, RolloutResult};
pub use local::LocalProvider;
pub use parameters::{DirParameterSource, ParameterSource};
pub use poller::{PollReport, TargetReport};
pub use provider::{ProviderError, UnitProvider};
pub use resolver::{PromotionStep, TargetResolver};
