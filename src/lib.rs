//! Estimation of linear, generalized linear and partially non-linear models
//! with high-dimensional fixed effects.
//!
//! Fixed effects are absorbed by alternating projections ([`demean`]) rather
//! than estimated as dummy columns; the remaining coefficients come from
//! weighted normal equations ([`wls`]) inside the loop chosen by
//! [`estimate`]. Inference covers iid, heteroskedasticity-robust and
//! multi-way clustered covariances ([`vcov`]) and two-stage least squares
//! ([`iv`]).

pub mod collinear;
pub mod config;
pub mod demean;
pub mod design;
pub mod driver;
pub mod error;
pub mod family;
pub mod fixef;
pub mod group_index;
pub mod iv;
pub mod reduce;
pub mod result;
pub mod vcov;
pub mod wls;

#[cfg(feature = "python")]
mod python;

pub use config::{EngineConfig, IrlsConfig, NonLinearConfig};
pub use demean::CenteringConfig;
pub use design::{ClusterSpec, Design, GroupingSpec};
pub use driver::{estimate, ModelSpec, NonLinearPart, NonLinearSpec};
pub use error::{DivergenceReason, EngineError, EngineResult, FitWarning, IterationDiagnostics};
pub use family::{Family, FamilyFunctions};
pub use fixef::FixedEffectTable;
pub use group_index::GroupIndex;
pub use iv::{IvDiagnostics, IvSpec};
pub use result::{ConvergenceInfo, FitResult, FitStatistics};
pub use vcov::{ClusterDf, FixefK, SmallSampleCorrection, VcovSpec};
