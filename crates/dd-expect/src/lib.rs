#![forbid(unsafe_code)]

//! Expectation side of the oracle: which outcome each test is allowed to
//! have for a given toolchain, compiler, runtime and mode.

pub mod condition;
pub mod registry;
pub mod resolve;
pub mod table;

use dd_types::ConfigurationError;
use thiserror::Error;

pub use condition::Condition;
pub use registry::{
    CorpusSnapshot, FixtureDescriptor, FixtureEntry, FixtureManifest, FixtureRegistry,
};
pub use resolve::{CompileOptions, OutcomeResolver, Resolution, TestSpecification};
pub use table::{
    CatalogManifest, ConditionCatalog, ConditionCatalogBuilder, ConditionTable, OutcomeCategory,
};

#[derive(Debug, Error)]
pub enum ExpectError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid condition: {0}")]
    InvalidCondition(String),
    #[error("manifest error: {0}")]
    Manifest(String),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}
