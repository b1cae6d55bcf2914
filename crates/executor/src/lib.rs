//! Transaction validation, execution and block production.

pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod producer;
pub mod validator;

pub use config::{ChainConfig, DEFAULT_BLOCK_REWARD};
pub use engine::{BlockSummary, TxEngine};
pub use error::{ExecutionError, LookupError, SubmitError, SubmitErrorKind};
pub use executor::{BlockStats, Execution, Executor, ERR_INSUFFICIENT_BALANCE, ERR_OUT_OF_GAS};
pub use producer::BlockProducer;
pub use validator::TxValidator;
