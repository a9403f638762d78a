//! Chain access for heirsafe.
//!
//! [`ChainReader`] is the read-only seam every other component goes through;
//! [`RpcChainReader`] implements it over a plain JSON-RPC endpoint.
//! [`AddressPredictor`] asks the factory for the module address an account
//! would get, caching answers for the lifetime of one network context.

pub mod client;
pub mod error;
pub mod predictor;
pub mod reader;

pub use client::{BlockHeader, CallRequest, RpcClient, TransactionReceipt};
pub use error::{decode_revert, ChainError, ChainResult};
pub use predictor::AddressPredictor;
pub use reader::{code_exposes_selector, ChainReader, ModulePage, RpcChainReader};
