pub mod abi;
pub mod heir;
pub mod salt;
pub mod signature;

pub use heir::{
    parse_account_address, AccountRecord, AddressError, HeirConfig, ModuleInstallationState,
    SENTINEL,
};
pub use salt::{DeploymentSalt, SaltError};
pub use signature::prevalidated_signature;
