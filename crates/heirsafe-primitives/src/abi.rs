//! Contract interfaces consumed by the client.
//!
//! The factory, the heir module and the multi-signature account are external
//! contracts; only the calls the client issues are declared here.

use alloy_sol_types::sol;

sol! {
    /// Deterministic deployer for heir modules.
    interface IHeirFactory {
        function predict(address safe, bytes32 salt) external view returns (address);
        function deploy(address safe, bytes32 salt) external returns (address);
    }

    /// Per-account heir module.
    interface IHeirModule {
        function heirConfigs(address owner) external view returns (address beneficiary, uint256 activationTime);
        function setBeneficiary(address beneficiary, uint256 activationTime) external;
        function setActivationTime(uint256 activationTime) external;
        function removeBeneficiary() external;
        function claimSafe(address owner, address prevOwner) external;
    }

    /// Subset of the multi-signature account interface.
    interface ISafe {
        function getOwners() external view returns (address[] memory);
        function getThreshold() external view returns (uint256);
        function getModulesPaginated(address start, uint256 pageSize) external view returns (address[] memory array, address next);
        function enableModule(address module) external;
        function execTransaction(
            address to,
            uint256 value,
            bytes calldata data,
            uint8 operation,
            uint256 safeTxGas,
            uint256 baseGas,
            uint256 gasPrice,
            address gasToken,
            address refundReceiver,
            bytes memory signatures
        ) external payable returns (bool success);
    }
}
