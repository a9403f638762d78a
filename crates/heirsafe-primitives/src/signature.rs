use alloy_primitives::{Address, Bytes};

/// Builds the account's pre-validated signature for `owner`.
///
/// Layout is `r = owner left-padded to 32 bytes`, `s = 0`, `v = 1`. The account
/// accepts it only when the transaction sender is `owner` itself, which makes
/// it sufficient on its own only for threshold-one accounts.
pub fn prevalidated_signature(owner: Address) -> Bytes {
    let mut sig = [0u8; 65];
    sig[12..32].copy_from_slice(owner.as_slice());
    sig[64] = 1;
    Bytes::copy_from_slice(&sig)
}
