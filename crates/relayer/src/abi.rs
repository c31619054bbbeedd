//! Bridge contract bindings shared by the source and destination chains.

use alloy_sol_macro::sol;

sol! {
    /// Emitted by the source bridge when tokens are locked for transfer.
    event TokensLocked(
        address indexed from,
        uint256 indexed toChainId,
        uint256 amount,
        uint256 nonce
    );

    /// Releases tokens on the destination bridge for a lock observed on the source.
    function unlockTokens(address recipient, uint256 amount, uint256 sourceNonce);
}
