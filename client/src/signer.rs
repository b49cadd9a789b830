use async_trait::async_trait;
use hlchat_common::{Address, LocalWallet, TypedData, WalletSignature};

use crate::error::ChatError;

/// The wallet the chat asks for signatures.
///
/// Signing is async because a browser wallet may sit behind a popup or
/// another window; `LocalWallet` answers immediately.
#[async_trait]
pub trait WalletSigner: Send + Sync {
    fn address(&self) -> Address;

    /// EIP-191 `personal_sign` over `message`.
    async fn sign_personal(&self, message: &str) -> Result<WalletSignature, ChatError>;

    /// `eth_signTypedData_v4` over `data`.
    async fn sign_typed(&self, data: &TypedData) -> Result<WalletSignature, ChatError>;
}

#[async_trait]
impl WalletSigner for LocalWallet {
    fn address(&self) -> Address {
        LocalWallet::address(self)
    }

    async fn sign_personal(&self, message: &str) -> Result<WalletSignature, ChatError> {
        Ok(LocalWallet::sign_personal(self, message)?)
    }

    async fn sign_typed(&self, data: &TypedData) -> Result<WalletSignature, ChatError> {
        Ok(self.sign_hash(&data.signing_hash())?)
    }
}
