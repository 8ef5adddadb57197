//! Transaction construction, signing and submission

mod sender;
pub(crate) mod signer;

pub use sender::{SentTransaction, TransactionSender};
pub use signer::TransactionSigner;
