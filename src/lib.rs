mod auth;
mod client;
mod error;
mod favorites;
mod gateway;
mod session;
mod state_file;
mod types;

pub mod conversations;
pub mod credits;
#[cfg(feature = "verification")]
pub mod verification;

pub use auth::{AuthClient, AuthUser, Session, SignUpOutcome};
pub use client::{Client, ClientConfig, Filters, SelectBuilder};
pub use conversations::{Conversation, ConversationsClient, Message, MessageRole};
pub use credits::{
    CreditPackage, CreditTransaction, CreditsClient, MembershipPlan, PaymentMethod,
    ProcedureOutcome, RechargeOrder, TransactionType, Withdrawal, WithdrawalStatus,
};
pub use error::{AiopError, Result};
pub use favorites::{
    Favorite, FavoriteStore, Favorites, LocalFavorites, RemoteFavorites, SyncReport,
};
pub use gateway::{
    ChargeResult, Invocation, InvocationGateway, InvokeError, InvokeOutcome, ReconcilePolicy,
    ResourceInvoker,
};
pub use session::{Account, SessionSnapshot, SessionStore};
pub use state_file::StateFile;
pub use types::{MembershipType, Profile, ResourceRef, ResourceType, Role};
#[cfg(feature = "verification")]
pub use verification::{SendOutcome, VerificationClient, VerificationKind};
