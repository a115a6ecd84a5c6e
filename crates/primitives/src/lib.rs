//! Collection of leaf types shared across the cashier workspace.

pub mod amount;
pub mod distinction;
pub mod userid;

pub use amount::{Amount, AmountError, RoundingMode};
pub use distinction::Distinction;
pub use userid::{UserId, UserIdError};
