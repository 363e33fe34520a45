pub mod engine;
pub mod membership;
pub mod notification;
pub mod progress;
pub mod reconcile;
pub mod referral;
pub mod reward;
