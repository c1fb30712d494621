pub mod actions;
pub mod conversations;
pub mod health;
pub mod pull_requests;
pub mod reconcile;
pub mod webhooks;
