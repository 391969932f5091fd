pub mod audit;
pub mod auth;
pub mod devices;
pub mod email;
pub mod encryption;
pub mod janitor;
pub mod metrics;
pub mod outbox;
pub mod tokens;
pub mod twofactor;
