pub mod audit;
pub mod auth;
pub mod device;
pub mod outbox;
pub mod session;
pub mod tenant;
pub mod token;
pub mod user;
