pub mod account;
pub mod admin;
pub mod auth;
pub mod devices;
pub mod health;
pub mod mfa;
pub mod tenants;
pub mod wellknown;
