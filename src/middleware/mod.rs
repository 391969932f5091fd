pub mod auth;
pub mod csrf;
pub mod origin;
pub mod rate_limit;
pub mod request_id;
pub mod tenant;
