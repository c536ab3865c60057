pub mod admin;
pub mod auth;
pub mod password;
pub mod session;
