//! Tower middleware for the API routers

pub mod auth;
