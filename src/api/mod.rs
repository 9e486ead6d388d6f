//! Backend API, one file per domain. All requests go through `ApiClient`,
//! which attaches the bearer token and turns failures into `ConsultaError`.

pub mod auth;
pub mod client;
pub mod ledgers;
pub mod pdf;
pub mod search;
pub mod users;

pub use client::ApiClient;
