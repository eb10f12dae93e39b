pub mod admin;
pub mod file;
pub mod public;
pub mod user;
