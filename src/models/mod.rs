pub mod file;
pub mod filter;
pub mod user;

pub use file::*;
pub use filter::*;
pub use user::*;
