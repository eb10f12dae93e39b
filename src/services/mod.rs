pub mod auth;
pub mod dedup;
pub mod file;
pub mod ledger;
pub mod quota;
pub mod rate_limit;
pub mod user;

pub use auth::AuthService;
pub use dedup::DuplicateResolver;
pub use file::FileService;
pub use ledger::{MasterInsert, NewRecord, ReferenceLedger, Removal};
pub use quota::QuotaService;
pub use rate_limit::RateLimiter;
pub use user::UserService;
