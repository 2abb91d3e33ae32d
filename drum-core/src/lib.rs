pub mod account;
pub mod config;
pub mod counter;
pub mod error;
pub mod limits;
pub mod pattern;
pub mod proxy;
pub mod task;
pub mod user;

pub use account::{Account, AccountApiMode, SharedAccount, WorkerState};
pub use config::RouterConfig;
pub use counter::Counter;
pub use error::RouterError;
pub use task::{Task, TaskState, UpstreamResponse};
pub use user::User;
