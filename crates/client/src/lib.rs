pub mod error;
pub mod http;
pub mod memory;
pub mod retry;
pub mod store;

pub use error::StoreError;
pub use http::HttpRuleStore;
pub use memory::InMemoryRuleStore;
pub use retry::{RetryPolicy, StatusPattern};
pub use store::RemoteRuleStore;
