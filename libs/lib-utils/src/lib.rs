pub mod b64;
pub mod retry;

pub use retry::{retry, RetryPolicy};
