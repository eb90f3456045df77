mod client;
mod types;

pub use client::{HttpClient, Transport};
pub use reqwest::Method;
pub use types::{Request, Response, EXTERNAL_OFFLINE_BODY, OFFLINE_MESSAGE, QUEUED_MESSAGE};
