pub mod page_fetcher;
pub mod transport;

#[cfg(test)]
pub mod fake_transport;

pub use page_fetcher::PageFetcher;
pub use transport::{HttpReply, HttpTransport, WreqTransport};
