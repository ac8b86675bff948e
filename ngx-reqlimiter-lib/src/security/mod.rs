pub mod address;
pub mod ip_filter;
pub mod rate_limit;

pub use address::{classify, AddressClass};
pub use ip_filter::is_allowlisted;
pub use rate_limit::{RateLedger, TokenBucket};
