pub mod admission;
pub mod key_loader;
pub mod rate_limit;
pub mod selector;

pub use admission::AdmissionPolicy;
pub use rate_limit::{IpFilter, IpVerdict};
pub use selector::Selection;
