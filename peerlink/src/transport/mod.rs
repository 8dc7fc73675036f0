pub mod candidate;
pub mod secure;
