pub mod analysis;
pub mod batch;
pub mod fingerprint;
pub mod retry;
