//! Domain layer shared by the webhook endpoint and the background reconciler.
//!
//! Everything in this crate is free of I/O: provider payloads go in, canonical
//! [`types::InboundEvent`] values and derived rates come out.
pub mod normalizer;
pub mod rates;
pub mod types;

pub use normalizer::{Normalizer, NormalizerError};
pub use rates::compute_rates;
