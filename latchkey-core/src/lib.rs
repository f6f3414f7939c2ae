//! # latchkey-core
//!
//! Client-side license and entitlement validation engine for Latchkey.
//! Activates a license against the licensing server, keeps a local
//! authoritative cache of license state, and keeps answering "is this
//! license valid, and which entitlements are active" even when the
//! network is down, the clock has been tampered with, or the server is
//! erroring.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     LicenseEngine                         │
//! │                                                           │
//! │  ┌─────────────┐  ┌──────────────┐  ┌────────────────┐  │
//! │  │  Transport  │  │  CacheStore  │  │   Scheduler    │  │
//! │  │  (reqwest)  │  │  (encrypted) │  │  (timer loops) │  │
//! │  └─────────────┘  └──────────────┘  └────────────────┘  │
//! │                           │                               │
//! │                           ▼                               │
//! │  ┌────────────────────────────────────────────────────┐ │
//! │  │                 Offline Verifier                    │ │
//! │  │  (Ed25519 over canonical payload, grace period,    │ │
//! │  │   clock-tamper detection)                          │ │
//! │  └────────────────────────────────────────────────────┘ │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - **Offline fail behavior**: verification checks run in a fixed
//!   order; the signature is established before any payload field is
//!   trusted
//! - **Authoritative server**: a reachable server that says "no" purges
//!   cached offline state so a revoked license cannot resurrect itself
//! - **Single writer**: all cache mutation for one engine instance is
//!   serialized; concurrent manual and scheduled validations never
//!   interleave
//! - **Status is total**: `status()` and `check_entitlement()` never
//!   fail and never touch the network

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)] // Allow Type in module::Type
#![allow(clippy::must_use_candidate)] // Not all functions need must_use

pub mod config;
pub mod engine;
pub mod error;
mod scheduler;
pub mod store;
pub mod token;
pub mod transport;
pub mod types;
pub mod verifier;

pub use config::{EngineConfig, OfflineFallbackMode};
pub use engine::{ActivateOptions, LicenseEngine};
pub use error::LicenseError;
pub use store::CacheStore;
pub use token::{OfflineToken, SignedOfflineToken, TokenSignature};
pub use transport::{HttpTransport, Transport};
pub use types::{
    Entitlement, EntitlementStatus, License, LicenseEvent, LicenseState, ValidationResult,
};
pub use verifier::{verify, OfflineErrorCode, VerifyInput, VerifyOutcome};
