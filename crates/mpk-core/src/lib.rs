//! Package pipelines for mpk.
//!
//! This crate ties together the manifest model, signing, the archive codec
//! and the installer into the `Engine`, the API behind every `mpm`
//! subcommand: create, unpack, inspect, verify, install and remove. It also
//! provides per-package advisory locking, Ctrl-C handling and the TOML
//! configuration file.

pub mod concurrency;
pub mod config;
pub mod engine;
pub mod keys;

pub use concurrency::{install_signal_handler, shutdown_requested, PackageLock, StoreLock};
pub use config::{Config, CONFIG_ENV, DEFAULT_CONFIG_PATH};
pub use engine::{
    CreateResult, Engine, InstallResult, RemoveResult, SignatureStatus, VerifyReport,
};
pub use keys::{generate_keypair, public_key_path, KeyPairPaths};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("manifest error: {0}")]
    Manifest(#[from] mpk_schema::ManifestError),
    #[error("manifest error: {0}")]
    Identity(#[from] mpk_schema::IdentityError),
    #[error("signature error: {0}")]
    Sign(#[from] mpk_schema::SignError),
    #[error("signature error: package {0} is not signed")]
    Unsigned(String),
    #[error("signature error: signature of {0} does not match the configured key")]
    BadSignature(String),
    #[error("integrity error: {0}")]
    Integrity(#[from] mpk_store::IntegrityError),
    #[error("integrity error: {package}: {failed} file(s) failed verification")]
    IntegrityMismatch { package: String, failed: usize },
    #[error("archive error: {0}")]
    Archive(#[from] mpk_store::ArchiveError),
    #[error("install error: {0}")]
    Install(#[from] mpk_store::InstallError),
    #[error("store error: {0}")]
    Store(#[from] mpk_store::StoreError),
    #[error("store error: {0}")]
    StoreConflict(String),
    #[error("store lock: {0}")]
    Locked(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("invalid package name: '{0}'")]
    InvalidName(String),
    #[error("interrupted, changes rolled back")]
    Interrupted,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
