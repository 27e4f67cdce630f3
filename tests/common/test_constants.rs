//! Shared constants for integration tests.

/// Availability zone used by fake accounts.
pub const ZONE: &str = "us-east-1a";
/// Image id registered with fake accounts.
pub const IMAGE_ID: &str = "ami-1234";
/// Keypair registered remotely and configured locally.
pub const KEYPAIR: &str = "deploy";
/// Security group grouping helper instances.
pub const HELPER_GROUP: &str = "blockprep-helpers";
