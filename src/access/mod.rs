//! SSH credential issuance for sandboxes.

mod ssh_keys;

pub use ssh_keys::{generate, SshKeyPair};
