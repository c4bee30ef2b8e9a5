//! The hook point for the document's decryption transform.
//!
//! Encryption algorithm internals live with the host application; this core
//! only applies a caller-supplied transform to raw string and stream bytes
//! as objects are fetched.

use crate::object::ObjRef;

/// What kind of value is being decrypted.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DecryptionTarget {
    /// A string object.
    String,
    /// The raw data of a stream object.
    Stream,
}

/// A per-document decryption transform.
///
/// The transform is invoked once per encrypted value with the id of the
/// indirect object that owns it. Fetches with decryption suppressed (the
/// `/Encrypt` dictionary itself) bypass it.
pub trait Decryptor: Send + Sync {
    /// Decrypt `data` belonging to the object `id`.
    fn decrypt(&self, id: ObjRef, data: Vec<u8>, target: DecryptionTarget) -> Vec<u8>;
}
