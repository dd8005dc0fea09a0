//! Deterministic CBOR encoding used for hashing.
//!
//! JSON is the wire format, but hashes and signatures are computed over CBOR
//! so that whitespace or key order on the wire can never change an identity.
//! The encoded types contain no hash maps, which keeps `ciborium` output stable.

use serde::Serialize;

use crate::header::CoValueHeader;
use crate::transaction::Transaction;

fn to_cbor<T: Serialize>(value: &T) -> Vec<u8> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).expect("CBOR encoding into a Vec cannot fail");
    buf
}

/// Canonical bytes of a header (input to the CoValue ID).
pub fn canonical_header_bytes(header: &CoValueHeader) -> Vec<u8> {
    to_cbor(header)
}

/// Canonical bytes of a transaction (input to the session hash chain).
pub fn canonical_transaction_bytes(tx: &Transaction) -> Vec<u8> {
    to_cbor(tx)
}
