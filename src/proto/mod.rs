//! Protobuf wire and record schemas.

pub mod wa;
