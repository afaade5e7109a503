//! Generated `CaptureService` client/server stubs (see `proto/kasho.proto`).
//! Deliberately dependency-free beyond `tonic`/`prost`: conversions between
//! this crate's wire types and `kasho-bootstrap`/`kasho-model`'s native
//! types live in `kasho-capture-server` and `kasho-apply`, the two crates
//! that actually straddle both worlds.

tonic::include_proto!("kasho.v1");
