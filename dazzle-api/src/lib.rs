//! Dazzle solver gRPC API
//!
//! This crate defines the protocol between dazzle and the external build
//! daemon. The protobuf definitions live in `proto/solver.proto` and are
//! code-generated via `tonic-build`.

// Include the generated code
pub mod solver {
    pub mod v1 {
        tonic::include_proto!("dazzle.solver.v1");
    }
}
