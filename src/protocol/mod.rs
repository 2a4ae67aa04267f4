//! C4 - Worker Connection Handler: the gRPC wire protocol (spec.md §4.4,
//! §6), modeled on `cloud-service::grpcapi::worker::WorkerGrpcApi`'s
//! `connect_worker` bidirectional-streaming pattern.

pub mod connection;

pub mod proto {
    tonic::include_proto!("orchestrator.v1");
}

pub use connection::WorkerProtocolHandler;
