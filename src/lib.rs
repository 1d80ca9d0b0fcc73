//! verbs-harness stands up RDMA verbs objects and connections for conformance test cases run
//! against NIC drivers, over [rdma-core].
//!
//! [rdma-core]: https://github.com/linux-rdma/rdma-core

/// The wrapper over [libibverbs](https://github.com/linux-rdma/rdma-core/tree/master/libibverbs):
/// explicitly destroyed handles for every verbs object the harness creates, the QP state table,
/// and the data path used by end-to-end scenarios.
pub mod ibverbs;

/// Resource allocator, connection backend, helper suite and the NIC capability registry.
pub mod harness;
