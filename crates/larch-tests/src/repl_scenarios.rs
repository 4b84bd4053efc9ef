//! End-to-end replication scenarios over an in-process topology.
