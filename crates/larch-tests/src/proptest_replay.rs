//! Delivery-order independence, property-tested.
//!
//! The transport preserves each origin's message order but gives no
//! guarantee about interleaving across origins. Any interleaving of two
//! replicas' update streams must replay to identical directory content.
