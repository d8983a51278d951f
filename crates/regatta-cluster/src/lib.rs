//! Cluster-manager integration surface: the client trait, subscription
//! event types, and the leader-gated server that owns the connection.

pub mod client;
pub mod events;
pub mod server;

pub use client::{ClusterManagerClient, LaunchableTask, OfferOperation};
pub use events::{Event, StatusUpdate};
pub use server::{Connection, Handler, LeaderDetector, Server};
