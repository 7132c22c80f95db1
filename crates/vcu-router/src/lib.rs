//! MAVLink router: learns endpoints from heartbeats and switches frames
//! between TCP peers and serial radios.

pub mod router;
pub mod table;

pub use router::{Router, RouterConfig};
pub use table::{LinkId, Route, RoutingTable};
