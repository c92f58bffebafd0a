//! Client side of the proxy
//!
//! Parses multinode endpoint URLs and routes logical sessions to proxy nodes
//! through a [`Transport`].

mod node_state;
mod router;
mod transport;
mod url;


pub use node_state::NodeState;
pub use router::MultinodeRouter;
pub use transport::{InProcessTransport, TcpTransport, Transport};
pub use url::{Endpoint, EndpointUrl};
