pub mod memory;
pub mod rfcomm;
pub mod tcp;
pub mod traits;

pub use memory::{MemoryConnector, MemoryPeer, MemoryStream};
pub use rfcomm::{RfcommConnector, RfcommTransportStream};
pub use tcp::{TcpConnector, TcpTransportStream};
pub use traits::{TransportConnector, TransportStream};
