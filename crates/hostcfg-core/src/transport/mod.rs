// # Peer Transports
//
// Implementations of the PeerTransport trait.
//
// Production controllers talk to their peripheral over a short-range
// wireless serial link provided by the platform; that transport lives with
// the platform code. TCP is the portable stand-in used by the demos.

pub mod tcp;

pub use tcp::TcpPeerTransport;
