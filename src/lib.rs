//!A network pipe utility to relay byte streams between two endpoints across NATs or firewalls,
//!and to fan a single stream out to many simultaneous peers with on-the-wire compression.
//!
//!Two nodes that can only make outbound connections cannot reach each other directly.
//!A relay on a public address fixes that: both nodes dial the relay and announce the same
//!session identifier, the relay pairs the two connections into one bidirectional tunnel and
//!copies bytes between them until either side goes away or the session sits idle too long.
//!
//!## How the relay works
//!A client connects (TCP, or HTTP for networks that only let web traffic through) and sends
//!its session identifier as the first frame. The first arrival is acknowledged with `WAITING`
//!and parked. When the peer announces the same identifier, both sides receive `CONNECTED`
//!and the relay starts one copy task per direction. A third arrival for the same identifier
//!is refused with `SESSION_FULL`.
//!
//!## How the multiplexer works
//!Independent of relay pairing, [`multiplex::Multiplexer`] owns any number of named
//!connections and compresses payloads transparently. The wire format carries no envelope:
//!the receive side classifies each payload by its leading magic bytes, so compressed and
//!plain peers interoperate on the same socket.
//!
//!## Feature flags
//!The crate includes both the relay client and server by default. Set features to `client`
//!or `server` to build only one side.
//!
//!```text
//!netpipe = { version = "0.1", default-features = false, features = ["client"] }
//!```
//!
//!- `client`: relay client
//!- `server`: relay server (TCP and HTTP listeners)

pub mod codec;
pub mod config;
pub mod multiplex;
pub mod relay;
pub mod stats;
pub mod transport;
