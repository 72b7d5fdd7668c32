pub mod connection;
pub mod events;
pub mod ice;
pub mod media;
pub mod state;
pub mod transport;
pub mod types;

pub use connection::WebRtcTransport;
pub use media::{DeviceStatus, LocalStream, LocalTrack, MediaDevices, MediaKind, RemoteStream, SampleDevices};
pub use state::TransportState;
pub use transport::{MediaTransport, TransportFactory, WebRtcTransportFactory};
pub use types::{IceCandidate, IceServerConfig, SdpKind, SessionDescription};
