pub mod link;
pub mod manager;
pub mod relay;
pub mod signaling;
pub mod webrtc;
