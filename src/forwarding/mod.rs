//! Port Forwarding Module
//!
//! Local forwards to pod-side services (ComfyUI, file browser, Gradio, VNC)
//! over the pod's control connection.

mod bridge;
mod tunnel;

pub use bridge::TunnelBridge;
pub use tunnel::{ForwardSpec, Tunnel, TunnelError, TunnelInfo, TunnelOptions, TunnelStatus};
