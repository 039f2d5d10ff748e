// arlo-api: Async Rust client for the Arlo cloud API (request/response + push channel)

pub mod auth;
pub mod client;
pub mod error;
pub mod models;
pub mod packet;
pub mod stream;
pub mod transport;
pub mod twofactor;

pub use auth::Session;
pub use client::{ArloClient, ClientConfig, NotifyTarget};
pub use error::Error;
pub use models::DeviceInfo;
pub use packet::{Frame, Packet};
pub use stream::{
    EventStreamHandle, PacketHandler, ReconnectConfig, SessionProvider, StreamConfig,
    StreamState, StreamStats,
};
pub use transport::TransportConfig;
pub use twofactor::{
    ConsoleTwoFactor, MailMessage, Mailbox, MailboxTwoFactor, TwoFactorKind, TwoFactorSettings,
    TwoFactorSource,
};
