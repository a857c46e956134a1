pub mod client;
pub mod error;
pub mod events;
pub mod limiter;
pub mod net;
pub mod options;
pub mod proto;
pub mod token;
pub mod transfer;
pub mod waiter;

pub use client::{EndpointCache, Host, NoShareHost, SearchResponseCache, SoulseekClient};
pub use error::{Error, Result};
pub use events::{ClientEvent, EventBus};
pub use limiter::{Governor, TokenBucket, Unlimited};
pub use net::{
    Connection, ConnectionEvent, ConnectionId, ConnectionState, DistributedManager, Listener,
    MessageConnection, PeerConnectionManager, ProgressFn,
};
pub use options::{
    ClientOptions, ClientOptionsPatch, ConnectionOptions, DiagnosticLevel, ProxyOptions,
};
pub use token::TokenFactory;
pub use transfer::{Transfer, TransferDirection, TransferObserver, TransferState};
pub use waiter::{WaitKey, Waiter};
