pub mod auth;
pub mod capture;
pub mod config;
pub mod inspect;
pub mod message;
pub mod mime;
pub mod reply;
pub mod tls;
pub mod transport;

pub use auth::*;
pub use capture::*;
pub use config::*;
pub use inspect::*;
pub use message::*;
pub use mime::*;
pub use reply::*;
pub use tls::*;
pub use transport::*;
