pub mod cookies;
pub mod extract;
pub mod transport;

pub use cookies::CookieFileAuthenticator;
pub use extract::JsonLdExtractor;
pub use transport::ReqwestTransport;
