pub mod http_client;
pub mod human_format;
pub mod url;

pub use http_client::TolerantHttpClient;
pub use self::url::UrlUtils;
