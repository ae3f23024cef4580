pub mod fetch;
pub mod relay;

pub use fetch::{
    FetchEvent, FetchHandle, FetchOptions, FetchState, ReqwestTransport, ResponseHead, Transport,
    UpstreamFetch, UpstreamResponse,
};
pub use relay::{FailureSink, LogFailureSink, RelayOptions, StreamRelay};
