// proxy 模块 - token 轮换调度与对外 HTTP 接口

pub mod batch;
pub mod bearer;
pub mod captcha;
pub mod dispatcher;
pub mod errors;
pub mod generation;
pub mod handlers;
pub mod job_registry;
pub mod load_tracker;
pub mod mappers;
pub mod middleware;
pub mod privacy;
pub mod server;
pub mod token_source;

pub use dispatcher::{DispatchError, Dispatched, Dispatcher, UpstreamRequest};
pub use errors::RelayError;
pub use server::{build_router, start_server, AppState};
