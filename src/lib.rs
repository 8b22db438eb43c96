pub mod modules;
pub mod proxy;
