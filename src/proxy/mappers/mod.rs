// Mappers 模块 - 上游协议解析

pub mod error_classifier;
pub mod sora;
