//! 基础设施层
//!
//! 配置加载与策略预设

pub mod config;
