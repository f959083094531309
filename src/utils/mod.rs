//! 通用工具函数模块
//!
//! 目前只有 ZIP 条目名称的编码处理。

pub mod encoding;

pub use encoding::{decode_zip_name, decode_zip_name_with_info, EncodingInfo};
