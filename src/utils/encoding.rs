//! 字符编码转换工具
//!
//! ZIP 条目名称的解码：
//! - 通用标志位 11 置位时按 UTF-8 解码
//! - 否则按单字节 Windows-1252（latin1 超集）解码
//!
//! 注意：不包含 CP437 码表，旧版 DOS 压缩工具写入的名称会按 Windows-1252 显示。

use std::borrow::Cow;

/// 通用标志位 11：名称和注释为 UTF-8
pub const GP_FLAG_UTF8: u16 = 1 << 11;

/// 编码信息（用于日志记录）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodingInfo {
    /// 实际使用的编码
    pub encoding: &'static str,
    /// 是否包含无效字节
    pub had_errors: bool,
}

/// 解码 ZIP 条目名称
///
/// 纯 ASCII 或合法 UTF-8 时借用原始字节，不产生分配。
pub fn decode_zip_name(bytes: &[u8], flags: u16) -> Cow<'_, str> {
    decode_zip_name_with_info(bytes, flags).0
}

/// 解码 ZIP 条目名称并返回编码信息
pub fn decode_zip_name_with_info(bytes: &[u8], flags: u16) -> (Cow<'_, str>, EncodingInfo) {
    if flags & GP_FLAG_UTF8 != 0 {
        let (cow, had_errors) = encoding_rs::UTF_8.decode_without_bom_handling(bytes);
        return (
            cow,
            EncodingInfo {
                encoding: "UTF-8",
                had_errors,
            },
        );
    }

    // Windows-1252 对每个字节都有映射，不会出错
    let (cow, had_errors) = encoding_rs::WINDOWS_1252.decode_without_bom_handling(bytes);
    (
        cow,
        EncodingInfo {
            encoding: "windows-1252",
            had_errors,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utf8_flag() {
        let name = "数据/报告.txt".as_bytes();
        let (decoded, info) = decode_zip_name_with_info(name, GP_FLAG_UTF8);
        assert_eq!(decoded, "数据/报告.txt");
        assert_eq!(info.encoding, "UTF-8");
        assert!(!info.had_errors);
    }

    #[test]
    fn test_ascii_borrows() {
        let decoded = decode_zip_name(b"docs/readme.md", 0);
        assert!(matches!(decoded, Cow::Borrowed(_)));
        assert_eq!(decoded, "docs/readme.md");
    }

    #[test]
    fn test_legacy_name_uses_windows_1252() {
        // 0xE9 = é
        let decoded = decode_zip_name(b"caf\xe9.txt", 0);
        assert_eq!(decoded, "café.txt");
    }

    #[test]
    fn test_invalid_utf8_with_flag_is_lossy() {
        let (decoded, info) = decode_zip_name_with_info(b"bad\xff.txt", GP_FLAG_UTF8);
        assert!(info.had_errors);
        assert!(decoded.contains('\u{FFFD}'));
    }
}
