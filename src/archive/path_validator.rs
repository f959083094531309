//! Path Validator Module - Archive entry name safety
//!
//! 统一的归档条目名称检查，防止路径遍历。
//!
//! **规则**（反斜杠先规范化为 `/`）:
//! 1. 以 `/` 开头的绝对路径
//! 2. `X:/` 形式的盘符绝对路径
//! 3. 任何等于 `..` 的路径段
//!
//! 完整性分析器和炸弹防护共用同一规则。

use std::borrow::Cow;

/// 不安全的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsafeReason {
    AbsolutePath,
    DriveAbsolute,
    ParentReference,
}

impl UnsafeReason {
    pub fn describe(&self) -> &'static str {
        match self {
            UnsafeReason::AbsolutePath => "absolute path",
            UnsafeReason::DriveAbsolute => "drive-absolute path",
            UnsafeReason::ParentReference => "parent directory reference",
        }
    }
}

/// 路径验证结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationResult {
    /// 路径安全
    Safe,
    /// 路径存在遍历风险
    Unsafe(UnsafeReason),
}

impl ValidationResult {
    pub fn is_safe(&self) -> bool {
        matches!(self, ValidationResult::Safe)
    }
}

/// 将 Windows 分隔符规范化为 `/`
pub fn normalize_separators(name: &str) -> Cow<'_, str> {
    if name.contains('\\') {
        Cow::Owned(name.replace('\\', "/"))
    } else {
        Cow::Borrowed(name)
    }
}

/// 检查条目名称
pub fn validate_entry_name(name: &str) -> ValidationResult {
    let normalized = normalize_separators(name);

    if normalized.starts_with('/') {
        return ValidationResult::Unsafe(UnsafeReason::AbsolutePath);
    }

    let bytes = normalized.as_bytes();
    if bytes.len() >= 3 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' && bytes[2] == b'/' {
        return ValidationResult::Unsafe(UnsafeReason::DriveAbsolute);
    }

    if normalized.split('/').any(|segment| segment == "..") {
        return ValidationResult::Unsafe(UnsafeReason::ParentReference);
    }

    ValidationResult::Safe
}

/// 名称是否违反遍历规则
pub fn is_illegal_name(name: &str) -> bool {
    !validate_entry_name(name).is_safe()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("../../etc/passwd", UnsafeReason::ParentReference)]
    #[case("docs/../../secret", UnsafeReason::ParentReference)]
    #[case("a/b/..", UnsafeReason::ParentReference)]
    #[case("..\\windows\\system32", UnsafeReason::ParentReference)]
    #[case("/etc/shadow", UnsafeReason::AbsolutePath)]
    #[case("\\\\server\\share", UnsafeReason::AbsolutePath)]
    #[case("C:/Windows/win.ini", UnsafeReason::DriveAbsolute)]
    #[case("c:\\boot.ini", UnsafeReason::DriveAbsolute)]
    fn test_unsafe_names(#[case] name: &str, #[case] reason: UnsafeReason) {
        assert_eq!(validate_entry_name(name), ValidationResult::Unsafe(reason));
        assert!(is_illegal_name(name));
    }

    #[rstest]
    #[case("a.txt")]
    #[case("dir/sub/file.bin")]
    #[case("..hidden/file")]
    #[case("file..txt")]
    #[case("./relative.txt")]
    #[case("dir/")]
    #[case("C:relative")]
    fn test_safe_names(#[case] name: &str) {
        assert!(validate_entry_name(name).is_safe(), "{} should be safe", name);
    }

    #[test]
    fn test_normalize_borrows_when_clean() {
        assert!(matches!(normalize_separators("a/b"), Cow::Borrowed(_)));
        assert_eq!(normalize_separators("a\\b"), "a/b");
    }
}
