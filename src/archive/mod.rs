/**
 * 压缩文件安全分析模块
 *
 * 只处理 ZIP 家族，且从不解压到磁盘：
 * - `zip_headers`：LFH / CEN 原始字节解析
 * - `path_validator`：条目名称遍历规则
 * - `integrity`：LFH 与 CEN 交叉校验、符号链接、路径遍历
 * - `budget` / `bomb_guard`：带预算的惰性嵌套遍历（压缩炸弹防护）
 */
pub mod bomb_guard;
pub mod budget;
pub mod integrity;
pub mod path_validator;
pub mod zip_headers;

pub use bomb_guard::{walk, walk_findings, ArchiveWalker, WalkEntry, WalkError};
pub use budget::{calculate_compression_ratio, Budget, BudgetExceeded, WalkCounters};
pub use integrity::{analyze, analyze_bytes, integrity_verdict};
pub use path_validator::{is_illegal_name, validate_entry_name, UnsafeReason, ValidationResult};
pub use zip_headers::{parse_cen, parse_lfh, CentralHeader, DirectoryListing, LocalHeader};
