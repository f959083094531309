//! ZIP 结构解析器
//!
//! 直接在原始字节上扫描本地文件头（LFH, `PK\x03\x04`）和中央目录项
//! （CEN, `PK\x01\x02`），不依赖任何归档库。
//!
//! - 固定偏移字段（名称长度、扩展长度、注释长度）只用于定位名称和推进游标
//! - 固定头或名称越界的记录被跳过，游标前进一个字节后重新同步
//! - 畸形输入永不报错
//!
//! 遍历器还可以通过 EOCD 定位中央目录（修正自解压前缀偏移），失败时回退到
//! 全量 CEN 扫描；没有任何 CEN 记录时回退到本地文件头。

use std::borrow::Cow;
use thiserror::Error;
use tracing::debug;

use crate::utils::encoding::decode_zip_name;

pub const LFH_SIGNATURE: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];
pub const CEN_SIGNATURE: [u8; 4] = [0x50, 0x4B, 0x01, 0x02];
pub const EOCD_SIGNATURE: [u8; 4] = [0x50, 0x4B, 0x05, 0x06];
pub const ZIP64_EOCD_SIGNATURE: [u8; 4] = [0x50, 0x4B, 0x06, 0x06];
pub const ZIP64_LOCATOR_SIGNATURE: [u8; 4] = [0x50, 0x4B, 0x06, 0x07];
pub const DATA_DESCRIPTOR_SIGNATURE: [u8; 4] = [0x50, 0x4B, 0x07, 0x08];

pub const LFH_FIXED_LEN: usize = 30;
pub const CEN_FIXED_LEN: usize = 46;
pub const EOCD_FIXED_LEN: usize = 22;
const ZIP64_LOCATOR_LEN: usize = 20;
const ZIP64_EOCD_FIXED_LEN: usize = 56;

/// EOCD 注释最长 65535 字节
const EOCD_SEARCH_SPAN: usize = EOCD_FIXED_LEN + u16::MAX as usize;

const ZIP64_EXTRA_ID: u16 = 0x0001;
const ZIP64_MARKER_32: u32 = u32::MAX;

/// 压缩方法
pub const METHOD_STORED: u16 = 0;
pub const METHOD_DEFLATED: u16 = 8;

/// 版本号高字节中的宿主系统：Unix
pub const HOST_UNIX: u8 = 3;
/// 宿主系统：OS X (Darwin)
pub const HOST_OSX: u8 = 19;

const S_IFMT: u32 = 0xF000;
const S_IFLNK: u32 = 0xA000;

fn le16(bytes: &[u8], at: usize) -> Option<u16> {
    bytes
        .get(at..at + 2)
        .map(|s| u16::from_le_bytes([s[0], s[1]]))
}

fn le32(bytes: &[u8], at: usize) -> Option<u32> {
    bytes
        .get(at..at + 4)
        .map(|s| u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
}

fn le64(bytes: &[u8], at: usize) -> Option<u64> {
    let s = bytes.get(at..at + 8)?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(s);
    Some(u64::from_le_bytes(buf))
}

fn find_signature(bytes: &[u8], from: usize, signature: &[u8; 4]) -> Option<usize> {
    bytes
        .get(from..)?
        .windows(4)
        .position(|w| w == signature)
        .map(|p| from + p)
}

/// 本地文件头视图（名称借用自输入字节）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalHeader<'a> {
    /// 记录起始偏移
    pub offset: usize,
    pub flags: u16,
    pub method: u16,
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub name_bytes: &'a [u8],
    /// 扩展字段（越界部分被截断）
    pub extra: &'a [u8],
    /// 压缩数据起始偏移
    pub data_offset: usize,
}

impl<'a> LocalHeader<'a> {
    pub fn decoded_name(&self) -> Cow<'a, str> {
        decode_zip_name(self.name_bytes, self.flags)
    }

    /// 标志位 3：大小和 CRC 写在数据之后
    pub fn has_data_descriptor(&self) -> bool {
        self.flags & 0x0008 != 0
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags & 0x0001 != 0
    }
}

/// 中央目录项视图
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CentralHeader<'a> {
    pub offset: usize,
    pub version_made_by: u16,
    pub flags: u16,
    pub method: u16,
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    /// 本地文件头偏移（经目录定位得到时已修正前缀偏移）
    pub local_header_offset: u64,
    pub external_attributes: u32,
    pub name_bytes: &'a [u8],
    pub extra: &'a [u8],
    pub comment: &'a [u8],
    /// 记录总长度（固定头 + 名称 + 扩展 + 注释）
    pub record_len: usize,
}

impl<'a> CentralHeader<'a> {
    pub fn decoded_name(&self) -> Cow<'a, str> {
        decode_zip_name(self.name_bytes, self.flags)
    }

    /// 版本号高字节：创建者的宿主系统
    pub fn host_system(&self) -> u8 {
        (self.version_made_by >> 8) as u8
    }

    pub fn is_unix_host(&self) -> bool {
        matches!(self.host_system(), HOST_UNIX | HOST_OSX)
    }

    /// 外部属性高 16 位的 POSIX 模式
    pub fn unix_mode(&self) -> u32 {
        self.external_attributes >> 16
    }

    /// POSIX 模式为符号链接，且创建者为 Unix 系宿主
    pub fn is_symlink(&self) -> bool {
        self.is_unix_host() && self.unix_mode() & S_IFMT == S_IFLNK
    }

    pub fn is_directory(&self) -> bool {
        self.name_bytes.last() == Some(&b'/')
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags & 0x0001 != 0
    }
}

/// Zip64 扩展字段中按顺序出现的 64 位值
///
/// 只有对应 32 位字段为 0xFFFFFFFF 时才会出现在扩展字段中。
fn apply_zip64_extra(
    extra: &[u8],
    uncompressed: &mut u64,
    compressed: &mut u64,
    local_offset: Option<&mut u64>,
) {
    let mut pos = 0;
    while pos + 4 <= extra.len() {
        let (Some(id), Some(len)) = (le16(extra, pos), le16(extra, pos + 2)) else {
            return;
        };
        let body_start = pos + 4;
        let body_end = (body_start + len as usize).min(extra.len());
        if id == ZIP64_EXTRA_ID {
            let body = &extra[body_start..body_end];
            let mut cursor = 0;
            let mut take = |field: &mut u64| {
                if *field == ZIP64_MARKER_32 as u64 {
                    if let Some(v) = le64(body, cursor) {
                        *field = v;
                        cursor += 8;
                    }
                }
            };
            take(uncompressed);
            take(compressed);
            if let Some(offset) = local_offset {
                take(offset);
            }
            return;
        }
        pos = body_start + len as usize;
    }
}

/// 在 `offset` 处严格解析一个本地文件头
///
/// 固定头或名称越界时返回 `None`。
pub fn read_local_header(bytes: &[u8], offset: usize) -> Option<LocalHeader<'_>> {
    if bytes.get(offset..offset + 4)? != LFH_SIGNATURE {
        return None;
    }
    let header = bytes.get(offset..offset + LFH_FIXED_LEN)?;
    let flags = le16(header, 6)?;
    let method = le16(header, 8)?;
    let crc32 = le32(header, 14)?;
    let mut compressed_size = le32(header, 18)? as u64;
    let mut uncompressed_size = le32(header, 22)? as u64;
    let name_len = le16(header, 26)? as usize;
    let extra_len = le16(header, 28)? as usize;

    let name_start = offset + LFH_FIXED_LEN;
    let name_bytes = bytes.get(name_start..name_start + name_len)?;
    let extra_start = name_start + name_len;
    let extra_end = (extra_start + extra_len).min(bytes.len());
    let extra = &bytes[extra_start..extra_end];

    apply_zip64_extra(extra, &mut uncompressed_size, &mut compressed_size, None);

    Some(LocalHeader {
        offset,
        flags,
        method,
        crc32,
        compressed_size,
        uncompressed_size,
        name_bytes,
        extra,
        data_offset: extra_start + extra_len,
    })
}

/// 在 `offset` 处严格解析一个中央目录项
pub fn read_central_header(bytes: &[u8], offset: usize) -> Option<CentralHeader<'_>> {
    if bytes.get(offset..offset + 4)? != CEN_SIGNATURE {
        return None;
    }
    let header = bytes.get(offset..offset + CEN_FIXED_LEN)?;
    let version_made_by = le16(header, 4)?;
    let flags = le16(header, 8)?;
    let method = le16(header, 10)?;
    let crc32 = le32(header, 16)?;
    let mut compressed_size = le32(header, 20)? as u64;
    let mut uncompressed_size = le32(header, 24)? as u64;
    let name_len = le16(header, 28)? as usize;
    let extra_len = le16(header, 30)? as usize;
    let comment_len = le16(header, 32)? as usize;
    let external_attributes = le32(header, 38)?;
    let mut local_header_offset = le32(header, 42)? as u64;

    let name_start = offset + CEN_FIXED_LEN;
    let name_bytes = bytes.get(name_start..name_start + name_len)?;
    let extra_start = name_start + name_len;
    let extra_end = (extra_start + extra_len).min(bytes.len());
    let extra = &bytes[extra_start..extra_end];
    let comment_start = (extra_start + extra_len).min(bytes.len());
    let comment_end = (extra_start + extra_len + comment_len).min(bytes.len());
    let comment = &bytes[comment_start..comment_end];

    apply_zip64_extra(
        extra,
        &mut uncompressed_size,
        &mut compressed_size,
        Some(&mut local_header_offset),
    );

    Some(CentralHeader {
        offset,
        version_made_by,
        flags,
        method,
        crc32,
        compressed_size,
        uncompressed_size,
        local_header_offset,
        external_attributes,
        name_bytes,
        extra,
        comment,
        record_len: CEN_FIXED_LEN + name_len + extra_len + comment_len,
    })
}

/// 惰性 LFH 扫描
pub struct LocalHeaders<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for LocalHeaders<'a> {
    type Item = LocalHeader<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let Some(at) = find_signature(self.bytes, self.pos, &LFH_SIGNATURE) else {
                self.pos = self.bytes.len();
                return None;
            };
            match read_local_header(self.bytes, at) {
                Some(header) => {
                    // 不使用压缩大小推进：数据描述符存在时它为 0
                    self.pos = header.data_offset;
                    return Some(header);
                }
                None => {
                    debug!(offset = at, "Truncated local header, resyncing");
                    self.pos = at + 1;
                }
            }
        }
    }
}

/// 惰性 CEN 扫描
pub struct CentralHeaders<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for CentralHeaders<'a> {
    type Item = CentralHeader<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        scan_next_central(self.bytes, &mut self.pos)
    }
}

fn scan_next_central<'a>(bytes: &'a [u8], pos: &mut usize) -> Option<CentralHeader<'a>> {
    loop {
        let Some(at) = find_signature(bytes, *pos, &CEN_SIGNATURE) else {
            *pos = bytes.len();
            return None;
        };
        match read_central_header(bytes, at) {
            Some(header) => {
                *pos = at + header.record_len;
                return Some(header);
            }
            None => {
                debug!(offset = at, "Truncated central header, resyncing");
                *pos = at + 1;
            }
        }
    }
}

/// 扫描全部本地文件头
pub fn parse_lfh(bytes: &[u8]) -> LocalHeaders<'_> {
    LocalHeaders { bytes, pos: 0 }
}

/// 扫描全部中央目录项
pub fn parse_cen(bytes: &[u8]) -> CentralHeaders<'_> {
    CentralHeaders { bytes, pos: 0 }
}

/// EOCD 描述的中央目录位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CentralDirectory {
    /// 中央目录在输入中的实际起始偏移
    pub offset: usize,
    pub size: usize,
    pub entries: u64,
    /// 自解压前缀长度：实际偏移减去记录偏移
    pub prefix_len: u64,
}

/// 中央目录无法使用的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DirectoryError {
    #[error("no end of central directory record")]
    EocdNotFound,

    #[error("central directory ({size} bytes at offset {offset}) lies outside the blob")]
    OutOfBounds { offset: u64, size: u64 },
}

/// 从尾部搜索 EOCD 并定位中央目录
///
/// 支持 Zip64 EOCD 定位器。
pub fn find_central_directory(bytes: &[u8]) -> Result<CentralDirectory, DirectoryError> {
    if bytes.len() < EOCD_FIXED_LEN {
        return Err(DirectoryError::EocdNotFound);
    }
    let search_start = bytes.len().saturating_sub(EOCD_SEARCH_SPAN);
    let eocd = (search_start..=bytes.len() - EOCD_FIXED_LEN)
        .rev()
        .find(|&i| bytes[i..i + 4] == EOCD_SIGNATURE)
        .ok_or(DirectoryError::EocdNotFound)?;

    // 搜索范围保证 EOCD 固定部分完整
    let mut entries = le16(bytes, eocd + 10).unwrap_or_default() as u64;
    let mut cd_size = le32(bytes, eocd + 12).unwrap_or_default() as u64;
    let mut cd_offset = le32(bytes, eocd + 16).unwrap_or_default() as u64;
    let mut cd_end = eocd;

    if cd_offset == ZIP64_MARKER_32 as u64 || cd_size == ZIP64_MARKER_32 as u64 || entries == u16::MAX as u64 {
        if let Some(z64) = zip64_end_record(bytes, eocd) {
            if let (Some(e), Some(size), Some(offset)) =
                (le64(bytes, z64 + 32), le64(bytes, z64 + 40), le64(bytes, z64 + 48))
            {
                entries = e;
                cd_size = size;
                cd_offset = offset;
                cd_end = z64;
            }
        }
    }

    let out_of_bounds = DirectoryError::OutOfBounds {
        offset: cd_offset,
        size: cd_size,
    };
    let size = usize::try_from(cd_size).map_err(|_| out_of_bounds)?;
    let actual_start = cd_end.checked_sub(size).ok_or(out_of_bounds)?;
    let prefix_len = (actual_start as u64)
        .checked_sub(cd_offset)
        .ok_or(out_of_bounds)?;

    if bytes.get(actual_start..actual_start + 4) != Some(&CEN_SIGNATURE[..]) && entries > 0 {
        return Err(out_of_bounds);
    }

    Ok(CentralDirectory {
        offset: actual_start,
        size,
        entries,
        prefix_len,
    })
}

/// 64 位 EOCD 的偏移：紧邻定位器之前
fn zip64_end_record(bytes: &[u8], eocd: usize) -> Option<usize> {
    let locator = eocd.checked_sub(ZIP64_LOCATOR_LEN)?;
    if bytes.get(locator..locator + 4) != Some(&ZIP64_LOCATOR_SIGNATURE[..]) {
        return None;
    }
    let declared = le64(bytes, locator + 8)?;
    let z64 = locator.checked_sub(ZIP64_EOCD_FIXED_LEN)?;
    if bytes.get(z64..z64 + 4) != Some(&ZIP64_EOCD_SIGNATURE[..]) {
        return None;
    }
    debug!(declared, actual = z64, "Using zip64 end of central directory");
    Some(z64)
}

/// [`find_central_directory`] 的宽松版本：目录不可用时返回 `None`
pub fn locate_central_directory(bytes: &[u8]) -> Option<CentralDirectory> {
    find_central_directory(bytes).ok()
}

/// 由本地文件头构造目录项视图，供没有中央目录的归档使用
///
/// 设置了数据描述符且未声明压缩大小时，数据长度取到下一个记录签名为止
/// （deflate 流自身会在结尾停止）；未知的解压大小记为 0，由解压过程计数。
fn central_from_local<'a>(bytes: &'a [u8], local: &LocalHeader<'a>) -> CentralHeader<'a> {
    let mut compressed_size = local.compressed_size;
    if local.has_data_descriptor() && compressed_size == 0 {
        let span_end = [LFH_SIGNATURE, CEN_SIGNATURE, DATA_DESCRIPTOR_SIGNATURE]
            .iter()
            .filter_map(|sig| find_signature(bytes, local.data_offset, sig))
            .min()
            .unwrap_or(bytes.len());
        compressed_size = span_end.saturating_sub(local.data_offset) as u64;
    }
    CentralHeader {
        offset: local.offset,
        version_made_by: 0,
        flags: local.flags,
        method: local.method,
        crc32: local.crc32,
        compressed_size,
        uncompressed_size: local.uncompressed_size,
        local_header_offset: local.offset as u64,
        external_attributes: 0,
        name_bytes: local.name_bytes,
        extra: local.extra,
        comment: &[],
        record_len: 0,
    }
}

/// 目录游标（不借用输入，可与所属字节一起保存）
///
/// - EOCD 可用：按记录顺序逐项解析，并修正本地头偏移
/// - 否则存在 CEN 记录：全量扫描 CEN
/// - 连 CEN 都没有：改用本地文件头，使流式解压器能看到的条目同样受预算约束
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryCursor {
    Located {
        pos: usize,
        end: usize,
        prefix_len: u64,
    },
    Scanning {
        pos: usize,
    },
    LocalOnly {
        pos: usize,
    },
}

impl DirectoryCursor {
    pub fn new(bytes: &[u8]) -> Self {
        match find_central_directory(bytes) {
            Ok(dir) => Self::from_directory(&dir),
            Err(reason) if parse_cen(bytes).next().is_some() => {
                debug!(%reason, "Central directory not located, scanning for entries");
                DirectoryCursor::Scanning { pos: 0 }
            }
            Err(reason) => {
                debug!(%reason, "No central records, walking local headers");
                DirectoryCursor::LocalOnly { pos: 0 }
            }
        }
    }

    pub fn from_directory(dir: &CentralDirectory) -> Self {
        DirectoryCursor::Located {
            pos: dir.offset,
            end: dir.offset + dir.size,
            prefix_len: dir.prefix_len,
        }
    }

    pub fn is_located(&self) -> bool {
        matches!(self, DirectoryCursor::Located { .. })
    }

    pub fn is_local_only(&self) -> bool {
        matches!(self, DirectoryCursor::LocalOnly { .. })
    }

    /// 取下一项；`bytes` 必须是创建游标时的同一份输入
    pub fn advance<'a>(&mut self, bytes: &'a [u8]) -> Option<CentralHeader<'a>> {
        match self {
            DirectoryCursor::Located {
                pos,
                end,
                prefix_len,
            } => {
                if *pos >= *end {
                    return None;
                }
                let Some(mut header) = read_central_header(bytes, *pos) else {
                    debug!(offset = *pos, "Central directory ends early");
                    *pos = *end;
                    return None;
                };
                *pos += header.record_len;
                header.local_header_offset = header.local_header_offset.saturating_add(*prefix_len);
                Some(header)
            }
            DirectoryCursor::Scanning { pos } => scan_next_central(bytes, pos),
            DirectoryCursor::LocalOnly { pos } => {
                let mut locals = LocalHeaders { bytes, pos: *pos };
                let next = locals.next();
                *pos = locals.pos;
                let local = next?;
                let header = central_from_local(bytes, &local);
                // 已知数据长度时跳过数据区，避免把内嵌归档的头当作本层条目
                if let Some(end) = usize::try_from(header.compressed_size)
                    .ok()
                    .and_then(|len| local.data_offset.checked_add(len))
                    .filter(|&end| end <= bytes.len())
                {
                    *pos = end;
                }
                Some(header)
            }
        }
    }
}

/// 借用输入的目录列表
pub struct DirectoryListing<'a> {
    bytes: &'a [u8],
    cursor: DirectoryCursor,
}

impl<'a> DirectoryListing<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            cursor: DirectoryCursor::new(bytes),
        }
    }

    /// 只列出 `dir` 描述的目录区
    pub fn from_directory(bytes: &'a [u8], dir: &CentralDirectory) -> Self {
        Self {
            bytes,
            cursor: DirectoryCursor::from_directory(dir),
        }
    }

    pub fn is_located(&self) -> bool {
        self.cursor.is_located()
    }

    pub fn is_local_only(&self) -> bool {
        self.cursor.is_local_only()
    }
}

impl<'a> Iterator for DirectoryListing<'a> {
    type Item = CentralHeader<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        self.cursor.advance(self.bytes)
    }
}
