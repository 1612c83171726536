//! 上传文件名清洗与存储名生成。

/// 清洗结果为空时使用的兜底名称。
pub const FALLBACK_NAME: &str = "file";

/// 单个文件名允许的最大字节数（含时间戳前缀的余量）。
const MAX_NAME_BYTES: usize = 200;

/// 将客户端提供的任意文件名转换为可安全落盘的基础名。
///
/// 只保留最后一个路径段，带变音符号的拉丁字母折叠为基础字母，
/// 其余非 `[A-Za-z0-9._-]` 字符被丢弃（空白替换为 `_`），
/// 连续的 `.` 折叠为一个，去掉开头的 `.` 与 `_`，结果为空时返回 [`FALLBACK_NAME`]。
pub fn sanitize_filename(raw: &str) -> String {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or(raw);

    let mut cleaned = String::with_capacity(base.len());
    for c in base.chars() {
        let mapped = match c {
            c if c.is_ascii_alphanumeric() => c,
            '.' if cleaned.ends_with('.') => continue,
            '.' | '-' | '_' => c,
            c if c.is_whitespace() => '_',
            c => match fold_to_ascii(c) {
                Some(folded) => folded,
                None => continue,
            },
        };
        cleaned.push(mapped);
    }

    let cleaned = cleaned.trim_start_matches(['.', '_']).trim_end_matches('.');
    if cleaned.is_empty() {
        return FALLBACK_NAME.to_string();
    }

    truncate_keeping_extension(cleaned)
}

/// 生成 `{timestamp}_{sanitized}` 形式的存储名。
pub fn stored_name(timestamp: i64, raw: &str) -> String {
    format!("{timestamp}_{}", sanitize_filename(raw))
}

/// 去掉变音符号后的 ASCII 字母（与 NFKD 分解后丢弃非 ASCII 的结果一致）。
/// 没有分解形式的字母（如 `ß`、`ø`、`ł`）返回 `None`。
fn fold_to_ascii(c: char) -> Option<char> {
    let code = u32::from(c);
    // 全角字母与数字
    if matches!(code, 0xFF10..=0xFF19 | 0xFF21..=0xFF3A | 0xFF41..=0xFF5A) {
        return char::from_u32(code - 0xFEE0);
    }
    let base = match code {
        0xC0..=0xC5 | 0xE0..=0xE5 | 0x100..=0x105 => 'a',
        0xC7 | 0xE7 | 0x106..=0x10D => 'c',
        0x10E..=0x10F => 'd',
        0xC8..=0xCB | 0xE8..=0xEB | 0x112..=0x11B => 'e',
        0x11C..=0x123 => 'g',
        0x124..=0x125 => 'h',
        0xCC..=0xCF | 0xEC..=0xEF | 0x128..=0x130 => 'i',
        0x134..=0x135 => 'j',
        0x136..=0x137 => 'k',
        0x139..=0x140 => 'l',
        0xD1 | 0xF1 | 0x143..=0x149 => 'n',
        0xD2..=0xD6 | 0xF2..=0xF6 | 0x14C..=0x151 => 'o',
        0x154..=0x159 => 'r',
        0x15A..=0x161 | 0x17F => 's',
        0x162..=0x165 => 't',
        0xD9..=0xDC | 0xF9..=0xFC | 0x168..=0x173 => 'u',
        0x174..=0x175 => 'w',
        0xDD | 0xFD | 0xFF | 0x176..=0x178 => 'y',
        0x179..=0x17E => 'z',
        _ => return None,
    };
    Some(if c.is_uppercase() {
        base.to_ascii_uppercase()
    } else {
        base
    })
}

fn truncate_keeping_extension(name: &str) -> String {
    if name.len() <= MAX_NAME_BYTES {
        return name.to_string();
    }
    // 清洗后只剩 ASCII，按字节切分是安全的
    match name.rfind('.') {
        Some(dot) if name.len() - dot < MAX_NAME_BYTES / 2 => {
            let ext = &name[dot..];
            let keep = MAX_NAME_BYTES - ext.len();
            format!("{}{}", &name[..keep], ext)
        }
        _ => name[..MAX_NAME_BYTES].to_string(),
    }
}
