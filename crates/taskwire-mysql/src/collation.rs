//! Character set and collation tables.
//!
//! The handshake and column definitions identify text encodings by
//! collation id. The session keeps an id→collation map and a
//! charset-name→default-collation map built from [`COLLATIONS`].

use std::collections::HashMap;

pub const LATIN1_SWEDISH_CI: u16 = 8;
pub const UTF8_GENERAL_CI: u16 = 33;
pub const UTF8MB4_GENERAL_CI: u16 = 45;
pub const BINARY: u16 = 63;
pub const UTF8MB4_BIN: u16 = 46;
pub const UTF8MB4_UNICODE_CI: u16 = 224;
pub const UTF8MB4_0900_AI_CI: u16 = 255;

/// One server collation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Collation {
    pub id: u16,
    pub name: &'static str,
    pub charset: &'static str,
    /// Maximum bytes per character
    pub max_len: u8,
    /// Default collation of its charset
    pub is_default: bool,
}

impl Collation {
    /// Values in this collation are raw bytes, not text.
    pub fn is_binary(&self) -> bool {
        self.id == BINARY
    }
}

const fn c(id: u16, name: &'static str, charset: &'static str, max_len: u8, is_default: bool) -> Collation {
    Collation {
        id,
        name,
        charset,
        max_len,
        is_default,
    }
}

/// Collations known without asking the server.
pub static COLLATIONS: &[Collation] = &[
    c(1, "big5_chinese_ci", "big5", 2, true),
    c(3, "dec8_swedish_ci", "dec8", 1, true),
    c(4, "cp850_general_ci", "cp850", 1, true),
    c(6, "hp8_english_ci", "hp8", 1, true),
    c(7, "koi8r_general_ci", "koi8r", 1, true),
    c(LATIN1_SWEDISH_CI, "latin1_swedish_ci", "latin1", 1, true),
    c(9, "latin2_general_ci", "latin2", 1, true),
    c(10, "swe7_swedish_ci", "swe7", 1, true),
    c(11, "ascii_general_ci", "ascii", 1, true),
    c(12, "ujis_japanese_ci", "ujis", 3, true),
    c(13, "sjis_japanese_ci", "sjis", 2, true),
    c(16, "hebrew_general_ci", "hebrew", 1, true),
    c(18, "tis620_thai_ci", "tis620", 1, true),
    c(19, "euckr_korean_ci", "euckr", 2, true),
    c(22, "koi8u_general_ci", "koi8u", 1, true),
    c(24, "gb2312_chinese_ci", "gb2312", 2, true),
    c(25, "greek_general_ci", "greek", 1, true),
    c(26, "cp1250_general_ci", "cp1250", 1, true),
    c(28, "gbk_chinese_ci", "gbk", 2, true),
    c(30, "latin5_turkish_ci", "latin5", 1, true),
    c(32, "armscii8_general_ci", "armscii8", 1, true),
    c(UTF8_GENERAL_CI, "utf8_general_ci", "utf8", 3, true),
    c(35, "ucs2_general_ci", "ucs2", 2, true),
    c(36, "cp866_general_ci", "cp866", 1, true),
    c(37, "keybcs2_general_ci", "keybcs2", 1, true),
    c(38, "macce_general_ci", "macce", 1, true),
    c(39, "macroman_general_ci", "macroman", 1, true),
    c(40, "cp852_general_ci", "cp852", 1, true),
    c(41, "latin7_general_ci", "latin7", 1, true),
    c(UTF8MB4_GENERAL_CI, "utf8mb4_general_ci", "utf8mb4", 4, false),
    c(UTF8MB4_BIN, "utf8mb4_bin", "utf8mb4", 4, false),
    c(47, "latin1_bin", "latin1", 1, false),
    c(48, "latin1_general_ci", "latin1", 1, false),
    c(51, "cp1251_general_ci", "cp1251", 1, true),
    c(54, "utf16_general_ci", "utf16", 4, true),
    c(56, "utf16le_general_ci", "utf16le", 4, true),
    c(57, "cp1256_general_ci", "cp1256", 1, true),
    c(59, "cp1257_general_ci", "cp1257", 1, true),
    c(60, "utf32_general_ci", "utf32", 4, true),
    c(BINARY, "binary", "binary", 1, true),
    c(65, "ascii_bin", "ascii", 1, false),
    c(83, "utf8_bin", "utf8", 3, false),
    c(92, "geostd8_general_ci", "geostd8", 1, true),
    c(95, "cp932_japanese_ci", "cp932", 2, true),
    c(97, "eucjpms_japanese_ci", "eucjpms", 3, true),
    c(192, "utf8_unicode_ci", "utf8", 3, false),
    c(UTF8MB4_UNICODE_CI, "utf8mb4_unicode_ci", "utf8mb4", 4, false),
    c(248, "gb18030_chinese_ci", "gb18030", 4, true),
    c(UTF8MB4_0900_AI_CI, "utf8mb4_0900_ai_ci", "utf8mb4", 4, true),
    c(309, "utf8mb4_0900_bin", "utf8mb4", 4, false),
];

/// Look up a built-in collation by id.
pub fn by_id(id: u16) -> Option<&'static Collation> {
    COLLATIONS.iter().find(|c| c.id == id)
}

/// Look up a built-in collation by name (case-insensitive).
pub fn by_name(name: &str) -> Option<&'static Collation> {
    COLLATIONS.iter().find(|c| c.name.eq_ignore_ascii_case(name))
}

/// Per-connection collation lookup tables.
#[derive(Debug, Clone)]
pub struct CollationMap {
    by_id: HashMap<u16, Collation>,
    charset_default: HashMap<&'static str, u16>,
}

impl Default for CollationMap {
    fn default() -> Self {
        let mut map = Self {
            by_id: HashMap::with_capacity(COLLATIONS.len()),
            charset_default: HashMap::new(),
        };
        for collation in COLLATIONS {
            map.register(*collation);
        }
        map
    }
}

impl CollationMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a collation (e.g. from `SHOW COLLATION`).
    pub fn register(&mut self, collation: Collation) {
        if collation.is_default || !self.charset_default.contains_key(collation.charset) {
            self.charset_default.insert(collation.charset, collation.id);
        }
        self.by_id.insert(collation.id, collation);
    }

    pub fn get(&self, id: u16) -> Option<&Collation> {
        self.by_id.get(&id)
    }

    /// Default collation id for a charset name such as `utf8mb4`.
    pub fn default_for_charset(&self, charset: &str) -> Option<u16> {
        self.charset_default
            .get(charset.to_ascii_lowercase().as_str())
            .copied()
    }

    /// Whether column values in this collation decode as raw bytes.
    pub fn is_binary(&self, id: u16) -> bool {
        self.get(id).is_some_and(Collation::is_binary)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
