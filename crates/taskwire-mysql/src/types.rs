//! MySQL type system and value encoding.
//!
//! This module provides:
//! - MySQL field type codes and column flags
//! - Column definition parsing ([`ColumnMeta`])
//! - Text and binary row decoding
//! - Binary parameter encoding for `COM_STMT_EXECUTE`
//!
//! Unsigned integer columns widen to the next signed [`Value`] variant so
//! no value changes sign; `BIGINT UNSIGNED` maps to
//! [`Value::UnsignedBigInt`].

#![allow(clippy::cast_possible_truncation)]

use taskwire_core::{Date, DateTime, Error, Result, Time, TypeError, Value};

use crate::collation::CollationMap;
use crate::protocol::PacketWriter;
use crate::protocol::reader::PacketReader;

/// MySQL field type codes.
///
/// These are the `MYSQL_TYPE_*` constants from the MySQL C API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldType {
    /// DECIMAL (MYSQL_TYPE_DECIMAL)
    Decimal = 0x00,
    /// TINYINT (MYSQL_TYPE_TINY)
    Tiny = 0x01,
    /// SMALLINT (MYSQL_TYPE_SHORT)
    Short = 0x02,
    /// INT (MYSQL_TYPE_LONG)
    Long = 0x03,
    /// FLOAT (MYSQL_TYPE_FLOAT)
    Float = 0x04,
    /// DOUBLE (MYSQL_TYPE_DOUBLE)
    Double = 0x05,
    /// NULL (MYSQL_TYPE_NULL)
    Null = 0x06,
    /// TIMESTAMP (MYSQL_TYPE_TIMESTAMP)
    Timestamp = 0x07,
    /// BIGINT (MYSQL_TYPE_LONGLONG)
    LongLong = 0x08,
    /// MEDIUMINT (MYSQL_TYPE_INT24)
    Int24 = 0x09,
    /// DATE (MYSQL_TYPE_DATE)
    Date = 0x0A,
    /// TIME (MYSQL_TYPE_TIME)
    Time = 0x0B,
    /// DATETIME (MYSQL_TYPE_DATETIME)
    DateTime = 0x0C,
    /// YEAR (MYSQL_TYPE_YEAR)
    Year = 0x0D,
    /// NEWDATE (MYSQL_TYPE_NEWDATE) - internal use
    NewDate = 0x0E,
    /// VARCHAR (MYSQL_TYPE_VARCHAR)
    VarChar = 0x0F,
    /// BIT (MYSQL_TYPE_BIT)
    Bit = 0x10,
    /// TIMESTAMP2 (MYSQL_TYPE_TIMESTAMP2) - MySQL 5.6+
    Timestamp2 = 0x11,
    /// DATETIME2 (MYSQL_TYPE_DATETIME2) - MySQL 5.6+
    DateTime2 = 0x12,
    /// TIME2 (MYSQL_TYPE_TIME2) - MySQL 5.6+
    Time2 = 0x13,
    /// JSON (MYSQL_TYPE_JSON) - MySQL 5.7.8+
    Json = 0xF5,
    /// NEWDECIMAL (MYSQL_TYPE_NEWDECIMAL)
    NewDecimal = 0xF6,
    /// ENUM (MYSQL_TYPE_ENUM)
    Enum = 0xF7,
    /// SET (MYSQL_TYPE_SET)
    Set = 0xF8,
    /// TINYBLOB (MYSQL_TYPE_TINY_BLOB)
    TinyBlob = 0xF9,
    /// MEDIUMBLOB (MYSQL_TYPE_MEDIUM_BLOB)
    MediumBlob = 0xFA,
    /// LONGBLOB (MYSQL_TYPE_LONG_BLOB)
    LongBlob = 0xFB,
    /// BLOB (MYSQL_TYPE_BLOB)
    Blob = 0xFC,
    /// VARCHAR (MYSQL_TYPE_VAR_STRING)
    VarString = 0xFD,
    /// CHAR (MYSQL_TYPE_STRING)
    String = 0xFE,
    /// GEOMETRY (MYSQL_TYPE_GEOMETRY)
    Geometry = 0xFF,
}

impl FieldType {
    /// Parse a field type from a byte.
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => FieldType::Decimal,
            0x01 => FieldType::Tiny,
            0x02 => FieldType::Short,
            0x03 => FieldType::Long,
            0x04 => FieldType::Float,
            0x05 => FieldType::Double,
            0x06 => FieldType::Null,
            0x07 => FieldType::Timestamp,
            0x08 => FieldType::LongLong,
            0x09 => FieldType::Int24,
            0x0A => FieldType::Date,
            0x0B => FieldType::Time,
            0x0C => FieldType::DateTime,
            0x0D => FieldType::Year,
            0x0E => FieldType::NewDate,
            0x0F => FieldType::VarChar,
            0x10 => FieldType::Bit,
            0x11 => FieldType::Timestamp2,
            0x12 => FieldType::DateTime2,
            0x13 => FieldType::Time2,
            0xF5 => FieldType::Json,
            0xF6 => FieldType::NewDecimal,
            0xF7 => FieldType::Enum,
            0xF8 => FieldType::Set,
            0xF9 => FieldType::TinyBlob,
            0xFA => FieldType::MediumBlob,
            0xFB => FieldType::LongBlob,
            0xFC => FieldType::Blob,
            0xFD => FieldType::VarString,
            0xFE => FieldType::String,
            0xFF => FieldType::Geometry,
            _ => FieldType::String, // Unknown types treated as string
        }
    }

    /// Check if this is an integer type.
    #[must_use]
    pub const fn is_integer(self) -> bool {
        matches!(
            self,
            FieldType::Tiny
                | FieldType::Short
                | FieldType::Long
                | FieldType::LongLong
                | FieldType::Int24
                | FieldType::Year
        )
    }

    /// Check if this is a floating-point type.
    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(self, FieldType::Float | FieldType::Double)
    }

    /// Check if this is a decimal type.
    #[must_use]
    pub const fn is_decimal(self) -> bool {
        matches!(self, FieldType::Decimal | FieldType::NewDecimal)
    }

    /// Check if this is a string type.
    #[must_use]
    pub const fn is_string(self) -> bool {
        matches!(
            self,
            FieldType::VarChar
                | FieldType::VarString
                | FieldType::String
                | FieldType::Enum
                | FieldType::Set
        )
    }

    /// Check if this is a binary/blob type.
    #[must_use]
    pub const fn is_blob(self) -> bool {
        matches!(
            self,
            FieldType::TinyBlob
                | FieldType::MediumBlob
                | FieldType::LongBlob
                | FieldType::Blob
                | FieldType::Geometry
        )
    }

    /// Check if this is a date/time type.
    #[must_use]
    pub const fn is_temporal(self) -> bool {
        matches!(
            self,
            FieldType::Date
                | FieldType::Time
                | FieldType::DateTime
                | FieldType::Timestamp
                | FieldType::NewDate
                | FieldType::Timestamp2
                | FieldType::DateTime2
                | FieldType::Time2
        )
    }

    /// Parameters of this type are streamed with COM_STMT_SEND_LONG_DATA
    /// instead of being inlined in the execute payload.
    #[must_use]
    pub const fn is_long_data(self) -> bool {
        matches!(
            self,
            FieldType::TinyBlob | FieldType::MediumBlob | FieldType::LongBlob | FieldType::Blob
        )
    }

    /// Get the type name as a string.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            FieldType::Decimal => "DECIMAL",
            FieldType::Tiny => "TINYINT",
            FieldType::Short => "SMALLINT",
            FieldType::Long => "INT",
            FieldType::Float => "FLOAT",
            FieldType::Double => "DOUBLE",
            FieldType::Null => "NULL",
            FieldType::Timestamp => "TIMESTAMP",
            FieldType::LongLong => "BIGINT",
            FieldType::Int24 => "MEDIUMINT",
            FieldType::Date => "DATE",
            FieldType::Time => "TIME",
            FieldType::DateTime => "DATETIME",
            FieldType::Year => "YEAR",
            FieldType::NewDate => "DATE",
            FieldType::VarChar => "VARCHAR",
            FieldType::Bit => "BIT",
            FieldType::Timestamp2 => "TIMESTAMP",
            FieldType::DateTime2 => "DATETIME",
            FieldType::Time2 => "TIME",
            FieldType::Json => "JSON",
            FieldType::NewDecimal => "DECIMAL",
            FieldType::Enum => "ENUM",
            FieldType::Set => "SET",
            FieldType::TinyBlob => "TINYBLOB",
            FieldType::MediumBlob => "MEDIUMBLOB",
            FieldType::LongBlob => "LONGBLOB",
            FieldType::Blob => "BLOB",
            FieldType::VarString => "VARCHAR",
            FieldType::String => "CHAR",
            FieldType::Geometry => "GEOMETRY",
        }
    }

    /// Can a parameter of this declared type carry `value`?
    pub fn accepts(self, value: &Value) -> bool {
        let textual = self.is_string() || self.is_blob() || self == FieldType::Json;
        match value {
            Value::Null => true,
            Value::Bool(_)
            | Value::TinyInt(_)
            | Value::SmallInt(_)
            | Value::Int(_)
            | Value::BigInt(_)
            | Value::UnsignedBigInt(_) => {
                self.is_integer() || self.is_float() || self.is_decimal()
            }
            Value::Float(_) | Value::Double(_) => self.is_float() || self.is_decimal(),
            Value::Decimal(_) => self.is_decimal() || self.is_string(),
            Value::Text(_) => textual || self.is_decimal() || self.is_temporal(),
            Value::Bytes(_) => textual || matches!(self, FieldType::Bit | FieldType::Geometry),
            Value::Json(_) => textual,
            Value::Date(_) => matches!(
                self,
                FieldType::Date
                    | FieldType::NewDate
                    | FieldType::DateTime
                    | FieldType::DateTime2
                    | FieldType::Timestamp
                    | FieldType::Timestamp2
            ),
            Value::DateTime(_) => matches!(
                self,
                FieldType::Date
                    | FieldType::DateTime
                    | FieldType::DateTime2
                    | FieldType::Timestamp
                    | FieldType::Timestamp2
            ),
            Value::Time(_) => matches!(self, FieldType::Time | FieldType::Time2),
        }
    }
}

/// Column flags in result set metadata.
#[allow(dead_code)]
pub mod column_flags {
    pub const NOT_NULL: u16 = 1;
    pub const PRIMARY_KEY: u16 = 2;
    pub const UNIQUE_KEY: u16 = 4;
    pub const MULTIPLE_KEY: u16 = 8;
    pub const BLOB: u16 = 16;
    pub const UNSIGNED: u16 = 32;
    pub const ZEROFILL: u16 = 64;
    pub const BINARY: u16 = 128;
    pub const ENUM: u16 = 256;
    pub const AUTO_INCREMENT: u16 = 512;
    pub const TIMESTAMP: u16 = 1024;
    pub const SET: u16 = 2048;
    pub const NO_DEFAULT_VALUE: u16 = 4096;
    pub const ON_UPDATE_NOW: u16 = 8192;
    pub const NUM: u16 = 32768;
}

/// Column definition from a result set or a prepare response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMeta {
    /// Catalog name (always "def")
    pub catalog: String,
    /// Schema (database) name
    pub schema: String,
    /// Table name (or alias)
    pub table: String,
    /// Original table name
    pub org_table: String,
    /// Column label as it appears in the result
    pub alias: String,
    /// Original column name
    pub org_name: String,
    /// Collation id of the column's values
    pub collation: u16,
    /// Column length
    pub column_length: u32,
    /// Column type
    pub column_type: FieldType,
    /// Column definition flags
    pub flags: u16,
    /// Number of decimals
    pub decimals: u8,
}

impl ColumnMeta {
    /// Parse a ColumnDefinition41 payload.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut reader = PacketReader::new(payload);
        let catalog = reader.read_lenenc_string("catalog")?;
        let schema = reader.read_lenenc_string("schema")?;
        let table = reader.read_lenenc_string("table")?;
        let org_table = reader.read_lenenc_string("org_table")?;
        let alias = reader.read_lenenc_string("name")?;
        let org_name = reader.read_lenenc_string("org_name")?;
        // length of the fixed-size fields, always 0x0c
        reader.read_lenenc_int("fixed length")?;
        let collation = reader.read_u16_le("character set")?;
        let column_length = reader.read_u32_le("column length")?;
        let column_type = FieldType::from_u8(reader.read_u8("column type")?);
        let flags = reader.read_u16_le("flags")?;
        let decimals = reader.read_u8("decimals")?;

        Ok(Self {
            catalog,
            schema,
            table,
            org_table,
            alias,
            org_name,
            collation,
            column_length,
            column_type,
            flags,
            decimals,
        })
    }

    /// The column label.
    pub fn name(&self) -> &str {
        &self.alias
    }

    #[must_use]
    pub const fn is_not_null(&self) -> bool {
        self.flags & column_flags::NOT_NULL != 0
    }

    #[must_use]
    pub const fn is_primary_key(&self) -> bool {
        self.flags & column_flags::PRIMARY_KEY != 0
    }

    #[must_use]
    pub const fn is_unsigned(&self) -> bool {
        self.flags & column_flags::UNSIGNED != 0
    }

    #[must_use]
    pub const fn is_auto_increment(&self) -> bool {
        self.flags & column_flags::AUTO_INCREMENT != 0
    }
}

/// Decode a text-protocol row.
///
/// Every value is a length-encoded string, or 0xFB for NULL.
pub fn decode_text_row(
    payload: &[u8],
    columns: &[ColumnMeta],
    collations: &CollationMap,
) -> Result<Vec<Value>> {
    let mut reader = PacketReader::new(payload);
    columns
        .iter()
        .map(|column| {
            Ok(match reader.read_lenenc_bytes_or_null(&column.alias)? {
                None => Value::Null,
                Some(data) => decode_text_value(column, data, collations),
            })
        })
        .collect()
}

/// Decode one text-protocol value.
///
/// Unparsable numbers and dates fall back to text rather than failing the
/// row.
pub fn decode_text_value(column: &ColumnMeta, data: &[u8], collations: &CollationMap) -> Value {
    let text = || String::from_utf8_lossy(data).into_owned();
    let s = std::str::from_utf8(data).unwrap_or_default();
    let unsigned = column.is_unsigned();

    match column.column_type {
        FieldType::Tiny if unsigned => s.parse::<u8>().map_or_else(|_| Value::Text(text()), Value::from),
        FieldType::Tiny => s.parse::<i8>().map_or_else(|_| Value::Text(text()), Value::TinyInt),
        FieldType::Short | FieldType::Year if unsigned => {
            s.parse::<u16>().map_or_else(|_| Value::Text(text()), Value::from)
        }
        FieldType::Short | FieldType::Year => {
            s.parse::<i16>().map_or_else(|_| Value::Text(text()), Value::SmallInt)
        }
        FieldType::Long | FieldType::Int24 if unsigned => {
            s.parse::<u32>().map_or_else(|_| Value::Text(text()), Value::from)
        }
        FieldType::Long | FieldType::Int24 => {
            s.parse::<i32>().map_or_else(|_| Value::Text(text()), Value::Int)
        }
        FieldType::LongLong if unsigned => s
            .parse::<u64>()
            .map_or_else(|_| Value::Text(text()), Value::UnsignedBigInt),
        FieldType::LongLong => s.parse::<i64>().map_or_else(|_| Value::Text(text()), Value::BigInt),

        FieldType::Float => s.parse::<f32>().map_or_else(|_| Value::Text(text()), Value::Float),
        FieldType::Double => s.parse::<f64>().map_or_else(|_| Value::Text(text()), Value::Double),

        // keep as text to preserve precision
        FieldType::Decimal | FieldType::NewDecimal => Value::Decimal(text()),

        FieldType::Date | FieldType::NewDate => {
            Date::parse(s).map_or_else(|| Value::Text(text()), Value::Date)
        }
        FieldType::DateTime
        | FieldType::DateTime2
        | FieldType::Timestamp
        | FieldType::Timestamp2 => DateTime::parse(s).map_or_else(|| Value::Text(text()), Value::DateTime),
        FieldType::Time | FieldType::Time2 => {
            Time::parse(s).map_or_else(|| Value::Text(text()), Value::Time)
        }

        FieldType::Json => {
            serde_json::from_str(s).map_or_else(|_| Value::Text(text()), Value::Json)
        }

        FieldType::Bit | FieldType::Geometry => Value::Bytes(data.to_vec()),
        FieldType::Null => Value::Null,

        _ => decode_string(column, data, collations),
    }
}

/// Strings and blobs: binary collation yields bytes, latin1 is widened
/// byte-for-byte, everything else must be UTF-8.
fn decode_string(column: &ColumnMeta, data: &[u8], collations: &CollationMap) -> Value {
    if collations.is_binary(column.collation) {
        return Value::Bytes(data.to_vec());
    }
    if collations
        .get(column.collation)
        .is_some_and(|c| c.charset == "latin1")
    {
        return Value::Text(data.iter().copied().map(char::from).collect());
    }
    match std::str::from_utf8(data) {
        Ok(s) => Value::Text(s.to_string()),
        Err(_) => Value::Bytes(data.to_vec()),
    }
}

/// Decode a binary-protocol row (the reply format of `COM_STMT_EXECUTE`).
///
/// Layout: 0x00 header, a NULL bitmap of `(columns + 7 + 2) / 8` bytes
/// with a bit offset of 2, then the non-NULL values back to back.
pub fn decode_binary_row(
    payload: &[u8],
    columns: &[ColumnMeta],
    collations: &CollationMap,
) -> Result<Vec<Value>> {
    let mut reader = PacketReader::new(payload);
    let header = reader.read_u8("binary row header")?;
    if header != 0x00 {
        return Err(Error::protocol(format!(
            "binary row must start with 0x00, got {header:#04x}"
        )));
    }
    let bitmap = reader.read_bytes((columns.len() + 7 + 2) / 8, "null bitmap")?;

    let mut values = Vec::with_capacity(columns.len());
    for (i, column) in columns.iter().enumerate() {
        let bit = i + 2;
        if bitmap[bit / 8] & (1 << (bit % 8)) != 0 {
            values.push(Value::Null);
            continue;
        }
        values.push(decode_binary_value(&mut reader, column, collations)?);
    }
    Ok(values)
}

fn decode_binary_value(
    reader: &mut PacketReader<'_>,
    column: &ColumnMeta,
    collations: &CollationMap,
) -> Result<Value> {
    let field = column.alias.as_str();
    let unsigned = column.is_unsigned();

    Ok(match column.column_type {
        FieldType::Tiny => {
            let v = reader.read_u8(field)?;
            if unsigned { Value::from(v) } else { Value::TinyInt(v as i8) }
        }
        FieldType::Short | FieldType::Year => {
            let v = reader.read_u16_le(field)?;
            if unsigned { Value::from(v) } else { Value::SmallInt(v as i16) }
        }
        FieldType::Long | FieldType::Int24 => {
            let v = reader.read_u32_le(field)?;
            if unsigned { Value::from(v) } else { Value::Int(v as i32) }
        }
        FieldType::LongLong => {
            let v = reader.read_u64_le(field)?;
            if unsigned { Value::UnsignedBigInt(v) } else { Value::BigInt(v as i64) }
        }
        FieldType::Float => {
            Value::Float(f32::from_bits(reader.read_u32_le(field)?))
        }
        FieldType::Double => {
            Value::Double(f64::from_bits(reader.read_u64_le(field)?))
        }
        FieldType::Null => Value::Null,

        FieldType::Date | FieldType::NewDate => Value::Date(read_binary_datetime(reader, field)?.date),
        FieldType::DateTime
        | FieldType::DateTime2
        | FieldType::Timestamp
        | FieldType::Timestamp2 => Value::DateTime(read_binary_datetime(reader, field)?),
        FieldType::Time | FieldType::Time2 => Value::Time(read_binary_time(reader, field)?),

        FieldType::Decimal | FieldType::NewDecimal => {
            Value::Decimal(reader.read_lenenc_string(field)?)
        }
        FieldType::Json => {
            let data = reader.read_lenenc_bytes(field)?;
            serde_json::from_slice(data).map_or_else(
                |_| Value::Text(String::from_utf8_lossy(data).into_owned()),
                Value::Json,
            )
        }
        FieldType::Bit | FieldType::Geometry => Value::Bytes(reader.read_lenenc_bytes(field)?.to_vec()),
        _ => decode_string(column, reader.read_lenenc_bytes(field)?, collations),
    })
}

/// Length byte 0, 4, 7 or 11, then the components present.
fn read_binary_datetime(reader: &mut PacketReader<'_>, field: &str) -> Result<DateTime> {
    let len = reader.read_u8(field)?;
    let mut dt = DateTime::default();
    if !matches!(len, 0 | 4 | 7 | 11) {
        return Err(Error::protocol(format!(
            "invalid DATETIME length {len} for {field}"
        )));
    }
    if len >= 4 {
        dt.date = Date::new(reader.read_u16_le(field)?, reader.read_u8(field)?, reader.read_u8(field)?);
    }
    if len >= 7 {
        dt.hour = reader.read_u8(field)?;
        dt.minute = reader.read_u8(field)?;
        dt.second = reader.read_u8(field)?;
    }
    if len == 11 {
        dt.micros = reader.read_u32_le(field)?;
    }
    Ok(dt)
}

/// Length byte 0, 8 or 12, then sign, days, h/m/s and optional micros.
fn read_binary_time(reader: &mut PacketReader<'_>, field: &str) -> Result<Time> {
    let len = reader.read_u8(field)?;
    let mut time = Time::default();
    if !matches!(len, 0 | 8 | 12) {
        return Err(Error::protocol(format!("invalid TIME length {len} for {field}")));
    }
    if len >= 8 {
        time.negative = reader.read_u8(field)? != 0;
        time.days = reader.read_u32_le(field)?;
        time.hours = reader.read_u8(field)?;
        time.minutes = reader.read_u8(field)?;
        time.seconds = reader.read_u8(field)?;
    }
    if len == 12 {
        time.micros = reader.read_u32_le(field)?;
    }
    Ok(time)
}

/// A statement parameter together with its wire type.
#[derive(Debug, Clone, PartialEq)]
pub struct BindValue {
    pub value: Value,
    pub field_type: FieldType,
    pub unsigned: bool,
    explicit: bool,
}

impl BindValue {
    /// Bind with the type inferred from the value.
    pub fn new(value: Value) -> Self {
        let (field_type, unsigned) = inferred_type(&value);
        Self {
            value,
            field_type,
            unsigned,
            explicit: false,
        }
    }

    /// Bind with an explicit wire type, checked when the execute is built.
    pub fn typed(value: Value, field_type: FieldType) -> Self {
        let unsigned = matches!(value, Value::UnsignedBigInt(_));
        Self {
            value,
            field_type,
            unsigned,
            explicit: true,
        }
    }

    /// Streamed as long data rather than inlined.
    pub fn is_long_data(&self) -> bool {
        !self.value.is_null() && self.field_type.is_long_data()
    }

    /// Fail fast when an explicit type cannot carry the value.
    pub fn check(&self, index: usize) -> Result<()> {
        if self.explicit && !self.field_type.accepts(&self.value) {
            return Err(Error::Type(TypeError {
                expected: self.field_type.name(),
                actual: self.value.type_name().to_string(),
                column: Some(format!("parameter {index}")),
                rust_type: None,
            }));
        }
        Ok(())
    }

    /// Raw bytes streamed through COM_STMT_SEND_LONG_DATA.
    pub fn long_data(&self) -> Vec<u8> {
        match &self.value {
            Value::Bytes(b) => b.clone(),
            Value::Text(s) | Value::Decimal(s) => s.as_bytes().to_vec(),
            Value::Json(j) => j.to_string().into_bytes(),
            other => text_repr(other).into_bytes(),
        }
    }
}

impl From<Value> for BindValue {
    fn from(value: Value) -> Self {
        BindValue::new(value)
    }
}

fn inferred_type(value: &Value) -> (FieldType, bool) {
    match value {
        Value::Null => (FieldType::Null, false),
        Value::Bool(_) | Value::TinyInt(_) => (FieldType::Tiny, false),
        Value::SmallInt(_) => (FieldType::Short, false),
        Value::Int(_) => (FieldType::Long, false),
        Value::BigInt(_) => (FieldType::LongLong, false),
        Value::UnsignedBigInt(_) => (FieldType::LongLong, true),
        Value::Float(_) => (FieldType::Float, false),
        Value::Double(_) => (FieldType::Double, false),
        Value::Decimal(_) => (FieldType::NewDecimal, false),
        Value::Text(_) => (FieldType::VarString, false),
        Value::Bytes(_) => (FieldType::Blob, false),
        Value::Json(_) => (FieldType::Json, false),
        Value::Date(_) => (FieldType::Date, false),
        Value::Time(_) => (FieldType::Time, false),
        Value::DateTime(_) => (FieldType::DateTime, false),
    }
}

fn text_repr(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => u8::from(*b).to_string(),
        Value::TinyInt(v) => v.to_string(),
        Value::SmallInt(v) => v.to_string(),
        Value::Int(v) => v.to_string(),
        Value::BigInt(v) => v.to_string(),
        Value::UnsignedBigInt(v) => v.to_string(),
        Value::Float(v) => v.to_string(),
        Value::Double(v) => v.to_string(),
        Value::Decimal(s) | Value::Text(s) => s.clone(),
        Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
        Value::Json(j) => j.to_string(),
        Value::Date(d) => d.to_string(),
        Value::Time(t) => t.to_string(),
        Value::DateTime(dt) => dt.to_string(),
    }
}

fn out_of_range(bind: &BindValue, index: usize) -> Error {
    Error::Type(TypeError {
        expected: bind.field_type.name(),
        actual: format!("{} out of range", text_repr(&bind.value)),
        column: Some(format!("parameter {index}")),
        rust_type: None,
    })
}

/// Append the binary encoding of an inline parameter value.
///
/// NULLs and long-data parameters write nothing; the caller covers them
/// through the NULL bitmap and COM_STMT_SEND_LONG_DATA respectively.
pub fn encode_binary_param(writer: &mut PacketWriter, bind: &BindValue, index: usize) -> Result<()> {
    if bind.value.is_null() || bind.is_long_data() {
        return Ok(());
    }
    let ft = bind.field_type;

    if ft.is_integer() {
        let wide: i128 = match &bind.value {
            Value::UnsignedBigInt(v) => i128::from(*v),
            other => other
                .as_i64()
                .map(i128::from)
                .ok_or_else(|| out_of_range(bind, index))?,
        };
        let (min, max, width): (i128, i128, usize) = match (ft, bind.unsigned) {
            (FieldType::Tiny, false) => (i128::from(i8::MIN), i128::from(i8::MAX), 1),
            (FieldType::Tiny, true) => (0, i128::from(u8::MAX), 1),
            (FieldType::Short | FieldType::Year, false) => (i128::from(i16::MIN), i128::from(i16::MAX), 2),
            (FieldType::Short | FieldType::Year, true) => (0, i128::from(u16::MAX), 2),
            (FieldType::Long | FieldType::Int24, false) => (i128::from(i32::MIN), i128::from(i32::MAX), 4),
            (FieldType::Long | FieldType::Int24, true) => (0, i128::from(u32::MAX), 4),
            (_, false) => (i128::from(i64::MIN), i128::from(i64::MAX), 8),
            (_, true) => (0, i128::from(u64::MAX), 8),
        };
        if wide < min || wide > max {
            return Err(out_of_range(bind, index));
        }
        writer.write_bytes(&wide.to_le_bytes()[..width]);
        return Ok(());
    }

    match (ft, &bind.value) {
        (FieldType::Float, v) => {
            let f = v.as_f64().ok_or_else(|| out_of_range(bind, index))?;
            writer.write_u32_le((f as f32).to_bits());
        }
        (FieldType::Double, v) => {
            let f = v.as_f64().ok_or_else(|| out_of_range(bind, index))?;
            writer.write_u64_le(f.to_bits());
        }
        (_, Value::Date(d)) => write_binary_datetime(
            writer,
            &DateTime {
                date: *d,
                ..DateTime::default()
            },
        ),
        (_, Value::DateTime(dt)) => write_binary_datetime(writer, dt),
        (_, Value::Time(t)) => write_binary_time(writer, t),
        (_, Value::Bytes(b)) => writer.write_lenenc_bytes(b),
        (_, other) => writer.write_lenenc_string(&text_repr(other)),
    }
    Ok(())
}

fn write_binary_datetime(writer: &mut PacketWriter, dt: &DateTime) {
    let has_time = dt.hour != 0 || dt.minute != 0 || dt.second != 0 || dt.micros != 0;
    let len = if dt.micros != 0 {
        11
    } else if has_time {
        7
    } else if !dt.date.is_zero() {
        4
    } else {
        0
    };
    writer.write_u8(len);
    if len >= 4 {
        writer.write_u16_le(dt.date.year);
        writer.write_u8(dt.date.month);
        writer.write_u8(dt.date.day);
    }
    if len >= 7 {
        writer.write_u8(dt.hour);
        writer.write_u8(dt.minute);
        writer.write_u8(dt.second);
    }
    if len == 11 {
        writer.write_u32_le(dt.micros);
    }
}

fn write_binary_time(writer: &mut PacketWriter, t: &Time) {
    let is_zero = t.days == 0 && t.hours == 0 && t.minutes == 0 && t.seconds == 0 && t.micros == 0;
    let len = if t.micros != 0 {
        12
    } else if is_zero {
        0
    } else {
        8
    };
    writer.write_u8(len);
    if len >= 8 {
        writer.write_u8(u8::from(t.negative));
        writer.write_u32_le(t.days);
        writer.write_u8(t.hours);
        writer.write_u8(t.minutes);
        writer.write_u8(t.seconds);
    }
    if len == 12 {
        writer.write_u32_le(t.micros);
    }
}
