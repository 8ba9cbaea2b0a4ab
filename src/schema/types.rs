use crate::event::Value;
use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("unknown source type '{0}'")]
    UnknownType(String),

    #[error("invalid type arguments for '{ty}': {args}")]
    InvalidArguments { ty: String, args: String },
}

/// Column type in the target store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TargetType {
    Boolean,
    TinyInt,
    SmallInt,
    Integer,
    BigInt,
    UTinyInt,
    USmallInt,
    UInteger,
    UBigInt,
    Float,
    Double,
    Decimal { precision: u8, scale: u8 },
    Varchar,
    Blob,
    Date,
    Time,
    Timestamp,
}

const MAX_DECIMAL_PRECISION: u8 = 38;

/// Day number of 1970-01-01 counted from 0001-01-01 as day one.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

impl TargetType {
    /// Map a MySQL column type to its target equivalent.
    ///
    /// `args` is the text between the parentheses of the type, if any.
    pub fn from_source(type_name: &str, args: Option<&str>, unsigned: bool) -> Result<Self, TypeError> {
        let name = type_name.to_ascii_lowercase();
        let args = args.map(str::trim).filter(|a| !a.is_empty());

        let ty = match name.as_str() {
            "bool" | "boolean" => TargetType::Boolean,
            "tinyint" if args == Some("1") && !unsigned => TargetType::Boolean,
            "tinyint" if unsigned => TargetType::UTinyInt,
            "tinyint" => TargetType::TinyInt,
            "smallint" if unsigned => TargetType::USmallInt,
            "smallint" | "year" => TargetType::SmallInt,
            "mediumint" | "int" | "integer" if unsigned => TargetType::UInteger,
            "mediumint" | "int" | "integer" => TargetType::Integer,
            "bigint" | "serial" if unsigned => TargetType::UBigInt,
            "serial" => TargetType::UBigInt,
            "bigint" => TargetType::BigInt,
            "float" => TargetType::Float,
            "double" | "real" => TargetType::Double,
            "decimal" | "numeric" | "dec" | "fixed" => parse_decimal(&name, args)?,
            "char" | "varchar" | "tinytext" | "text" | "mediumtext" | "longtext" | "enum"
            | "set" | "json" | "nchar" | "nvarchar" => TargetType::Varchar,
            "binary" | "varbinary" | "tinyblob" | "blob" | "mediumblob" | "longblob" | "bit" => {
                TargetType::Blob
            }
            "date" => TargetType::Date,
            "time" => TargetType::Time,
            "datetime" | "timestamp" => TargetType::Timestamp,
            _ => return Err(TypeError::UnknownType(type_name.to_string())),
        };
        Ok(ty)
    }

    /// Type as rendered in target DDL.
    pub fn sql(&self) -> String {
        match self {
            TargetType::Boolean => "BOOLEAN".to_string(),
            TargetType::TinyInt => "TINYINT".to_string(),
            TargetType::SmallInt => "SMALLINT".to_string(),
            TargetType::Integer => "INTEGER".to_string(),
            TargetType::BigInt => "BIGINT".to_string(),
            TargetType::UTinyInt => "UTINYINT".to_string(),
            TargetType::USmallInt => "USMALLINT".to_string(),
            TargetType::UInteger => "UINTEGER".to_string(),
            TargetType::UBigInt => "UBIGINT".to_string(),
            TargetType::Float => "FLOAT".to_string(),
            TargetType::Double => "DOUBLE".to_string(),
            TargetType::Decimal { precision, scale } => format!("DECIMAL({},{})", precision, scale),
            TargetType::Varchar => "VARCHAR".to_string(),
            TargetType::Blob => "BLOB".to_string(),
            TargetType::Date => "DATE".to_string(),
            TargetType::Time => "TIME".to_string(),
            TargetType::Timestamp => "TIMESTAMP".to_string(),
        }
    }

    /// Whether every value of `self` is representable in `to` without loss.
    pub fn can_widen_to(&self, to: &TargetType) -> bool {
        if self == to || *to == TargetType::Varchar {
            return true;
        }

        match (self.integer_rank(), to.integer_rank()) {
            (Some((from_signed, from_rank)), Some((to_signed, to_rank))) => {
                return match (from_signed, to_signed) {
                    (true, true) | (false, false) => to_rank >= from_rank,
                    (false, true) => to_rank > from_rank,
                    (true, false) => false,
                };
            }
            (Some((_, rank)), None) => {
                return match to {
                    TargetType::Float => rank <= 2,
                    TargetType::Double => rank <= 3,
                    TargetType::Decimal { precision, scale } => {
                        self.integer_digits().unwrap_or(u8::MAX) <= precision.saturating_sub(*scale)
                    }
                    _ => false,
                };
            }
            _ => {}
        }

        match (self, to) {
            (TargetType::Float, TargetType::Double) => true,
            (
                TargetType::Decimal { precision: p1, scale: s1 },
                TargetType::Decimal { precision: p2, scale: s2 },
            ) => s2 >= s1 && p2.saturating_sub(*s2) >= p1.saturating_sub(*s1),
            (TargetType::Date, TargetType::Timestamp) => true,
            _ => false,
        }
    }

    /// Value written for a NOT NULL column the event did not provide.
    pub fn default_value(&self) -> Value {
        match self {
            TargetType::Boolean => Value::Bool(false),
            TargetType::TinyInt | TargetType::SmallInt | TargetType::Integer | TargetType::BigInt => {
                Value::Int(0)
            }
            TargetType::UTinyInt
            | TargetType::USmallInt
            | TargetType::UInteger
            | TargetType::UBigInt => Value::UInt(0),
            TargetType::Float | TargetType::Double => Value::Float(0.0),
            TargetType::Decimal { .. } => Value::String("0".to_string()),
            TargetType::Varchar => Value::String(String::new()),
            TargetType::Blob => Value::Bytes(Vec::new()),
            TargetType::Date => Value::String("1970-01-01".to_string()),
            TargetType::Time => Value::String("00:00:00".to_string()),
            TargetType::Timestamp => Value::String("1970-01-01 00:00:00".to_string()),
        }
    }

    /// Convert a source value into the shape the target column expects.
    ///
    /// Temporal integers follow the replication log's conventions: days since
    /// the epoch for dates, milliseconds for timestamps, microseconds for times.
    pub fn coerce(&self, value: Value) -> Result<Value, String> {
        if value.is_null() {
            return Ok(Value::Null);
        }

        match self {
            TargetType::Boolean => match value {
                Value::Bool(b) => Ok(Value::Bool(b)),
                Value::Int(i) => Ok(Value::Bool(i != 0)),
                Value::UInt(u) => Ok(Value::Bool(u != 0)),
                Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "1" => Ok(Value::Bool(true)),
                    "false" | "0" => Ok(Value::Bool(false)),
                    _ => Err(format!("'{}' is not a boolean", s)),
                },
                other => Err(format!("{} is not a boolean", other)),
            },
            TargetType::TinyInt
            | TargetType::SmallInt
            | TargetType::Integer
            | TargetType::BigInt
            | TargetType::UTinyInt
            | TargetType::USmallInt
            | TargetType::UInteger
            | TargetType::UBigInt => self.coerce_integer(value),
            TargetType::Float | TargetType::Double => match value {
                Value::Float(f) => Ok(Value::Float(f)),
                Value::Int(i) => Ok(Value::Float(i as f64)),
                Value::UInt(u) => Ok(Value::Float(u as f64)),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(Value::Float)
                    .map_err(|_| format!("'{}' is not a number", s)),
                other => Err(format!("{} is not a number", other)),
            },
            TargetType::Decimal { .. } => match value {
                Value::Int(i) => Ok(Value::String(i.to_string())),
                Value::UInt(u) => Ok(Value::String(u.to_string())),
                Value::Float(f) => Ok(Value::String(f.to_string())),
                Value::String(s) => {
                    let trimmed = s.trim();
                    if trimmed.parse::<f64>().is_ok() {
                        Ok(Value::String(trimmed.to_string()))
                    } else {
                        Err(format!("'{}' is not a decimal", s))
                    }
                }
                other => Err(format!("{} is not a decimal", other)),
            },
            TargetType::Varchar => match value {
                Value::String(s) => Ok(Value::String(s)),
                Value::Bytes(b) => Ok(Value::String(String::from_utf8_lossy(&b).into_owned())),
                other => Ok(Value::String(other.to_string())),
            },
            TargetType::Blob => match value {
                Value::Bytes(b) => Ok(Value::Bytes(b)),
                Value::String(s) => Ok(Value::Bytes(s.into_bytes())),
                other => Err(format!("{} is not binary", other)),
            },
            TargetType::Date => match value {
                Value::String(s) => Ok(Value::String(s)),
                Value::Int(days) => i32::try_from(days)
                    .ok()
                    .and_then(|d| d.checked_add(UNIX_EPOCH_DAYS_FROM_CE))
                    .and_then(NaiveDate::from_num_days_from_ce_opt)
                    .map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
                    .ok_or_else(|| format!("{} days is out of range", days)),
                other => Err(format!("{} is not a date", other)),
            },
            TargetType::Time => match value {
                Value::String(s) => Ok(Value::String(s)),
                Value::Int(micros) if micros >= 0 => {
                    let secs = micros / 1_000_000;
                    Ok(Value::String(format!(
                        "{:02}:{:02}:{:02}.{:06}",
                        secs / 3600,
                        (secs / 60) % 60,
                        secs % 60,
                        micros % 1_000_000
                    )))
                }
                other => Err(format!("{} is not a time", other)),
            },
            TargetType::Timestamp => match value {
                Value::String(s) => Ok(Value::String(s)),
                Value::Int(millis) => DateTime::from_timestamp_millis(millis)
                    .map(|ts| Value::String(ts.naive_utc().format("%Y-%m-%d %H:%M:%S%.3f").to_string()))
                    .ok_or_else(|| format!("{} ms is out of range", millis)),
                other => Err(format!("{} is not a timestamp", other)),
            },
        }
    }

    fn coerce_integer(&self, value: Value) -> Result<Value, String> {
        let wide: i128 = match &value {
            Value::Int(i) => i128::from(*i),
            Value::UInt(u) => i128::from(*u),
            Value::Bool(b) => i128::from(*b),
            Value::Float(f) if f.fract() == 0.0 && f.is_finite() => *f as i128,
            Value::String(s) => s
                .trim()
                .parse::<i128>()
                .map_err(|_| format!("'{}' is not an integer", s))?,
            other => return Err(format!("{} is not an integer", other)),
        };

        let (min, max) = self.integer_bounds().unwrap_or((i128::MIN, i128::MAX));
        if wide < min || wide > max {
            return Err(format!("{} is out of range for {}", wide, self.sql()));
        }

        Ok(match i64::try_from(wide) {
            Ok(i) => Value::Int(i),
            Err(_) => Value::UInt(wide as u64),
        })
    }

    fn integer_bounds(&self) -> Option<(i128, i128)> {
        let bounds = match self {
            TargetType::TinyInt => (i8::MIN as i128, i8::MAX as i128),
            TargetType::SmallInt => (i16::MIN as i128, i16::MAX as i128),
            TargetType::Integer => (i32::MIN as i128, i32::MAX as i128),
            TargetType::BigInt => (i64::MIN as i128, i64::MAX as i128),
            TargetType::UTinyInt => (0, u8::MAX as i128),
            TargetType::USmallInt => (0, u16::MAX as i128),
            TargetType::UInteger => (0, u32::MAX as i128),
            TargetType::UBigInt => (0, u64::MAX as i128),
            _ => return None,
        };
        Some(bounds)
    }

    /// (signed, rank) for integer types.
    fn integer_rank(&self) -> Option<(bool, u8)> {
        match self {
            TargetType::TinyInt => Some((true, 1)),
            TargetType::SmallInt => Some((true, 2)),
            TargetType::Integer => Some((true, 3)),
            TargetType::BigInt => Some((true, 4)),
            TargetType::UTinyInt => Some((false, 1)),
            TargetType::USmallInt => Some((false, 2)),
            TargetType::UInteger => Some((false, 3)),
            TargetType::UBigInt => Some((false, 4)),
            _ => None,
        }
    }

    fn integer_digits(&self) -> Option<u8> {
        match self {
            TargetType::TinyInt | TargetType::UTinyInt => Some(3),
            TargetType::SmallInt | TargetType::USmallInt => Some(5),
            TargetType::Integer | TargetType::UInteger => Some(10),
            TargetType::BigInt => Some(19),
            TargetType::UBigInt => Some(20),
            _ => None,
        }
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql())
    }
}

fn parse_decimal(name: &str, args: Option<&str>) -> Result<TargetType, TypeError> {
    let invalid = || TypeError::InvalidArguments {
        ty: name.to_string(),
        args: args.unwrap_or_default().to_string(),
    };

    // MySQL defaults: DECIMAL = DECIMAL(10,0), DECIMAL(p) = DECIMAL(p,0)
    let (precision, scale) = match args {
        None => (10u8, 0u8),
        Some(args) => {
            let mut parts = args.split(',').map(str::trim);
            let precision = parts
                .next()
                .and_then(|p| p.parse::<u8>().ok())
                .ok_or_else(invalid)?;
            let scale = match parts.next() {
                Some(s) => s.parse::<u8>().map_err(|_| invalid())?,
                None => 0,
            };
            (precision, scale)
        }
    };

    if precision == 0 || precision > MAX_DECIMAL_PRECISION || scale > precision {
        return Err(invalid());
    }

    Ok(TargetType::Decimal { precision, scale })
}
