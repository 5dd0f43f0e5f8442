use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures::{future, stream, StreamExt, TryStreamExt};
use parking_lot::RwLock;
use serde_json::{json, Value};
use sqlx::postgres::types::PgInterval;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow, PgTypeKind, Postgres};
use sqlx::query::Query as SqlxQuery;
use sqlx::types::ipnetwork::IpNetwork;
use sqlx::types::Decimal;
use sqlx::{Column, Either, Executor, Row as _, TypeInfo};
use tracing::{debug, info};
use uuid::Uuid;

use super::{Row, RowStream, StoreBackend, StoreMode};
use crate::binder::Arg;
use crate::error::{Error, Result};

type PgQuery<'q> = SqlxQuery<'q, Postgres, PgArguments>;

#[derive(Clone, Debug)]
pub struct PgStoreConfig {
    pub url: String,
    pub max_connections: u32,
    pub connect_timeout: Duration,
}

impl PgStoreConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 8,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Postgres backend. Pooling is left to sqlx.
///
/// Arguments arrive as text. Each statement is described once so every
/// argument can be converted to the parameter type the server inferred,
/// which lets `WHERE id = :id` work against an integer column without a cast.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    param_kinds: Arc<RwLock<HashMap<String, Arc<[ParamKind]>>>>,
}

impl PgStore {
    pub async fn connect(config: &PgStoreConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout)
            .connect(&config.url)
            .await
            .map_err(|e| Error::Config(format!("Cannot connect to database: {}", e)))?;
        info!(max_connections = config.max_connections, "Connected to Postgres");
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            param_kinds: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn param_kinds(&self, sql: &str) -> Result<Arc<[ParamKind]>> {
        let cached = self.param_kinds.read().get(sql).cloned();
        if let Some(kinds) = cached {
            return Ok(kinds);
        }

        let described = (&self.pool).describe(sql).await?;
        let kinds: Arc<[ParamKind]> = match described.parameters() {
            Some(Either::Left(types)) => types
                .iter()
                .map(|t| ParamKind::from_type_name(t.name()))
                .collect(),
            _ => Arc::from(Vec::new()),
        };
        debug!(params = kinds.len(), "Described statement");

        self.param_kinds
            .write()
            .insert(sql.to_string(), Arc::clone(&kinds));
        Ok(kinds)
    }
}

#[async_trait]
impl StoreBackend for PgStore {
    fn mode(&self) -> StoreMode {
        StoreMode::Postgres
    }

    fn fetch<'a>(&'a self, sql: &'a str, args: &'a [Arg]) -> RowStream<'a> {
        stream::once(self.param_kinds(sql))
            .and_then(move |kinds| future::ready(typed_args(&kinds, args)))
            .map_ok(move |typed| {
                let mut query = sqlx::query(sql);
                for arg in typed {
                    query = arg.bind(query);
                }
                query
                    .fetch(&self.pool)
                    .map(|row| row.map_err(Error::from).and_then(|r| row_to_values(&r)))
                    .boxed()
            })
            .try_flatten()
            .boxed()
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(Error::from)
    }
}

/// Parameter types the store converts text arguments into. Anything else is
/// bound as text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParamKind {
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    Numeric,
    Bool,
    Uuid,
    Date,
    Time,
    Timestamp,
    Timestamptz,
    Jsonb,
    Text,
}

impl ParamKind {
    fn from_type_name(name: &str) -> Self {
        match name.to_ascii_uppercase().as_str() {
            "INT2" => ParamKind::Int2,
            "INT4" => ParamKind::Int4,
            "INT8" => ParamKind::Int8,
            "FLOAT4" => ParamKind::Float4,
            "FLOAT8" => ParamKind::Float8,
            "NUMERIC" => ParamKind::Numeric,
            "BOOL" => ParamKind::Bool,
            "UUID" => ParamKind::Uuid,
            "DATE" => ParamKind::Date,
            "TIME" => ParamKind::Time,
            "TIMESTAMP" => ParamKind::Timestamp,
            "TIMESTAMPTZ" => ParamKind::Timestamptz,
            "JSON" | "JSONB" => ParamKind::Jsonb,
            _ => ParamKind::Text,
        }
    }

    fn name(self) -> &'static str {
        match self {
            ParamKind::Int2 => "int2",
            ParamKind::Int4 => "int4",
            ParamKind::Int8 => "int8",
            ParamKind::Float4 => "float4",
            ParamKind::Float8 => "float8",
            ParamKind::Numeric => "numeric",
            ParamKind::Bool => "bool",
            ParamKind::Uuid => "uuid",
            ParamKind::Date => "date",
            ParamKind::Time => "time",
            ParamKind::Timestamp => "timestamp",
            ParamKind::Timestamptz => "timestamptz",
            ParamKind::Jsonb => "jsonb",
            ParamKind::Text => "text",
        }
    }

    /// NULL stays typed so the statement keeps the inferred parameter type.
    fn convert(self, text: Option<&str>) -> std::result::Result<TypedArg, String> {
        Ok(match self {
            ParamKind::Int2 => TypedArg::Int2(parse(text)?),
            ParamKind::Int4 => TypedArg::Int4(parse(text)?),
            ParamKind::Int8 => TypedArg::Int8(parse(text)?),
            ParamKind::Float4 => TypedArg::Float4(parse(text)?),
            ParamKind::Float8 => TypedArg::Float8(parse(text)?),
            ParamKind::Numeric => TypedArg::Numeric(parse(text)?),
            ParamKind::Bool => TypedArg::Bool(text.map(parse_bool).transpose()?),
            ParamKind::Uuid => TypedArg::Uuid(parse(text)?),
            ParamKind::Date => TypedArg::Date(parse(text)?),
            ParamKind::Time => TypedArg::Time(parse(text)?),
            ParamKind::Timestamp => TypedArg::Timestamp(text.map(parse_timestamp).transpose()?),
            ParamKind::Timestamptz => {
                TypedArg::Timestamptz(text.map(parse_timestamptz).transpose()?)
            }
            ParamKind::Jsonb => TypedArg::Jsonb(parse(text)?),
            ParamKind::Text => TypedArg::Text(text.map(str::to_string)),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum TypedArg {
    Int2(Option<i16>),
    Int4(Option<i32>),
    Int8(Option<i64>),
    Float4(Option<f32>),
    Float8(Option<f64>),
    Numeric(Option<Decimal>),
    Bool(Option<bool>),
    Uuid(Option<Uuid>),
    Date(Option<NaiveDate>),
    Time(Option<NaiveTime>),
    Timestamp(Option<NaiveDateTime>),
    Timestamptz(Option<DateTime<Utc>>),
    Jsonb(Option<Value>),
    Text(Option<String>),
}

impl TypedArg {
    fn bind(self, query: PgQuery<'_>) -> PgQuery<'_> {
        match self {
            TypedArg::Int2(v) => query.bind(v),
            TypedArg::Int4(v) => query.bind(v),
            TypedArg::Int8(v) => query.bind(v),
            TypedArg::Float4(v) => query.bind(v),
            TypedArg::Float8(v) => query.bind(v),
            TypedArg::Numeric(v) => query.bind(v),
            TypedArg::Bool(v) => query.bind(v),
            TypedArg::Uuid(v) => query.bind(v),
            TypedArg::Date(v) => query.bind(v),
            TypedArg::Time(v) => query.bind(v),
            TypedArg::Timestamp(v) => query.bind(v),
            TypedArg::Timestamptz(v) => query.bind(v),
            TypedArg::Jsonb(v) => query.bind(v),
            TypedArg::Text(v) => query.bind(v),
        }
    }
}

fn typed_args(kinds: &[ParamKind], args: &[Arg]) -> Result<Vec<TypedArg>> {
    args.iter()
        .enumerate()
        .map(|(i, arg)| {
            let kind = kinds.get(i).copied().unwrap_or(ParamKind::Text);
            kind.convert(arg.as_deref()).map_err(|e| {
                Error::Execution(format!(
                    "Invalid value for parameter ${} ({}): {}",
                    i + 1,
                    kind.name(),
                    e
                ))
            })
        })
        .collect()
}

fn parse<T>(text: Option<&str>) -> std::result::Result<Option<T>, String>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    text.map(|t| t.trim().parse::<T>().map_err(|e| e.to_string()))
        .transpose()
}

fn parse_bool(text: &str) -> std::result::Result<bool, String> {
    match text.trim().to_ascii_lowercase().as_str() {
        "t" | "true" | "y" | "yes" | "on" | "1" => Ok(true),
        "f" | "false" | "n" | "no" | "off" | "0" => Ok(false),
        other => Err(format!("not a boolean: {}", other)),
    }
}

fn parse_timestamp(text: &str) -> std::result::Result<NaiveDateTime, String> {
    let text = text.trim();
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
        .ok_or_else(|| format!("not a timestamp: {}", text))
}

/// RFC 3339, Postgres text output, or a zone-less timestamp taken as UTC.
fn parse_timestamptz(text: &str) -> std::result::Result<DateTime<Utc>, String> {
    let text = text.trim();
    DateTime::parse_from_rfc3339(text)
        .or_else(|_| DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z"))
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| parse_timestamp(text).map(|naive| naive.and_utc()))
}

fn row_to_values(row: &PgRow) -> Result<Row> {
    row.columns()
        .iter()
        .map(|column| {
            let name = column.name();
            let type_info = column.type_info();
            let value = column_value(row, name, type_info.name(), type_info.kind())?;
            Ok((name.to_string(), value))
        })
        .collect()
}

fn get<'r, T>(row: &'r PgRow, name: &str) -> Result<Option<T>>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get::<Option<T>, _>(name).map_err(Error::from)
}

fn get_array<'r, T>(row: &'r PgRow, name: &str, to_value: fn(T) -> Value) -> Result<Value>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
    Vec<Option<T>>: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    Ok(get::<Vec<Option<T>>>(row, name)?
        .map(|items| {
            Value::Array(
                items
                    .into_iter()
                    .map(|item| item.map_or(Value::Null, to_value))
                    .collect(),
            )
        })
        .unwrap_or(Value::Null))
}

fn column_value(row: &PgRow, name: &str, type_name: &str, kind: &PgTypeKind) -> Result<Value> {
    let value = match type_name.to_ascii_uppercase().as_str() {
        "INT2" => get::<i16>(row, name)?.map(Value::from),
        "INT4" => get::<i32>(row, name)?.map(Value::from),
        "INT8" => get::<i64>(row, name)?.map(Value::from),
        "FLOAT4" => get::<f32>(row, name)?.map(Value::from),
        "FLOAT8" => get::<f64>(row, name)?.map(Value::from),
        "NUMERIC" => get::<Decimal>(row, name)?.map(decimal_value),
        "BOOL" => get::<bool>(row, name)?.map(Value::Bool),
        "JSON" | "JSONB" => get::<Value>(row, name)?,
        "UUID" => get::<Uuid>(row, name)?.map(|v| Value::String(v.to_string())),
        "TIMESTAMPTZ" => get::<DateTime<Utc>>(row, name)?.map(|v| Value::String(v.to_rfc3339())),
        "TIMESTAMP" => get::<NaiveDateTime>(row, name)?.map(|v| Value::String(v.to_string())),
        "DATE" => get::<NaiveDate>(row, name)?.map(|v| Value::String(v.to_string())),
        "TIME" => get::<NaiveTime>(row, name)?.map(|v| Value::String(v.to_string())),
        "INTERVAL" => get::<PgInterval>(row, name)?.map(interval_value),
        "BYTEA" => get::<Vec<u8>>(row, name)?.map(|v| Value::String(BASE64.encode(v))),
        "INET" | "CIDR" => get::<IpNetwork>(row, name)?.map(|v| Value::String(v.to_string())),
        "TEXT" | "VARCHAR" | "CHAR" | "BPCHAR" | "NAME" => {
            get::<String>(row, name)?.map(Value::String)
        }
        "INT2[]" => Some(get_array::<i16>(row, name, Value::from)?),
        "INT4[]" => Some(get_array::<i32>(row, name, Value::from)?),
        "INT8[]" => Some(get_array::<i64>(row, name, Value::from)?),
        "FLOAT4[]" => Some(get_array::<f32>(row, name, Value::from)?),
        "FLOAT8[]" => Some(get_array::<f64>(row, name, Value::from)?),
        "NUMERIC[]" => Some(get_array::<Decimal>(row, name, decimal_value)?),
        "BOOL[]" => Some(get_array::<bool>(row, name, Value::Bool)?),
        "UUID[]" => Some(get_array::<Uuid>(row, name, |v| Value::String(v.to_string()))?),
        "JSONB[]" | "JSON[]" => Some(get_array::<Value>(row, name, |v| v)?),
        "DATE[]" => Some(get_array::<NaiveDate>(row, name, |v| Value::String(v.to_string()))?),
        "TIMESTAMPTZ[]" => Some(get_array::<DateTime<Utc>>(row, name, |v| {
            Value::String(v.to_rfc3339())
        })?),
        "TEXT[]" | "VARCHAR[]" | "BPCHAR[]" | "NAME[]" => {
            Some(get_array::<String>(row, name, Value::String)?)
        }
        // Enum and citext values travel as their UTF-8 label.
        _ if matches!(kind, PgTypeKind::Enum(_)) || type_name.eq_ignore_ascii_case("citext") => row
            .try_get_unchecked::<Option<String>, _>(name)
            .map_err(Error::from)?
            .map(Value::String),
        _ => {
            return Err(Error::Execution(format!(
                "Column \"{}\" has unsupported type {}; cast it to text in the query",
                name, type_name
            )))
        }
    };
    Ok(value.unwrap_or(Value::Null))
}

/// A JSON number when it parses as one, the exact text otherwise.
fn decimal_value(v: Decimal) -> Value {
    let text = v.to_string();
    serde_json::Number::from_str(&text)
        .map(Value::Number)
        .unwrap_or(Value::String(text))
}

fn interval_value(v: PgInterval) -> Value {
    json!({
        "months": v.months,
        "days": v.days,
        "microseconds": v.microseconds,
    })
}
